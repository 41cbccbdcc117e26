use std::collections::{BTreeMap, BTreeSet};

use envrepair_core::{normalize_name, PackageEntry, PYPI_CHANNEL};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallerPreference {
    #[default]
    Auto,
    Conda,
    Pip,
}

impl InstallerPreference {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "conda" => Some(Self::Conda),
            "pip" => Some(Self::Pip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Installer {
    Conda,
    Pip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallerChoice {
    pub installer: Installer,
    pub name: String,
}

impl InstallerChoice {
    fn new(installer: Installer, name: impl Into<String>) -> Self {
        Self {
            installer,
            name: name.into(),
        }
    }
}

/// Installed names grouped by normalized name, then by channel label.
#[derive(Debug, Clone, Default)]
pub struct ChannelIndex {
    by_name: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ChannelIndex {
    /// Entries without a channel carry no ownership information and are skipped.
    pub fn build(entries: &[PackageEntry]) -> Self {
        let mut by_name: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
        for entry in entries {
            let channel = entry.channel_label();
            if channel.is_empty() {
                continue;
            }
            by_name
                .entry(entry.normalized_name())
                .or_default()
                .entry(channel)
                .or_default()
                .insert(entry.name.clone());
        }
        Self { by_name }
    }

    pub fn has_managed_channel(&self, normalized: &str) -> bool {
        self.by_name
            .get(normalized)
            .map(|channels| channels.keys().any(|channel| channel != PYPI_CHANNEL))
            .unwrap_or(false)
    }

    fn pypi_name(&self, normalized: &str) -> Option<String> {
        self.by_name
            .get(normalized)
            .and_then(|channels| channels.get(PYPI_CHANNEL))
            .and_then(|names| shortest(names.iter()))
    }

    fn managed_name(&self, normalized: &str) -> Option<String> {
        self.by_name.get(normalized).and_then(|channels| {
            shortest(
                channels
                    .iter()
                    .filter(|(channel, _)| channel.as_str() != PYPI_CHANNEL)
                    .flat_map(|(_, names)| names.iter()),
            )
        })
    }
}

/// Shortest name wins; equal lengths fall back to lexical order.
pub(crate) fn shortest<'a>(names: impl Iterator<Item = &'a String>) -> Option<String> {
    names
        .min_by(|left, right| left.len().cmp(&right.len()).then_with(|| left.cmp(right)))
        .cloned()
}

/// Decides which installer should reinstall a package.
///
/// `None` means the preference declined the package: pip was requested, pip
/// does not know the package and fallback was not allowed.
pub fn choose_installer(
    index: &ChannelIndex,
    package: &str,
    preference: InstallerPreference,
    pip_fallback: bool,
) -> Option<InstallerChoice> {
    let normalized = normalize_name(package);
    match preference {
        InstallerPreference::Pip => match index.pypi_name(&normalized) {
            Some(name) => Some(InstallerChoice::new(Installer::Pip, name)),
            None if pip_fallback => Some(InstallerChoice::new(Installer::Pip, normalized)),
            None => None,
        },
        InstallerPreference::Auto | InstallerPreference::Conda => {
            if let Some(name) = index.managed_name(&normalized) {
                return Some(InstallerChoice::new(Installer::Conda, name));
            }
            if let Some(name) = index.pypi_name(&normalized) {
                return Some(InstallerChoice::new(Installer::Pip, name));
            }
            Some(InstallerChoice::new(Installer::Conda, normalized))
        }
    }
}
