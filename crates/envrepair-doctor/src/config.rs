use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;

use envrepair_gateway::InstallOptions;
use envrepair_resolver::InstallerPreference;
use serde::Deserialize;

use crate::WorkLayout;

pub const DEFAULT_CHANNEL: &str = "conda-forge";

const REAL_RECORD_KEYS: &[&str] = &[
    "subdir",
    "files",
    "url",
    "channel",
    "md5",
    "sha256",
    "build_number",
];
const IDENTITY_KEYS: &[&str] = &["name", "version", "build"];

/// Signals that decide whether a `conda-meta` record without `depends` is a
/// genuine broken record or a minimal helper marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeuristics {
    /// Any of these marks the record as describing a real installed package.
    pub real_record_keys: Vec<String>,
    /// All of these must be present or the record is incomplete.
    pub identity_keys: Vec<String>,
}

impl Default for MetadataHeuristics {
    fn default() -> Self {
        Self {
            real_record_keys: REAL_RECORD_KEYS.iter().map(|key| key.to_string()).collect(),
            identity_keys: IDENTITY_KEYS.iter().map(|key| key.to_string()).collect(),
        }
    }
}

/// How mutating operations obtain the user's consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Approval {
    /// Ask when interactive, decline otherwise.
    #[default]
    Prompt,
    /// Blanket approval given up front.
    Granted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorConfig {
    pub channels: Vec<String>,
    pub install: InstallOptions,
    pub prefer: InstallerPreference,
    pub pip_fallback: bool,
    pub adopt_pip: bool,
    pub uninstall_pip: bool,
    pub approval: Approval,
    pub plan: bool,
    pub heuristics: MetadataHeuristics,
    /// Where the pre-repair snapshot is written instead of `snapshots/`.
    pub snapshot_path: Option<PathBuf>,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            channels: vec![DEFAULT_CHANNEL.to_string()],
            install: InstallOptions {
                ignore_pins: false,
                force_reinstall: true,
            },
            prefer: InstallerPreference::Auto,
            pip_fallback: false,
            adopt_pip: false,
            uninstall_pip: true,
            approval: Approval::Prompt,
            plan: false,
            heuristics: MetadataHeuristics::default(),
            snapshot_path: None,
        }
    }
}

/// Optional `<workdir>/config.toml`. Every field is optional and only
/// supplies a default the command line can override.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub prefer: Option<InstallerPreference>,
    #[serde(default)]
    pub pip_fallback: Option<bool>,
    #[serde(default)]
    pub ignore_pinned: Option<bool>,
    #[serde(default)]
    pub metadata: Option<FileHeuristics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileHeuristics {
    #[serde(default)]
    pub real_record_keys: Option<Vec<String>>,
    #[serde(default)]
    pub identity_keys: Option<Vec<String>>,
}

impl FileConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("failed to parse config")
    }

    pub fn heuristics(&self) -> MetadataHeuristics {
        let mut heuristics = MetadataHeuristics::default();
        if let Some(metadata) = &self.metadata {
            if let Some(keys) = &metadata.real_record_keys {
                heuristics.real_record_keys = keys.clone();
            }
            if let Some(keys) = &metadata.identity_keys {
                heuristics.identity_keys = keys.clone();
            }
        }
        heuristics
    }
}

pub fn load_file_config(layout: &WorkLayout) -> Result<FileConfig> {
    let path = layout.config_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(FileConfig::default()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config: {}", path.display()));
        }
    };
    FileConfig::from_toml_str(&raw).with_context(|| format!("invalid config: {}", path.display()))
}

/// Manager-configured channels first, then explicit ones, then the default
/// channel unless disabled. Order is preserved and duplicates dropped.
pub fn assemble_channels(
    from_manager: &[String],
    explicit: &[String],
    add_default: bool,
) -> Vec<String> {
    let mut channels: Vec<String> = Vec::new();
    let defaults = add_default.then(|| DEFAULT_CHANNEL.to_string());
    for channel in from_manager
        .iter()
        .chain(explicit.iter())
        .cloned()
        .chain(defaults)
    {
        let channel = channel.trim().to_string();
        if !channel.is_empty() && !channels.contains(&channel) {
            channels.push(channel);
        }
    }
    channels
}
