use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{CommandRunner, GatewayError, ManagerKind, PackageManager};

/// Absolute paths of the conda-family executables found on `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectedManagers {
    pub conda: Option<PathBuf>,
    pub mamba: Option<PathBuf>,
    pub micromamba: Option<PathBuf>,
}

impl DetectedManagers {
    pub fn detect() -> Self {
        Self::from_lookup(|program| which::which(program).ok())
    }

    pub fn from_lookup(mut lookup: impl FnMut(&str) -> Option<PathBuf>) -> Self {
        Self {
            conda: lookup(ManagerKind::Conda.program()),
            mamba: lookup(ManagerKind::Mamba.program()),
            micromamba: lookup(ManagerKind::Micromamba.program()),
        }
    }

    pub fn has(&self, kind: ManagerKind) -> bool {
        match kind {
            ManagerKind::Conda => self.conda.is_some(),
            ManagerKind::Mamba => self.mamba.is_some(),
            ManagerKind::Micromamba => self.micromamba.is_some(),
        }
    }

    pub fn any(&self) -> bool {
        self.available().next().is_some()
    }

    /// Detected managers in preference order: mamba, conda, micromamba.
    pub fn available(&self) -> impl Iterator<Item = ManagerKind> + '_ {
        [ManagerKind::Mamba, ManagerKind::Conda, ManagerKind::Micromamba]
            .into_iter()
            .filter(|kind| self.has(*kind))
    }

    pub fn preferred(&self) -> Option<ManagerKind> {
        self.available().next()
    }

    /// Revision history is only exposed by conda and mamba.
    pub fn revision_capable(&self) -> Option<ManagerKind> {
        [ManagerKind::Conda, ManagerKind::Mamba]
            .into_iter()
            .find(|kind| self.has(*kind))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvironmentInventory {
    pub environments: Vec<PathBuf>,
    pub base_prefix: Option<PathBuf>,
    pub manager: Option<ManagerKind>,
    pub pkgs_dirs: Vec<PathBuf>,
}

impl EnvironmentInventory {
    /// Union of the active prefix and every environment the detected
    /// managers report. Only paths that exist are kept.
    pub fn discover<R: CommandRunner>(
        managers: &DetectedManagers,
        runner: &R,
        active_prefix: Option<PathBuf>,
    ) -> Result<Self, GatewayError> {
        let mut environments = BTreeSet::new();
        let mut inventory = Self::default();
        add_existing(&mut environments, active_prefix);

        for kind in managers.available() {
            let manager = PackageManager::new(kind, runner);
            let Some(info) = manager.info()? else {
                tracing::debug!("{} did not report environment info", kind.program());
                continue;
            };
            for path in info.env_paths {
                add_existing(&mut environments, Some(path));
            }
            if inventory.base_prefix.is_none() {
                inventory.base_prefix = info.base_prefix;
            }
            if inventory.pkgs_dirs.is_empty() {
                inventory.pkgs_dirs = info.pkgs_dirs;
            }
            if inventory.manager.is_none() {
                inventory.manager = Some(kind);
            }
        }

        inventory.environments = environments.into_iter().collect();
        Ok(inventory)
    }

    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        self.environments
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
    }

    pub fn find_by_name(&self, name: &str) -> Option<&PathBuf> {
        self.environments.iter().find(|path| {
            path.file_name()
                .map(|file| file.to_string_lossy().eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }
}

fn add_existing(environments: &mut BTreeSet<PathBuf>, path: Option<PathBuf>) {
    if let Some(path) = path.filter(|path| !path.as_os_str().is_empty() && path.exists()) {
        environments.insert(path);
    }
}

/// Maps user targets onto environment prefixes.
///
/// With no targets every discovered environment is selected. A target is an
/// existing path, `base`, or the (case-insensitive) name of a discovered
/// environment. Unmatched targets are returned separately so the caller can
/// treat them as a precondition failure.
pub fn resolve_targets(
    inventory: &EnvironmentInventory,
    targets: &[String],
) -> (Vec<PathBuf>, Vec<String>) {
    if targets.is_empty() {
        return (inventory.environments.clone(), Vec::new());
    }

    let mut selected: Vec<PathBuf> = Vec::new();
    let mut unmatched = Vec::new();
    for target in targets {
        let candidate = Path::new(target);
        let resolved = if candidate.exists() {
            Some(candidate.canonicalize().unwrap_or_else(|_| candidate.to_path_buf()))
        } else if target.eq_ignore_ascii_case("base") {
            inventory.base_prefix.clone()
        } else {
            inventory.find_by_name(target).cloned()
        };

        match resolved {
            Some(path) if !selected.contains(&path) => selected.push(path),
            Some(_) => {}
            None => unmatched.push(target.clone()),
        }
    }
    (selected, unmatched)
}

pub fn interpreter_path(prefix: &Path) -> Option<PathBuf> {
    let candidates: &[&[&str]] = if cfg!(windows) {
        &[&["python.exe"], &["Scripts", "python.exe"]]
    } else {
        &[&["bin", "python"], &["bin", "python3"]]
    };
    candidates
        .iter()
        .map(|parts| parts.iter().fold(prefix.to_path_buf(), |path, part| path.join(part)))
        .find(|path| path.exists())
}

/// A prefix is managed by conda when it carries a `conda-meta` directory.
pub fn is_managed_environment(prefix: &Path) -> bool {
    prefix.join("conda-meta").is_dir()
}
