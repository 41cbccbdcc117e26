use std::collections::{BTreeMap, BTreeSet};

use envrepair_core::PackageEntry;
use serde::Serialize;

use crate::index::shortest;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrossChannelConflicts {
    pub pip_to_remove: Vec<String>,
    pub conda_to_reinstall: Vec<String>,
}

impl CrossChannelConflicts {
    pub fn is_empty(&self) -> bool {
        self.pip_to_remove.is_empty() && self.conda_to_reinstall.is_empty()
    }
}

/// Finds pip distributions that duplicate a conda package at the exact same
/// version. The pip copy is removed and the conda package relinked, using the
/// shortest conda name at that version as the canonical one.
pub fn find_cross_channel_conflicts(entries: &[PackageEntry]) -> CrossChannelConflicts {
    let mut groups: BTreeMap<String, Vec<&PackageEntry>> = BTreeMap::new();
    for entry in entries {
        groups.entry(entry.normalized_name()).or_default().push(entry);
    }

    let mut pip_to_remove = BTreeSet::new();
    let mut conda_to_reinstall = BTreeSet::new();
    for members in groups.values() {
        let managed: Vec<&PackageEntry> = members
            .iter()
            .copied()
            .filter(|entry| entry.is_managed())
            .collect();
        if managed.is_empty() {
            continue;
        }

        for pip_entry in members.iter().filter(|entry| entry.is_pypi()) {
            let same_version = managed
                .iter()
                .filter(|entry| entry.version == pip_entry.version)
                .map(|entry| &entry.name);
            if let Some(conda_name) = shortest(same_version) {
                pip_to_remove.insert(pip_entry.name.clone());
                conda_to_reinstall.insert(conda_name);
            }
        }
    }

    CrossChannelConflicts {
        pip_to_remove: pip_to_remove.into_iter().collect(),
        conda_to_reinstall: conda_to_reinstall.into_iter().collect(),
    }
}
