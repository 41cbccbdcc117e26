use std::collections::{BTreeMap, BTreeSet};

use envrepair_core::{build_search_variants, normalize_name, PackageEntry};
use serde::Serialize;

use crate::ChannelIndex;

/// Pip-only distributions: installed from pypi with no conda-channel entry
/// sharing their normalized name.
pub fn adoption_candidates(entries: &[PackageEntry]) -> Vec<&PackageEntry> {
    let index = ChannelIndex::build(entries);
    entries
        .iter()
        .filter(|entry| entry.is_pypi() && !index.has_managed_channel(&entry.normalized_name()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdoptionPlan {
    /// Candidate conda names per pip name, in resolution order.
    pub variants: BTreeMap<String, Vec<String>>,
    /// Exact and wildcard search terms, deduplicated in first-seen order.
    pub search_terms: Vec<String>,
    pub pip_versions: BTreeMap<String, String>,
}

impl AdoptionPlan {
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Maps each pip name to the first of its variants the manager reported
    /// as available. Unresolved names are left out.
    pub fn resolve(&self, available: &BTreeSet<String>) -> BTreeMap<String, String> {
        self.variants
            .iter()
            .filter_map(|(pip_name, variants)| {
                variants
                    .iter()
                    .find(|variant| available.contains(*variant))
                    .map(|variant| (pip_name.clone(), variant.clone()))
            })
            .collect()
    }
}

pub fn plan_adoption(entries: &[PackageEntry]) -> AdoptionPlan {
    let mut plan = AdoptionPlan::default();
    let mut seen = BTreeSet::new();
    for entry in adoption_candidates(entries) {
        let variants = build_search_variants(&entry.name);
        for variant in &variants {
            for term in [variant.clone(), format!("{variant}*")] {
                if seen.insert(term.clone()) {
                    plan.search_terms.push(term);
                }
            }
        }
        plan.pip_versions
            .insert(entry.name.clone(), entry.version.clone());
        plan.variants.insert(entry.name.clone(), variants);
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedUninstall {
    pub pip_name: String,
    pub pip_version: String,
    pub conda_name: String,
    pub conda_version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipUninstallPlan {
    pub uninstall: Vec<String>,
    pub skipped: Vec<SkippedUninstall>,
}

/// A pip copy is only removed when conda now provides the mapped package at
/// exactly the pip version. Alias mappings that landed a different version
/// keep the pip copy.
pub fn plan_pip_uninstall(
    adopted: &BTreeMap<String, String>,
    pip_versions: &BTreeMap<String, String>,
    refreshed: &[PackageEntry],
) -> PipUninstallPlan {
    let mut plan = PipUninstallPlan::default();
    for (pip_name, conda_name) in adopted {
        let pip_version = pip_versions.get(pip_name).cloned().unwrap_or_default();
        let wanted = normalize_name(conda_name);
        let conda_version = refreshed
            .iter()
            .find(|entry| entry.is_managed() && entry.normalized_name() == wanted)
            .map(|entry| entry.version.clone());

        match conda_version {
            Some(version) if !pip_version.is_empty() && version == pip_version => {
                plan.uninstall.push(pip_name.clone());
            }
            conda_version => plan.skipped.push(SkippedUninstall {
                pip_name: pip_name.clone(),
                pip_version,
                conda_name: conda_name.clone(),
                conda_version,
            }),
        }
    }
    plan
}
