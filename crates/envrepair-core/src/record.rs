use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Issue, IssueKind};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub path: PathBuf,
    #[serde(default)]
    pub interpreter: Option<PathBuf>,
    #[serde(default)]
    pub site_packages: Vec<PathBuf>,
    #[serde(default)]
    pub managed: bool,
    #[serde(default)]
    pub pinned: Vec<String>,
    #[serde(default)]
    pub issues: Vec<Issue>,
}

impl EnvironmentRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Last path component, used for snapshot directory names and display.
    pub fn display_name(&self) -> String {
        environment_name(&self.path)
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn has_repairable_issues(&self) -> bool {
        self.issues.iter().any(|issue| issue.kind().is_repairable())
    }

    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |issue| issue.kind() == kind)
    }

    pub fn remove_kind(&mut self, kind: IssueKind) {
        self.issues.retain(|issue| issue.kind() != kind);
    }

    pub fn remove_matching(&mut self, mut predicate: impl FnMut(&Issue) -> bool) {
        self.issues.retain(|issue| !predicate(issue));
    }
}

fn environment_name(path: &Path) -> String {
    path.file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("env")
        .to_string()
}
