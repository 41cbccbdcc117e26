use std::path::PathBuf;

use envrepair_core::{EnvironmentRecord, Fix, InterruptState, Issue, Snapshot};
use serde::Serialize;

pub const EXIT_OK: i32 = 0;
pub const EXIT_UNRESOLVED: i32 = 1;
pub const EXIT_PRECONDITION: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Report only, nothing was attempted.
    Scanned,
    /// Nothing needed repair.
    Clean,
    Planned,
    Declined,
    Repaired,
    Interrupted,
    Restored,
    RestoreFailed,
    Aborted,
}

impl Disposition {
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            Self::Interrupted | Self::Restored | Self::RestoreFailed | Self::Aborted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedAction {
    pub phase: &'static str,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub path: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub managed: bool,
    pub pinned: Vec<String>,
    /// Issues found by the initial scan.
    pub issues: Vec<Issue>,
    /// Issues the repair phases did not resolve.
    pub remaining: Vec<Issue>,
    pub fixes: Vec<Fix>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<PlannedAction>,
    pub snapshot: Option<Snapshot>,
    pub interrupted: Option<InterruptState>,
    pub post_scan: Option<EnvironmentRecord>,
    pub disposition: Disposition,
}

impl EnvironmentReport {
    pub fn new(record: &EnvironmentRecord, disposition: Disposition) -> Self {
        Self {
            path: record.path.clone(),
            interpreter: record.interpreter.clone(),
            managed: record.managed,
            pinned: record.pinned.clone(),
            issues: record.issues.clone(),
            remaining: record.issues.clone(),
            fixes: Vec::new(),
            plan: Vec::new(),
            snapshot: None,
            interrupted: None,
            post_scan: None,
            disposition,
        }
    }

    /// Any interruption counts, including one the user chose to resume past.
    pub fn was_interrupted(&self) -> bool {
        self.disposition.is_interrupted() || self.interrupted.is_some()
    }

    pub fn failed_fixes(&self) -> usize {
        self.fixes.iter().filter(|fix| !fix.succeeded).count()
    }

    /// A repair left something the pipeline knows how to fix.
    fn unresolved(&self) -> bool {
        if self.disposition != Disposition::Repaired {
            return false;
        }
        match &self.post_scan {
            Some(post) => post.has_repairable_issues(),
            None => self
                .remaining
                .iter()
                .any(|issue| issue.kind().is_repairable()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub ok: bool,
    pub exit_code: i32,
    pub environments: Vec<EnvironmentReport>,
}

impl RunReport {
    /// Interruption dominates, then failed fixes and unresolved issues.
    pub fn from_environments(environments: Vec<EnvironmentReport>) -> Self {
        let interrupted = environments
            .iter()
            .any(EnvironmentReport::was_interrupted);
        let failed = environments
            .iter()
            .any(|env| env.failed_fixes() > 0 || env.unresolved());

        let exit_code = if interrupted {
            EXIT_INTERRUPTED
        } else if failed {
            EXIT_UNRESOLVED
        } else {
            EXIT_OK
        };
        Self {
            ok: exit_code == EXIT_OK,
            exit_code,
            environments,
        }
    }
}
