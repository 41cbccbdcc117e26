use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotKind {
    ManagerExport,
    PipFreeze,
}

impl SnapshotKind {
    pub fn file_name(self) -> &'static str {
        match self {
            Self::ManagerExport => "env.yml",
            Self::PipFreeze => "requirements.txt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub succeeded: bool,
    pub kind: SnapshotKind,
}

impl Snapshot {
    pub fn is_restorable(&self) -> bool {
        self.succeeded
    }
}

/// Persisted when an external operation is cancelled so a later run can offer
/// to restore the snapshot that preceded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptState {
    pub target_prefix: PathBuf,
    #[serde(default)]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub interrupted_command: Vec<String>,
    pub timestamp: u64,
}

impl InterruptState {
    pub fn command_line(&self) -> String {
        self.interrupted_command.join(" ")
    }
}
