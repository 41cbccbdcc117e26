use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use envrepair_core::SnapshotKind;

pub const DEFAULT_WORK_DIR: &str = ".env_repair";

/// Working directory holding snapshots, interruption state and config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkLayout {
    root: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn snapshot_dir(&self, env_name: &str, timestamp: u64) -> PathBuf {
        self.snapshots_dir().join(format!("{env_name}-{timestamp}"))
    }

    pub fn snapshot_path(&self, env_name: &str, timestamp: u64, kind: SnapshotKind) -> PathBuf {
        self.snapshot_dir(env_name, timestamp).join(kind.file_name())
    }

    pub fn state_path(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.root.clone(), self.snapshots_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create dir: {}", dir.display()))?;
        }
        Ok(())
    }

    /// A fresh snapshot directory; a numeric suffix avoids clobbering a
    /// snapshot taken within the same second.
    pub fn allocate_snapshot_dir(&self, env_name: &str, timestamp: u64) -> Result<PathBuf> {
        let mut candidate = self.snapshot_dir(env_name, timestamp);
        let mut attempt = 1;
        while candidate.exists() {
            candidate = self
                .snapshots_dir()
                .join(format!("{env_name}-{timestamp}-{attempt}"));
            attempt += 1;
        }
        fs::create_dir_all(&candidate)
            .with_context(|| format!("failed to create snapshot dir: {}", candidate.display()))?;
        Ok(candidate)
    }
}
