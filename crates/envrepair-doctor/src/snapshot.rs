use std::path::Path;

use envrepair_core::{EnvironmentRecord, Snapshot, SnapshotKind};
use envrepair_gateway::{interpreter_path, is_managed_environment, CommandRunner, GatewayError};

use crate::{current_unix_timestamp, Doctor};

impl<R: CommandRunner> Doctor<R> {
    /// Captures the environment before it is mutated: a manager export for
    /// managed environments, a pip freeze otherwise. Failures produce an
    /// unsuccessful snapshot rather than an error; only interruption
    /// propagates. A configured snapshot path replaces the timestamped one
    /// under the work directory.
    pub fn take_snapshot(&self, prefix: &Path) -> Result<Snapshot, GatewayError> {
        let manager = self
            .manager()
            .filter(|_| is_managed_environment(prefix));
        let kind = if manager.is_some() {
            SnapshotKind::ManagerExport
        } else {
            SnapshotKind::PipFreeze
        };

        let path = match &self.config().snapshot_path {
            Some(path) => path.clone(),
            None => {
                let env_name = EnvironmentRecord::new(prefix).display_name();
                let timestamp = current_unix_timestamp().unwrap_or_default();
                match self.layout().allocate_snapshot_dir(&env_name, timestamp) {
                    Ok(dir) => dir.join(kind.file_name()),
                    Err(err) => {
                        tracing::warn!("snapshot skipped for {}: {err:#}", prefix.display());
                        return Ok(Snapshot {
                            path: self.layout().snapshot_path(&env_name, timestamp, kind),
                            succeeded: false,
                            kind,
                        });
                    }
                }
            }
        };

        let captured = match (&manager, interpreter_path(prefix)) {
            (Some(manager), _) => manager.export_definition(prefix, &path),
            (None, Some(python)) => self.pip(&python).freeze(&path),
            (None, None) => Ok(false),
        };
        let succeeded = match captured {
            Ok(succeeded) => succeeded,
            Err(err) if err.is_interrupted() => return Err(err),
            Err(err) => {
                tracing::warn!("snapshot failed for {}: {err}", prefix.display());
                false
            }
        };
        if !succeeded {
            tracing::warn!(
                "snapshot of {} failed; restore will be unavailable",
                prefix.display()
            );
        }

        Ok(Snapshot {
            path,
            succeeded,
            kind,
        })
    }

    /// Applies a snapshot back onto its environment.
    pub fn restore_snapshot(&self, prefix: &Path, snapshot: &Snapshot) -> Result<bool, GatewayError> {
        if !snapshot.is_restorable() || !snapshot.path.is_file() {
            return Ok(false);
        }
        match snapshot.kind {
            SnapshotKind::ManagerExport => match self.manager() {
                Some(manager) => manager.update_from_definition(prefix, &snapshot.path),
                None => Ok(false),
            },
            SnapshotKind::PipFreeze => match interpreter_path(prefix) {
                Some(python) => self.pip(&python).install_requirements(&snapshot.path),
                None => Ok(false),
            },
        }
    }
}
