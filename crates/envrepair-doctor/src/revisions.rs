use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use envrepair_core::{EnvironmentRecord, InterruptState, RevisionTarget, Snapshot, SnapshotKind};
use envrepair_gateway::{CommandRunner, EnvTarget, EnvironmentInventory, GatewayError};
use serde::Serialize;

use crate::interaction::approve;
use crate::report::{EXIT_INTERRUPTED, EXIT_OK, EXIT_UNRESOLVED};
use crate::{Doctor, Interaction, PreconditionError};

/// Maps a rollback target onto a concrete revision in `known`.
///
/// "Previous" is one below the current (highest) revision and must itself be
/// a known revision.
pub fn resolve_revision(
    known: &BTreeSet<u64>,
    target: RevisionTarget,
    prefix: &Path,
) -> Result<u64, PreconditionError> {
    let Some(&current) = known.last() else {
        return Err(PreconditionError::NoRevisions(prefix.display().to_string()));
    };
    let wanted = match target {
        RevisionTarget::Latest => Some(current),
        RevisionTarget::Previous => current.checked_sub(1),
        RevisionTarget::Number(number) => Some(number),
    };
    match wanted {
        Some(revision) if known.contains(&revision) => Ok(revision),
        _ => Err(PreconditionError::UnknownRevision {
            target: target.to_string(),
            known: known
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub prefix: PathBuf,
    pub known: Vec<u64>,
    pub current: u64,
    pub target: u64,
    pub dry_run: bool,
    pub planned: bool,
    pub approved: bool,
    pub snapshot: Option<Snapshot>,
    pub succeeded: bool,
    pub post_scan: Option<EnvironmentRecord>,
    pub interrupted: Option<InterruptState>,
}

impl RollbackReport {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted.is_some() {
            EXIT_INTERRUPTED
        } else if self.planned || !self.approved || self.succeeded {
            EXIT_OK
        } else {
            EXIT_UNRESOLVED
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub source: PathBuf,
    pub destination: String,
    pub planned: bool,
    pub approved: bool,
    pub snapshot: Option<Snapshot>,
    pub created: bool,
    pub verification: Option<EnvironmentRecord>,
    pub interrupted: Option<InterruptState>,
}

impl RebuildReport {
    pub fn exit_code(&self) -> i32 {
        if self.interrupted.is_some() {
            EXIT_INTERRUPTED
        } else if self.planned || !self.approved {
            EXIT_OK
        } else if !self.created
            || self
                .verification
                .as_ref()
                .is_some_and(EnvironmentRecord::has_repairable_issues)
        {
            EXIT_UNRESOLVED
        } else {
            EXIT_OK
        }
    }
}

fn destination_label(destination: &EnvTarget) -> String {
    match destination {
        EnvTarget::Path(path) => path.display().to_string(),
        EnvTarget::Name(name) => name.clone(),
    }
}

impl<R: CommandRunner> Doctor<R> {
    pub fn list_revisions(&self, prefix: &Path) -> Result<BTreeSet<u64>> {
        let manager = self
            .revision_manager()
            .ok_or(PreconditionError::NoManager)?;
        Ok(manager.list_revisions(prefix)?)
    }

    /// Rolls `prefix` back to a revision from its history. The target is
    /// validated before anything is snapshotted or changed.
    pub fn rollback<I: Interaction + ?Sized>(
        &self,
        prefix: &Path,
        target: RevisionTarget,
        dry_run: bool,
        interaction: &mut I,
    ) -> Result<RollbackReport> {
        let manager = self
            .revision_manager()
            .ok_or(PreconditionError::NoManager)?;
        let known = manager.list_revisions(prefix)?;
        let revision = resolve_revision(&known, target, prefix)?;

        let mut report = RollbackReport {
            prefix: prefix.to_path_buf(),
            current: known.last().copied().unwrap_or_default(),
            known: known.into_iter().collect(),
            target: revision,
            dry_run,
            planned: self.config().plan,
            approved: false,
            snapshot: None,
            succeeded: false,
            post_scan: None,
            interrupted: None,
        };
        if report.planned {
            tracing::info!(
                "plan: roll {} back to revision {revision}",
                prefix.display()
            );
            return Ok(report);
        }

        if !dry_run {
            let prompt = format!("Roll {} back to revision {revision}?", prefix.display());
            if !approve(self.config().approval, interaction, &prompt) {
                return Ok(report);
            }
        }
        report.approved = true;

        let result = (|| -> Result<bool, GatewayError> {
            if !dry_run {
                report.snapshot = Some(self.take_snapshot(prefix)?);
            }
            manager.rollback_to_revision(prefix, revision, dry_run)
        })();
        match result {
            Ok(succeeded) => report.succeeded = succeeded,
            Err(GatewayError::Interrupted { command }) => {
                report.interrupted =
                    Some(self.record_interruption(prefix, report.snapshot.as_ref(), command));
                return Ok(report);
            }
            Err(err) => {
                tracing::warn!("rollback failed: {err}");
            }
        }

        if !dry_run {
            match self.scan(prefix) {
                Ok(record) => report.post_scan = Some(record),
                Err(err) => tracing::warn!("post-rollback scan skipped: {err}"),
            }
        }
        Ok(report)
    }

    /// Recreates `prefix` at `destination` from a fresh export of its
    /// definition. The destination must not already exist as a path or as
    /// the name of a known environment.
    pub fn rebuild<I: Interaction + ?Sized>(
        &self,
        prefix: &Path,
        destination: &EnvTarget,
        inventory: &EnvironmentInventory,
        verify: bool,
        interaction: &mut I,
    ) -> Result<RebuildReport> {
        let manager = self.manager().ok_or(PreconditionError::NoManager)?;
        let label = destination_label(destination);
        let collides = match destination {
            EnvTarget::Path(path) => path.exists(),
            EnvTarget::Name(name) => inventory
                .names()
                .any(|known| known.eq_ignore_ascii_case(name)),
        };
        if collides {
            return Err(PreconditionError::DestinationExists(label).into());
        }

        let mut report = RebuildReport {
            source: prefix.to_path_buf(),
            destination: label,
            planned: self.config().plan,
            approved: false,
            snapshot: None,
            created: false,
            verification: None,
            interrupted: None,
        };
        if report.planned {
            tracing::info!(
                "plan: export {} and create {}",
                prefix.display(),
                report.destination
            );
            return Ok(report);
        }

        let prompt = format!(
            "Rebuild {} as {}?",
            prefix.display(),
            report.destination
        );
        if !approve(self.config().approval, interaction, &prompt) {
            return Ok(report);
        }
        report.approved = true;

        let result = (|| -> Result<bool, GatewayError> {
            let snapshot = self.take_snapshot(prefix)?;
            let usable = snapshot.is_restorable() && snapshot.kind == SnapshotKind::ManagerExport;
            let definition = snapshot.path.clone();
            report.snapshot = Some(snapshot);
            if !usable {
                tracing::warn!(
                    "no environment definition could be exported from {}",
                    prefix.display()
                );
                return Ok(false);
            }
            manager.create_from_definition(&definition, destination)
        })();
        match result {
            Ok(created) => report.created = created,
            Err(GatewayError::Interrupted { command }) => {
                report.interrupted =
                    Some(self.record_interruption(prefix, report.snapshot.as_ref(), command));
                return Ok(report);
            }
            Err(err) => tracing::warn!("rebuild failed: {err}"),
        }

        if report.created && verify {
            report.verification = self.verify_rebuilt(destination);
        }
        Ok(report)
    }

    fn verify_rebuilt(&self, destination: &EnvTarget) -> Option<EnvironmentRecord> {
        let prefix = match destination {
            EnvTarget::Path(path) => Some(path.clone()),
            EnvTarget::Name(name) => match self.discover(None) {
                Ok(inventory) => inventory.find_by_name(name).cloned(),
                Err(err) => {
                    tracing::warn!("could not locate rebuilt environment: {err}");
                    None
                }
            },
        }?;
        self.scan(&prefix)
            .map_err(|err| tracing::warn!("verification scan skipped: {err}"))
            .ok()
    }
}
