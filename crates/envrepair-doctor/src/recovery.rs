use anyhow::Result;
use envrepair_core::{InterruptState, Snapshot};
use envrepair_gateway::{CommandRunner, GatewayError};
use serde::Serialize;

use crate::interaction::approve;
use crate::report::{EXIT_INTERRUPTED, EXIT_OK, EXIT_UNRESOLVED};
use crate::{read_interrupt_state, Doctor, Interaction, PreconditionError};

#[derive(Debug, Clone, Serialize)]
pub struct ResumeReport {
    /// The recorded interruption, if any run left one behind.
    pub state: Option<InterruptState>,
    pub restore_requested: bool,
    pub approved: bool,
    pub restored: Option<bool>,
    pub interrupted: Option<InterruptState>,
}

impl ResumeReport {
    pub fn exit_code(&self) -> i32 {
        match (&self.interrupted, self.restored) {
            (Some(_), _) => EXIT_INTERRUPTED,
            (None, Some(false)) => EXIT_UNRESOLVED,
            _ => EXIT_OK,
        }
    }
}

impl<R: CommandRunner> Doctor<R> {
    /// Reports the last recorded interruption and, when `restore` is set,
    /// applies its snapshot back onto the interrupted environment.
    ///
    /// The state file is left in place; the next interruption overwrites it.
    pub fn resume<I: Interaction + ?Sized>(
        &self,
        restore: bool,
        interaction: &mut I,
    ) -> Result<ResumeReport> {
        let state = read_interrupt_state(self.layout())?;
        let mut report = ResumeReport {
            state: state.clone(),
            restore_requested: restore,
            approved: false,
            restored: None,
            interrupted: None,
        };
        let Some(state) = state.filter(|_| restore) else {
            return Ok(report);
        };

        let snapshot: Snapshot = state
            .snapshot
            .clone()
            .filter(Snapshot::is_restorable)
            .ok_or(PreconditionError::NoSnapshot)?;
        let prompt = format!(
            "Restore {} from {}?",
            state.target_prefix.display(),
            snapshot.path.display()
        );
        if !approve(self.config().approval, interaction, &prompt) {
            return Ok(report);
        }
        report.approved = true;

        match self.restore_snapshot(&state.target_prefix, &snapshot) {
            Ok(restored) => {
                if restored {
                    tracing::info!("restored {}", state.target_prefix.display());
                } else {
                    tracing::warn!("restore of {} failed", state.target_prefix.display());
                }
                report.restored = Some(restored);
            }
            Err(GatewayError::Interrupted { command }) => {
                report.interrupted = Some(self.record_interruption(
                    &state.target_prefix,
                    Some(&snapshot),
                    command,
                ));
            }
            Err(err) => {
                tracing::warn!("restore failed: {err}");
                report.restored = Some(false);
            }
        }
        Ok(report)
    }
}
