use std::path::Path;

use envrepair_core::{Fix, InterruptState};

use crate::Approval;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeChoice {
    Resume,
    Restore,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPhase {
    InvalidArtifacts,
    MetadataRecords,
    DuplicateDistInfo,
    CrossChannel,
    DuplicatePackages,
    AdoptPip,
}

impl RepairPhase {
    pub const ALL: [RepairPhase; 6] = [
        Self::InvalidArtifacts,
        Self::MetadataRecords,
        Self::DuplicateDistInfo,
        Self::CrossChannel,
        Self::DuplicatePackages,
        Self::AdoptPip,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidArtifacts => "remove invalid artifacts",
            Self::MetadataRecords => "reinstall broken metadata records",
            Self::DuplicateDistInfo => "remove duplicate dist-info",
            Self::CrossChannel => "resolve cross-channel conflicts",
            Self::DuplicatePackages => "reinstall duplicate packages",
            Self::AdoptPip => "adopt pip packages into conda",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Scanning,
    Snapshotting,
    Repairing(RepairPhase),
    Verifying,
}

impl RunPhase {
    pub fn label(self) -> &'static str {
        match self {
            Self::Scanning => "scan",
            Self::Snapshotting => "snapshot",
            Self::Repairing(phase) => phase.label(),
            Self::Verifying => "verify",
        }
    }
}

/// Progress notifications for front ends.
#[derive(Debug, Clone, Copy)]
pub enum RunEvent<'a> {
    EnvironmentStarted {
        prefix: &'a Path,
        index: usize,
        total: usize,
    },
    PhaseStarted(RunPhase),
    FixRecorded(&'a Fix),
}

/// The user-facing side of a run: confirmation prompts, the post-interrupt
/// choice and progress display.
pub trait Interaction {
    /// Whether prompts can be answered. When false, approval falls back to
    /// the blanket setting and interruptions stop the run.
    fn is_interactive(&self) -> bool;

    fn confirm(&mut self, prompt: &str) -> bool;

    fn choose_after_interrupt(&mut self, state: &InterruptState) -> ResumeChoice;

    fn notify(&mut self, _event: RunEvent<'_>) {}
}

/// Declines every prompt. Used for machine-readable output and scripting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

impl Interaction for NonInteractive {
    fn is_interactive(&self) -> bool {
        false
    }

    fn confirm(&mut self, _prompt: &str) -> bool {
        false
    }

    fn choose_after_interrupt(&mut self, _state: &InterruptState) -> ResumeChoice {
        ResumeChoice::Abort
    }
}

pub fn approve<I: Interaction + ?Sized>(approval: Approval, interaction: &mut I, prompt: &str) -> bool {
    match approval {
        Approval::Granted => true,
        Approval::Prompt if interaction.is_interactive() => interaction.confirm(prompt),
        Approval::Prompt => {
            tracing::info!("not approved: {prompt} (pass --yes to approve non-interactively)");
            false
        }
    }
}
