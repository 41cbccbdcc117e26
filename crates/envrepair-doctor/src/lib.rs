mod config;
mod diagnostics;
mod error;
mod fs_utils;
mod interaction;
mod layout;
mod recovery;
mod repair;
mod report;
mod revisions;
mod scan;
mod session;
mod snapshot;
mod state;

pub use config::{
    assemble_channels, load_file_config, Approval, DoctorConfig, FileConfig, FileHeuristics,
    MetadataHeuristics, DEFAULT_CHANNEL,
};
pub use diagnostics::{
    extract_prefix_paths, file_owner_map, CacheLevel, ClobberConflict, ClobberReport, FileOwner,
    InconsistencyDiagnosis, InconsistencyLevel, MaintenanceAction, MaintenanceReport,
    OneShotReport, SslDiagnosis,
};
pub use error::PreconditionError;
pub use interaction::{
    approve, Interaction, NonInteractive, RepairPhase, ResumeChoice, RunEvent, RunPhase,
};
pub use layout::{WorkLayout, DEFAULT_WORK_DIR};
pub use recovery::ResumeReport;
pub use report::{
    Disposition, EnvironmentReport, PlannedAction, RunReport, EXIT_INTERRUPTED, EXIT_OK,
    EXIT_PRECONDITION, EXIT_UNRESOLVED,
};
pub use revisions::{resolve_revision, RebuildReport, RollbackReport};
pub use scan::{
    read_pinned_specs, scan_dist_info_duplicates, scan_environment, scan_invalid_artifacts,
    scan_metadata_records, scan_native_duplicates,
};
pub use session::Doctor;
pub use state::{current_unix_timestamp, read_interrupt_state, write_interrupt_state};

#[cfg(test)]
mod tests;
