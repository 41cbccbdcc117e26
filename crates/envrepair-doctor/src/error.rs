/// Conditions that stop a command before it touches any environment.
#[derive(Debug, thiserror::Error)]
pub enum PreconditionError {
    #[error("no supported package manager (mamba, conda, micromamba) was found on PATH")]
    NoManager,
    #[error("no environment matches: {}", .0.join(", "))]
    UnknownEnvironments(Vec<String>),
    #[error("no environments were discovered")]
    NoEnvironments,
    #[error("exactly one environment must be selected, got {0}")]
    AmbiguousEnvironment(usize),
    #[error("no revision history is available for {0}")]
    NoRevisions(String),
    #[error("revision {target} is not available (known: {known})")]
    UnknownRevision { target: String, known: String },
    #[error("invalid revision target '{0}': expected prev, latest or a number")]
    InvalidRevisionTarget(String),
    #[error("destination already exists: {0}")]
    DestinationExists(String),
    #[error("cannot read log file {path}: {reason}")]
    LogUnreadable { path: String, reason: String },
    #[error("no snapshot is available to restore")]
    NoSnapshot,
    #[error("failed to load configuration: {0}")]
    Config(String),
}
