mod entry;
mod fix;
mod issue;
mod naming;
mod record;
mod revision;
mod snapshot;

pub use entry::{PackageEntry, PYPI_CHANNEL};
pub use fix::{Fix, FixMethod, FixReason};
pub use issue::{Issue, IssueKind, MetadataRecordRef};
pub use naming::{build_search_variants, normalize_name};
pub use record::EnvironmentRecord;
pub use revision::{InvalidRevisionTarget, RevisionTarget};
pub use snapshot::{InterruptState, Snapshot, SnapshotKind};
