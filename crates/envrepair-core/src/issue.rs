use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Location and identity of one `conda-meta` record, parsed from its file name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecordRef {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

impl MetadataRecordRef {
    /// Splits `name-version-build.json` from the right so dashed names survive.
    pub fn from_path(path: PathBuf) -> Self {
        let stem = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(".json"))
            .map(str::to_string);

        let (package, version, build) = match stem {
            Some(stem) => {
                let mut parts = stem.rsplitn(3, '-');
                let build = parts.next().map(str::to_string);
                let version = parts.next().map(str::to_string);
                let package = parts.next().map(str::to_string);
                if package.is_some() {
                    (package, version, build)
                } else {
                    (None, None, None)
                }
            }
            None => (None, None, None),
        };

        Self {
            path,
            package,
            version,
            build,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IssueKind {
    MissingInterpreter,
    MissingSitePackages,
    DuplicateDistInfo,
    DuplicateNativeModule,
    InvalidArtifact,
    MetadataInvalid,
    MetadataMissingDependencies,
}

impl IssueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingInterpreter => "missing-interpreter",
            Self::MissingSitePackages => "missing-site-packages",
            Self::DuplicateDistInfo => "duplicate-dist-info",
            Self::DuplicateNativeModule => "duplicate-native-module",
            Self::InvalidArtifact => "invalid-artifact",
            Self::MetadataInvalid => "metadata-invalid",
            Self::MetadataMissingDependencies => "metadata-missing-dependencies",
        }
    }

    /// Kinds the repair pipeline has a phase for.
    pub fn is_repairable(self) -> bool {
        matches!(
            self,
            Self::DuplicateDistInfo
                | Self::InvalidArtifact
                | Self::MetadataInvalid
                | Self::MetadataMissingDependencies
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Issue {
    MissingInterpreter,
    MissingSitePackages,
    DuplicateDistInfo {
        package: String,
        versions: Vec<String>,
        paths: Vec<PathBuf>,
    },
    DuplicateNativeModule {
        base: String,
        files: Vec<String>,
        site_packages: PathBuf,
    },
    InvalidArtifact {
        name: String,
        path: PathBuf,
    },
    MetadataInvalid {
        record: MetadataRecordRef,
    },
    MetadataMissingDependencies {
        record: MetadataRecordRef,
    },
}

impl Issue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Self::MissingInterpreter => IssueKind::MissingInterpreter,
            Self::MissingSitePackages => IssueKind::MissingSitePackages,
            Self::DuplicateDistInfo { .. } => IssueKind::DuplicateDistInfo,
            Self::DuplicateNativeModule { .. } => IssueKind::DuplicateNativeModule,
            Self::InvalidArtifact { .. } => IssueKind::InvalidArtifact,
            Self::MetadataInvalid { .. } => IssueKind::MetadataInvalid,
            Self::MetadataMissingDependencies { .. } => IssueKind::MetadataMissingDependencies,
        }
    }

    /// Package the issue is attributed to, when there is one.
    pub fn package(&self) -> Option<&str> {
        match self {
            Self::DuplicateDistInfo { package, .. } => Some(package),
            Self::MetadataInvalid { record } | Self::MetadataMissingDependencies { record } => {
                record.package.as_deref()
            }
            _ => None,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::MissingInterpreter => "python interpreter not found".to_string(),
            Self::MissingSitePackages => "site-packages could not be located".to_string(),
            Self::DuplicateDistInfo {
                package, versions, ..
            } => format!(
                "{package} has {} installed versions: {}",
                versions.len(),
                versions.join(", ")
            ),
            Self::DuplicateNativeModule { base, files, .. } => {
                format!("{base} has duplicate native modules: {}", files.join(", "))
            }
            Self::InvalidArtifact { name, .. } => format!("stale artifact {name}"),
            Self::MetadataInvalid { record } => {
                format!("unreadable metadata record {}", record.path.display())
            }
            Self::MetadataMissingDependencies { record } => format!(
                "metadata record {} has no dependency list",
                record.path.display()
            ),
        }
    }
}
