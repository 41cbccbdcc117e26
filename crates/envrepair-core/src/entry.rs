use serde::{Deserialize, Serialize};

use crate::normalize_name;

/// Channel label the package managers report for pip-installed distributions.
pub const PYPI_CHANNEL: &str = "pypi";

/// One installed distribution as reported by a package manager or pip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub channel: String,
}

impl PackageEntry {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            channel: channel.into(),
        }
    }

    pub fn channel_label(&self) -> String {
        self.channel.trim().to_ascii_lowercase()
    }

    pub fn is_pypi(&self) -> bool {
        self.channel_label() == PYPI_CHANNEL
    }

    /// True when the entry came from a conda channel rather than pip.
    pub fn is_managed(&self) -> bool {
        let label = self.channel_label();
        !label.is_empty() && label != PYPI_CHANNEL
    }

    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}
