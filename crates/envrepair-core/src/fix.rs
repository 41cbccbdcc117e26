use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixMethod {
    #[serde(rename = "cleanup")]
    Cleanup,
    #[serde(rename = "mamba/conda")]
    Manager,
    #[serde(rename = "pip")]
    Pip,
    #[serde(rename = "pip-uninstall")]
    PipUninstall,
    #[serde(rename = "skip")]
    Skip,
    #[serde(rename = "restore")]
    Restore,
    #[serde(rename = "interrupted")]
    Interrupted,
}

impl FixMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Manager => "mamba/conda",
            Self::Pip => "pip",
            Self::PipUninstall => "pip-uninstall",
            Self::Skip => "skip",
            Self::Restore => "restore",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Why a fix was attempted. Rendered as English in reports, structured in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", rename_all = "kebab-case")]
pub enum FixReason {
    StaleArtifact,
    MetadataReinstall,
    DuplicateDistInfo,
    CrossChannelPipUninstall,
    CrossChannelRelink,
    ReinstallDuplicates,
    NoInstaller,
    AdoptInstall,
    AdoptSkipKeep {
        pip_name: String,
        pip_version: String,
        conda_name: String,
        conda_version: Option<String>,
    },
    AdoptPipUninstall,
    AdoptRelink,
    Interrupted {
        command: String,
    },
    SnapshotRestore,
}

impl FixReason {
    pub fn describe(&self) -> String {
        match self {
            Self::StaleArtifact => "removed stale installer artifact".to_string(),
            Self::MetadataReinstall => {
                "force-reinstalled packages with broken metadata records".to_string()
            }
            Self::DuplicateDistInfo => "removed duplicate dist-info directories".to_string(),
            Self::CrossChannelPipUninstall => {
                "uninstalled pip copies shadowing conda packages".to_string()
            }
            Self::CrossChannelRelink => "relinked conda packages after pip removal".to_string(),
            Self::ReinstallDuplicates => "reinstalled package after duplicate cleanup".to_string(),
            Self::NoInstaller => "no installer matches the preference".to_string(),
            Self::AdoptInstall => "installed conda equivalents of pip packages".to_string(),
            Self::AdoptSkipKeep {
                pip_name,
                pip_version,
                conda_name,
                conda_version,
            } => format!(
                "kept pip {pip_name} {pip_version}: conda {conda_name} is {}",
                conda_version.as_deref().unwrap_or("not installed")
            ),
            Self::AdoptPipUninstall => "uninstalled adopted pip packages".to_string(),
            Self::AdoptRelink => "relinked adopted conda packages".to_string(),
            Self::Interrupted { command } => format!("interrupted while running {command}"),
            Self::SnapshotRestore => "restored environment from snapshot".to_string(),
        }
    }
}

/// Outcome of one repair action. Success reflects the action, not the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fix {
    pub succeeded: bool,
    pub method: FixMethod,
    pub target: String,
    pub reason: FixReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl Fix {
    pub fn new(
        succeeded: bool,
        method: FixMethod,
        target: impl Into<String>,
        reason: FixReason,
    ) -> Self {
        Self {
            succeeded,
            method,
            target: target.into(),
            reason,
            count: None,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn result_label(&self) -> &'static str {
        if self.succeeded {
            "ok"
        } else {
            "failed"
        }
    }
}
