use std::path::{Path, PathBuf};

use envrepair_core::{EnvironmentRecord, PackageEntry};
use envrepair_gateway::{
    CommandRunner, DetectedManagers, EnvironmentInventory, GatewayError, PackageManager,
    PipGateway,
};

use crate::{scan_environment, DoctorConfig, WorkLayout};

/// Everything one invocation needs: where to keep state, how to run
/// commands, which managers exist and how repairs should behave.
#[derive(Debug)]
pub struct Doctor<R> {
    layout: WorkLayout,
    runner: R,
    managers: DetectedManagers,
    config: DoctorConfig,
}

impl<R: CommandRunner> Doctor<R> {
    pub fn new(
        layout: WorkLayout,
        runner: R,
        managers: DetectedManagers,
        config: DoctorConfig,
    ) -> Self {
        Self {
            layout,
            runner,
            managers,
            config,
        }
    }

    pub fn layout(&self) -> &WorkLayout {
        &self.layout
    }

    pub fn config(&self) -> &DoctorConfig {
        &self.config
    }

    pub fn managers(&self) -> &DetectedManagers {
        &self.managers
    }

    /// Preferred manager for mutating calls.
    pub fn manager(&self) -> Option<PackageManager<&R>> {
        self.managers
            .preferred()
            .map(|kind| PackageManager::new(kind, &self.runner))
    }

    pub(crate) fn revision_manager(&self) -> Option<PackageManager<&R>> {
        self.managers
            .revision_capable()
            .map(|kind| PackageManager::new(kind, &self.runner))
    }

    pub(crate) fn pip(&self, python: &Path) -> PipGateway<&R> {
        PipGateway::new(python, &self.runner)
    }

    pub fn discover(&self, active_prefix: Option<PathBuf>) -> Result<EnvironmentInventory, GatewayError> {
        EnvironmentInventory::discover(&self.managers, &self.runner, active_prefix)
    }

    pub fn scan(&self, prefix: &Path) -> Result<EnvironmentRecord, GatewayError> {
        scan_environment(prefix, &self.runner, &self.config.heuristics)
    }

    /// Conda listing for managed environments (it includes pip entries),
    /// pip listing otherwise.
    pub fn installed_entries(
        &self,
        record: &EnvironmentRecord,
    ) -> Result<Vec<PackageEntry>, GatewayError> {
        if record.managed {
            if let Some(manager) = self.manager() {
                return manager.list_installed(&record.path);
            }
        }
        match &record.interpreter {
            Some(python) => self.pip(python).list_installed(),
            None => Ok(Vec::new()),
        }
    }
}
