use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use envrepair_core::PackageEntry;
use serde::Serialize;
use serde_json::Value;

use crate::parse::{
    parse_channels, parse_info, parse_list_entries, parse_revisions, parse_search_names,
};
use crate::{CommandOutput, CommandRunner, CommandSpec, GatewayError};

const NO_PLUGINS_ENV: &str = "CONDA_NO_PLUGINS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerKind {
    Conda,
    Mamba,
    Micromamba,
}

impl ManagerKind {
    pub fn program(self) -> &'static str {
        match self {
            Self::Conda => "conda",
            Self::Mamba => "mamba",
            Self::Micromamba => "micromamba",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "conda" => Some(Self::Conda),
            "mamba" => Some(Self::Mamba),
            "micromamba" => Some(Self::Micromamba),
            _ => None,
        }
    }

    /// Plugin loading failures in conda are common enough that a failed call
    /// is retried once with plugins disabled.
    fn retries_without_plugins(self) -> bool {
        self == Self::Conda
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallOptions {
    pub ignore_pins: bool,
    pub force_reinstall: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanScope {
    IndexCache,
    TempFiles,
    Tarballs,
    All,
}

impl CleanScope {
    pub fn flag(self) -> &'static str {
        match self {
            Self::IndexCache => "--index-cache",
            Self::TempFiles => "--tempfiles",
            Self::Tarballs => "--tarballs",
            Self::All => "--all",
        }
    }
}

/// Where `env create` should place a new environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum EnvTarget {
    Path(PathBuf),
    Name(String),
}

impl EnvTarget {
    /// Anything that looks like a filesystem location is a path, everything
    /// else a named environment.
    pub fn parse(raw: &str) -> Self {
        if raw.contains(['/', '\\', ':']) {
            Self::Path(PathBuf::from(raw))
        } else {
            Self::Name(raw.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManagerInfo {
    pub base_prefix: Option<PathBuf>,
    pub env_paths: Vec<PathBuf>,
    pub pkgs_dirs: Vec<PathBuf>,
}

/// Typed access to one conda-family manager over an injectable runner.
#[derive(Debug, Clone)]
pub struct PackageManager<R> {
    kind: ManagerKind,
    runner: R,
}

impl<R: CommandRunner> PackageManager<R> {
    pub fn new(kind: ManagerKind, runner: R) -> Self {
        Self { kind, runner }
    }

    pub fn kind(&self) -> ManagerKind {
        self.kind
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    fn capture_with_retry(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError> {
        let output = self.runner.capture(command)?;
        if output.success() || !self.kind.retries_without_plugins() {
            return Ok(output);
        }
        tracing::debug!(command = %command, "retrying without plugins");
        self.runner.capture(&without_plugins(command))
    }

    fn live_with_retry(&self, command: &CommandSpec) -> Result<bool, GatewayError> {
        if self.runner.live(command)? == 0 {
            return Ok(true);
        }
        if !self.kind.retries_without_plugins() {
            return Ok(false);
        }
        tracing::debug!(command = %command, "retrying without plugins");
        Ok(self.runner.live(&without_plugins(command))? == 0)
    }

    fn capture_json(&self, command: &CommandSpec) -> Result<Option<Value>, GatewayError> {
        let output = self.capture_with_retry(command)?;
        if !output.success() && output.stdout.trim().is_empty() {
            tracing::debug!(
                command = %command,
                status = output.status,
                "command failed: {}",
                output.stderr.trim()
            );
            return Ok(None);
        }
        match serde_json::from_str::<Value>(output.stdout.trim()) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                tracing::debug!(command = %command, "unparseable JSON output: {err}");
                Ok(None)
            }
        }
    }

    pub fn info(&self) -> Result<Option<ManagerInfo>, GatewayError> {
        Ok(self
            .capture_json(&build_info_command(self.kind))?
            .map(|value| parse_info(&value)))
    }

    pub fn list_installed(&self, prefix: &Path) -> Result<Vec<PackageEntry>, GatewayError> {
        let output = self.capture_with_retry(&build_list_command(self.kind, prefix))?;
        if !output.success() {
            tracing::warn!(
                "{} list failed for {}: {}",
                self.kind.program(),
                prefix.display(),
                output.stderr.trim()
            );
            return Ok(Vec::new());
        }
        Ok(parse_list_entries(&output.stdout))
    }

    /// An empty package set is a successful no-op.
    pub fn install(
        &self,
        prefix: &Path,
        packages: &[String],
        channels: &[String],
        options: InstallOptions,
    ) -> Result<bool, GatewayError> {
        if packages.is_empty() {
            return Ok(true);
        }
        let command = build_install_command(self.kind, prefix, packages, channels, options);
        Ok(self.runner.live(&command)? == 0)
    }

    pub fn remove(&self, prefix: &Path, packages: &[String]) -> Result<bool, GatewayError> {
        if packages.is_empty() {
            return Ok(true);
        }
        Ok(self.runner.live(&build_remove_command(self.kind, prefix, packages))? == 0)
    }

    pub fn search(
        &self,
        terms: &[String],
        channels: &[String],
    ) -> Result<BTreeSet<String>, GatewayError> {
        if terms.is_empty() {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .capture_json(&build_search_command(self.kind, terms, channels))?
            .map(|value| parse_search_names(&value))
            .unwrap_or_default())
    }

    pub fn dry_run_install(
        &self,
        prefix: &Path,
        packages: &[String],
    ) -> Result<CommandOutput, GatewayError> {
        self.capture_with_retry(&build_dry_run_install_command(self.kind, prefix, packages))
    }

    /// Writes the environment definition to `destination`, creating parents.
    pub fn export_definition(&self, prefix: &Path, destination: &Path) -> Result<bool, GatewayError> {
        let output = self.runner.capture(&build_export_command(self.kind, prefix))?;
        if !output.success() {
            tracing::warn!(
                "environment export failed for {}: {}",
                prefix.display(),
                output.stderr.trim()
            );
            return Ok(false);
        }
        write_output(destination, &output.stdout)?;
        Ok(true)
    }

    pub fn create_from_definition(
        &self,
        definition: &Path,
        target: &EnvTarget,
    ) -> Result<bool, GatewayError> {
        Ok(self
            .runner
            .live(&build_create_command(self.kind, definition, target))?
            == 0)
    }

    pub fn update_from_definition(
        &self,
        prefix: &Path,
        definition: &Path,
    ) -> Result<bool, GatewayError> {
        Ok(self
            .runner
            .live(&build_update_command(self.kind, prefix, definition))?
            == 0)
    }

    pub fn list_revisions(&self, prefix: &Path) -> Result<BTreeSet<u64>, GatewayError> {
        let output = self
            .runner
            .capture(&build_revisions_command(self.kind, prefix))?;
        if !output.success() {
            return Ok(BTreeSet::new());
        }
        Ok(parse_revisions(&output.stdout))
    }

    pub fn rollback_to_revision(
        &self,
        prefix: &Path,
        revision: u64,
        dry_run: bool,
    ) -> Result<bool, GatewayError> {
        let command = build_rollback_command(self.kind, prefix, revision, dry_run);
        Ok(self.runner.live(&command)? == 0)
    }

    pub fn clean(&self, scope: CleanScope, assume_yes: bool) -> Result<bool, GatewayError> {
        self.live_with_retry(&build_clean_command(self.kind, scope, assume_yes))
    }

    pub fn configured_channels(&self) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .capture_json(&build_channels_command(self.kind))?
            .map(|value| parse_channels(&value))
            .unwrap_or_default())
    }
}

fn write_output(destination: &Path, content: &str) -> Result<(), GatewayError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|source| GatewayError::Output {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(destination, content).map_err(|source| GatewayError::Output {
        path: destination.to_path_buf(),
        source,
    })
}

fn without_plugins(command: &CommandSpec) -> CommandSpec {
    let mut retried = command.clone();
    retried.env(NO_PLUGINS_ENV, "true");
    retried
}

fn base_command(kind: ManagerKind) -> CommandSpec {
    CommandSpec::new(kind.program())
}

pub(crate) fn build_info_command(kind: ManagerKind) -> CommandSpec {
    let mut command = base_command(kind);
    match kind {
        ManagerKind::Micromamba => command.arg("env").arg("list").arg("--json"),
        ManagerKind::Conda | ManagerKind::Mamba => command.arg("info").arg("--json"),
    };
    command
}

pub(crate) fn build_list_command(kind: ManagerKind, prefix: &Path) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("list").arg("-p").path_arg(prefix).arg("--json");
    command
}

pub(crate) fn build_install_command(
    kind: ManagerKind,
    prefix: &Path,
    packages: &[String],
    channels: &[String],
    options: InstallOptions,
) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("install").arg("-y").arg("-p").path_arg(prefix);
    if options.force_reinstall {
        command.arg("--force-reinstall");
    }
    if options.ignore_pins {
        command.arg("--no-pin");
    }
    for channel in channels {
        command.arg("-c").arg(channel.clone());
    }
    command.args(packages.iter().cloned());
    command
}

pub(crate) fn build_remove_command(
    kind: ManagerKind,
    prefix: &Path,
    packages: &[String],
) -> CommandSpec {
    let mut command = base_command(kind);
    command
        .arg("remove")
        .arg("-y")
        .arg("-p")
        .path_arg(prefix)
        .args(packages.iter().cloned());
    command
}

pub(crate) fn build_search_command(
    kind: ManagerKind,
    terms: &[String],
    channels: &[String],
) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("search").args(terms.iter().cloned());
    for channel in channels {
        command.arg("-c").arg(channel.clone());
    }
    command.arg("--json");
    command
}

pub(crate) fn build_dry_run_install_command(
    kind: ManagerKind,
    prefix: &Path,
    packages: &[String],
) -> CommandSpec {
    let mut command = base_command(kind);
    command
        .arg("install")
        .arg("-y")
        .arg("-p")
        .path_arg(prefix)
        .arg("--dry-run")
        .args(packages.iter().cloned());
    command
}

pub(crate) fn build_export_command(kind: ManagerKind, prefix: &Path) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("env").arg("export").arg("-p").path_arg(prefix);
    command
}

pub(crate) fn build_create_command(
    kind: ManagerKind,
    definition: &Path,
    target: &EnvTarget,
) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("env").arg("create").arg("-f").path_arg(definition);
    match target {
        EnvTarget::Path(path) => command.arg("-p").path_arg(path),
        EnvTarget::Name(name) => command.arg("-n").arg(name.clone()),
    };
    command
}

pub(crate) fn build_update_command(
    kind: ManagerKind,
    prefix: &Path,
    definition: &Path,
) -> CommandSpec {
    let mut command = base_command(kind);
    command
        .arg("env")
        .arg("update")
        .arg("-p")
        .path_arg(prefix)
        .arg("-f")
        .path_arg(definition);
    command
}

pub(crate) fn build_revisions_command(kind: ManagerKind, prefix: &Path) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("list").arg("--revisions").arg("-p").path_arg(prefix);
    command
}

pub(crate) fn build_rollback_command(
    kind: ManagerKind,
    prefix: &Path,
    revision: u64,
    dry_run: bool,
) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("install");
    if dry_run {
        command.arg("--dry-run");
    }
    command
        .arg("-y")
        .arg("-p")
        .path_arg(prefix)
        .arg("--revision")
        .arg(revision.to_string());
    command
}

pub(crate) fn build_clean_command(
    kind: ManagerKind,
    scope: CleanScope,
    assume_yes: bool,
) -> CommandSpec {
    let mut command = base_command(kind);
    command.arg("clean").arg(scope.flag());
    if assume_yes {
        command.arg("-y");
    }
    command
}

pub(crate) fn build_channels_command(kind: ManagerKind) -> CommandSpec {
    let mut command = base_command(kind);
    match kind {
        ManagerKind::Conda => command
            .arg("config")
            .arg("--show")
            .arg("channels")
            .arg("--json"),
        ManagerKind::Mamba | ManagerKind::Micromamba => {
            command.arg("config").arg("list").arg("--json")
        }
    };
    command
}
