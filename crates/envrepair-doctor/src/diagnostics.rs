use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use envrepair_core::{EnvironmentRecord, InterruptState};
use envrepair_gateway::{
    interpreter_path, parse_inconsistent, CleanScope, CommandRunner, GatewayError, InstallOptions,
};
use serde::Serialize;
use serde_json::Value;

use crate::interaction::approve;
use crate::report::{EXIT_INTERRUPTED, EXIT_OK, EXIT_UNRESOLVED};
use crate::{Doctor, Interaction, PreconditionError, RunReport};

/// Package the solver is asked to (pretend to) install when probing for
/// inconsistency; every Python environment already has it.
const DRY_RUN_PACKAGE: &str = "python";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InconsistencyDiagnosis {
    pub prefix: PathBuf,
    pub inconsistent: bool,
    pub packages: Vec<String>,
    pub dry_run_exit: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InconsistencyLevel {
    Safe,
    Normal,
    Rebuild,
}

impl InconsistencyLevel {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "normal" => Some(Self::Normal),
            "rebuild" => Some(Self::Rebuild),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Normal => "normal",
            Self::Rebuild => "rebuild",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheLevel {
    Safe,
    Targeted,
    Aggressive,
}

impl CacheLevel {
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "safe" => Some(Self::Safe),
            "targeted" => Some(Self::Targeted),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Targeted => "targeted",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn scopes(self) -> &'static [CleanScope] {
        match self {
            Self::Safe => &[CleanScope::IndexCache, CleanScope::TempFiles],
            Self::Targeted => &[CleanScope::Tarballs],
            Self::Aggressive => &[CleanScope::All],
        }
    }
}

/// One step taken by a maintenance operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MaintenanceAction {
    Clean { scope: String, ok: bool },
    ForceReinstall { packages: Vec<String>, ok: bool },
    SuggestRebuild,
}

impl MaintenanceAction {
    pub fn succeeded(&self) -> bool {
        match self {
            Self::Clean { ok, .. } | Self::ForceReinstall { ok, .. } => *ok,
            Self::SuggestRebuild => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceReport {
    pub prefix: Option<PathBuf>,
    pub level: String,
    pub planned: bool,
    pub approved: bool,
    pub actions: Vec<MaintenanceAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pkgs_dirs: Vec<PathBuf>,
    pub post_scan: Option<EnvironmentRecord>,
    pub interrupted: Option<InterruptState>,
}

impl MaintenanceReport {
    fn new(prefix: Option<&Path>, level: &str, planned: bool) -> Self {
        Self {
            prefix: prefix.map(Path::to_path_buf),
            level: level.to_string(),
            planned,
            approved: false,
            actions: Vec::new(),
            pkgs_dirs: Vec::new(),
            post_scan: None,
            interrupted: None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.interrupted.is_some() {
            EXIT_INTERRUPTED
        } else if self.actions.iter().all(MaintenanceAction::succeeded) {
            EXIT_OK
        } else {
            EXIT_UNRESOLVED
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOwner {
    pub name: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
    pub record: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClobberConflict {
    pub path: String,
    pub relpath: Option<String>,
    pub owner: Option<FileOwner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClobberReport {
    pub prefix: PathBuf,
    pub conflicts: Vec<ClobberConflict>,
}

/// What the environment's interpreter reports for its `ssl` module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SslDiagnosis {
    pub prefix: PathBuf,
    pub python: Option<PathBuf>,
    pub ok: bool,
    /// `None` when there was no interpreter to ask.
    pub status: Option<i32>,
    pub openssl_version: Option<String>,
    pub stderr: String,
    pub manager: Option<String>,
    pub pkgs_dirs: Vec<PathBuf>,
}

impl SslDiagnosis {
    /// The interpreter's complaint, or its exit status when it said nothing.
    pub fn failure(&self) -> String {
        match (self.stderr.trim(), self.status) {
            ("", Some(status)) => format!("exit status {status}"),
            ("", None) => "no interpreter in the environment".to_string(),
            (stderr, _) => stderr.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OneShotReport {
    pub inconsistency: MaintenanceReport,
    pub repair: Option<RunReport>,
}

impl OneShotReport {
    pub fn exit_code(&self) -> i32 {
        match &self.repair {
            Some(repair) => repair.exit_code.max(self.inconsistency.exit_code()),
            None => self.inconsistency.exit_code(),
        }
    }
}

impl<R: CommandRunner> Doctor<R> {
    /// Asks the solver for a dry-run install and reads its inconsistency
    /// warning. Never changes the environment.
    pub fn diagnose_inconsistent(&self, prefix: &Path) -> Result<InconsistencyDiagnosis> {
        let manager = self.manager().ok_or(PreconditionError::NoManager)?;
        let output = manager.dry_run_install(prefix, &[DRY_RUN_PACKAGE.to_string()])?;
        let parsed = parse_inconsistent(&output.combined());
        tracing::debug!(
            inconsistent = parsed.inconsistent,
            packages = parsed.packages.len(),
            "solver dry run finished"
        );
        Ok(InconsistencyDiagnosis {
            prefix: prefix.to_path_buf(),
            inconsistent: parsed.inconsistent,
            packages: parsed.packages,
            dry_run_exit: output.status,
        })
    }

    pub fn fix_inconsistent<I: Interaction + ?Sized>(
        &self,
        prefix: &Path,
        level: InconsistencyLevel,
        interaction: &mut I,
    ) -> Result<MaintenanceReport> {
        let manager = self.manager().ok_or(PreconditionError::NoManager)?;
        let mut report = MaintenanceReport::new(Some(prefix), level.as_str(), self.config().plan);
        if report.planned {
            tracing::info!(
                "plan: {} inconsistency fix for {}",
                report.level,
                prefix.display()
            );
            return Ok(report);
        }
        let prompt = format!(
            "Apply the {} inconsistency fix to {}?",
            report.level,
            prefix.display()
        );
        if !approve(self.config().approval, interaction, &prompt) {
            return Ok(report);
        }
        report.approved = true;

        let result = (|| -> Result<(), GatewayError> {
            if level == InconsistencyLevel::Rebuild {
                tracing::info!("the rebuild subcommand recreates the environment from its export");
                report.actions.push(MaintenanceAction::SuggestRebuild);
                return Ok(());
            }

            let cleaned = manager.clean(CleanScope::IndexCache, true)?;
            report.actions.push(MaintenanceAction::Clean {
                scope: CleanScope::IndexCache.flag().to_string(),
                ok: cleaned,
            });
            if !cleaned || level != InconsistencyLevel::Normal {
                return Ok(());
            }

            let output = manager.dry_run_install(prefix, &[DRY_RUN_PACKAGE.to_string()])?;
            let parsed = parse_inconsistent(&output.combined());
            if parsed.inconsistent && !parsed.packages.is_empty() {
                let installed = manager.install(
                    prefix,
                    &parsed.packages,
                    &[],
                    InstallOptions {
                        ignore_pins: false,
                        force_reinstall: true,
                    },
                )?;
                report.actions.push(MaintenanceAction::ForceReinstall {
                    packages: parsed.packages,
                    ok: installed,
                });
            }
            Ok(())
        })();
        if let Err(err) = result {
            if let GatewayError::Interrupted { command } = err {
                report.interrupted = Some(self.record_interruption(prefix, None, command));
                return Ok(report);
            }
            return Err(err.into());
        }

        match self.scan(prefix) {
            Ok(record) => report.post_scan = Some(record),
            Err(err) => tracing::warn!("post-fix scan skipped: {err}"),
        }
        Ok(report)
    }

    /// Asks the environment's interpreter which OpenSSL its `ssl` module
    /// links, alongside the manager's package caches. Read-only; a broken
    /// `ssl` import is reported, not raised.
    pub fn diagnose_ssl(&self, prefix: &Path) -> Result<SslDiagnosis> {
        let python = interpreter_path(prefix);
        let mut diagnosis = SslDiagnosis {
            prefix: prefix.to_path_buf(),
            python: python.clone(),
            ok: false,
            status: None,
            openssl_version: None,
            stderr: String::new(),
            manager: None,
            pkgs_dirs: Vec::new(),
        };

        if let Some(python) = &python {
            let output = self.pip(python).openssl_version()?;
            diagnosis.ok = output.success();
            diagnosis.status = Some(output.status);
            diagnosis.stderr = output.stderr.trim().to_string();
            let version = output.stdout.trim();
            if diagnosis.ok && !version.is_empty() {
                diagnosis.openssl_version = Some(version.to_string());
            }
        }

        if let Some(manager) = self.manager() {
            diagnosis.manager = Some(manager.kind().program().to_string());
            match manager.info() {
                Ok(info) => {
                    diagnosis.pkgs_dirs = info.map(|info| info.pkgs_dirs).unwrap_or_default();
                }
                Err(err) if err.is_interrupted() => return Err(err.into()),
                Err(err) => tracing::warn!("could not read package cache directories: {err}"),
            }
        }
        Ok(diagnosis)
    }

    pub fn cache_check(&self) -> Result<Vec<PathBuf>> {
        let manager = self.manager().ok_or(PreconditionError::NoManager)?;
        Ok(manager
            .info()?
            .map(|info| info.pkgs_dirs)
            .unwrap_or_default())
    }

    pub fn cache_fix<I: Interaction + ?Sized>(
        &self,
        level: CacheLevel,
        interaction: &mut I,
    ) -> Result<MaintenanceReport> {
        let manager = self.manager().ok_or(PreconditionError::NoManager)?;
        let mut report = MaintenanceReport::new(None, level.as_str(), self.config().plan);
        if report.planned {
            tracing::info!("plan: {} package cache cleanup", report.level);
            return Ok(report);
        }
        let prompt = format!("Run the {} package cache cleanup?", report.level);
        if !approve(self.config().approval, interaction, &prompt) {
            return Ok(report);
        }
        report.approved = true;

        for scope in level.scopes() {
            match manager.clean(*scope, true) {
                Ok(ok) => report.actions.push(MaintenanceAction::Clean {
                    scope: scope.flag().to_string(),
                    ok,
                }),
                // Cache cleanup has no target environment; the state names the workdir.
                Err(GatewayError::Interrupted { command }) => {
                    report.interrupted =
                        Some(self.record_interruption(self.layout().root(), None, command));
                    return Ok(report);
                }
                Err(err) => return Err(err.into()),
            }
        }
        report.pkgs_dirs = self.cache_check()?;
        Ok(report)
    }

    /// Finds paths inside `prefix` mentioned by a failed transaction log
    /// and names the package whose metadata record claims each one.
    pub fn diagnose_clobber(&self, prefix: &Path, logfile: &Path) -> Result<ClobberReport> {
        let text = fs::read(logfile).map_err(|err| PreconditionError::LogUnreadable {
            path: logfile.display().to_string(),
            reason: err.to_string(),
        })?;
        let text = String::from_utf8_lossy(&text);
        let owners = file_owner_map(prefix);
        let conflicts = extract_prefix_paths(&text, prefix)
            .into_iter()
            .map(|path| {
                let relpath = relative_to_prefix(&path, prefix);
                let owner = relpath.as_ref().and_then(|rel| owners.get(rel).cloned());
                ClobberConflict {
                    path,
                    relpath,
                    owner,
                }
            })
            .collect();
        Ok(ClobberReport {
            prefix: prefix.to_path_buf(),
            conflicts,
        })
    }

    /// Safe inconsistency fix followed by a full repair run.
    pub fn one_shot<I: Interaction + ?Sized>(
        &self,
        prefix: &Path,
        level: InconsistencyLevel,
        interaction: &mut I,
    ) -> Result<OneShotReport> {
        let inconsistency = self.fix_inconsistent(prefix, level, interaction)?;
        if inconsistency.interrupted.is_some() {
            return Ok(OneShotReport {
                inconsistency,
                repair: None,
            });
        }
        let repair = self.run(&[prefix.to_path_buf()], true, interaction)?;
        Ok(OneShotReport {
            inconsistency,
            repair: Some(repair),
        })
    }
}

fn trim_token(token: &str) -> &str {
    token.trim_matches(|c: char| {
        matches!(
            c,
            '\'' | '"' | '`' | '(' | ')' | '[' | ']' | ',' | ';' | ':' | '.'
        )
    })
}

fn looks_like_absolute_path(token: &str) -> bool {
    if token.starts_with('/') {
        return true;
    }
    let bytes = token.as_bytes();
    bytes.len() > 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'\\'
}

/// Whitespace-separated tokens that are absolute paths under `prefix`,
/// compared component by component and case-insensitively. Sorted and
/// deduplicated.
pub fn extract_prefix_paths(text: &str, prefix: &Path) -> Vec<String> {
    let mut found: Vec<String> = text
        .split_whitespace()
        .map(trim_token)
        .filter(|token| looks_like_absolute_path(token))
        .filter(|token| strip_prefix_components(token, prefix).is_some())
        .map(str::to_string)
        .collect();
    found.sort();
    found.dedup();
    found
}

/// Either separator counts, since logs may come from another platform.
fn path_components(path: &str) -> impl Iterator<Item = &str> {
    path.split(['/', '\\']).filter(|part| !part.is_empty())
}

/// The components of `path` after `prefix`, or `None` when `path` is not
/// inside it. `/opt/env2` is not inside `/opt/env`.
fn strip_prefix_components<'a>(path: &'a str, prefix: &Path) -> Option<Vec<&'a str>> {
    let prefix = prefix.display().to_string();
    let mut parts = path_components(path);
    for expected in path_components(&prefix) {
        if !parts.next()?.eq_ignore_ascii_case(expected) {
            return None;
        }
    }
    Some(parts.collect())
}

fn relative_to_prefix(path: &str, prefix: &Path) -> Option<String> {
    let rest = strip_prefix_components(path, prefix)?;
    (!rest.is_empty()).then(|| rest.join("/"))
}

/// Maps every file listed in a `conda-meta` record to that record's package.
/// The first record claiming a path wins.
pub fn file_owner_map(prefix: &Path) -> BTreeMap<String, FileOwner> {
    let mut owners = BTreeMap::new();
    let mut records: Vec<PathBuf> = match fs::read_dir(prefix.join("conda-meta")) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect(),
        Err(_) => return owners,
    };
    records.sort();

    for path in records {
        let Ok(raw) = fs::read(&path) else {
            tracing::debug!("skipping unreadable record {}", path.display());
            continue;
        };
        let Ok(Value::Object(data)) = serde_json::from_slice::<Value>(&raw) else {
            continue;
        };
        let Some(files) = data.get("files").and_then(Value::as_array) else {
            continue;
        };
        let text = |key: &str| data.get(key).and_then(Value::as_str).map(str::to_string);
        let owner = FileOwner {
            name: text("name"),
            version: text("version"),
            build: text("build").or_else(|| text("build_string")),
            record: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        for file in files.iter().filter_map(Value::as_str) {
            let rel = file.replace('\\', "/");
            let rel = rel.trim_start_matches('/');
            if !rel.is_empty() {
                owners
                    .entry(rel.to_string())
                    .or_insert_with(|| owner.clone());
            }
        }
    }
    owners
}
