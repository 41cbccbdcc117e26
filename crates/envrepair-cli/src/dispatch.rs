use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap_complete::Shell;
use envrepair_core::{InvalidRevisionTarget, RevisionTarget};
use envrepair_doctor::{
    assemble_channels, load_file_config, Approval, Doctor, DoctorConfig, FileConfig,
    PreconditionError, WorkLayout, DEFAULT_WORK_DIR, EXIT_OK,
};
use envrepair_gateway::{
    install_interrupt_handler, resolve_targets, CancelToken, CommandRunner, DetectedManagers,
    EnvTarget, EnvironmentInventory, InstallOptions, LiveOutput, PackageManager, SystemRunner,
};
use serde::Serialize;

use crate::completion::write_completions_script;
use crate::prompt::TerminalInteraction;
use crate::render::{
    format_cache_lines, format_clobber_lines, format_inconsistency_lines,
    format_maintenance_lines, format_one_shot_lines, format_rebuild_lines, format_resume_lines,
    format_revisions_lines, format_rollback_lines, format_run_report_lines, format_ssl_lines,
    OutputStyle,
    TerminalRenderer,
};
use crate::{Cli, Commands, RepairArgs};

/// Set by conda activation scripts to the active environment.
const ACTIVE_PREFIX_ENV: &str = "CONDA_PREFIX";

#[derive(Debug, Clone, Serialize)]
pub(crate) struct RevisionsReport {
    pub(crate) prefix: PathBuf,
    pub(crate) revisions: Vec<u64>,
    pub(crate) current: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct CacheDirsReport {
    pub(crate) pkgs_dirs: Vec<PathBuf>,
}

#[derive(Serialize)]
struct Envelope<'a, T> {
    ok: bool,
    exit_code: i32,
    report: &'a T,
}

struct Output {
    json: bool,
    renderer: TerminalRenderer,
}

impl Output {
    fn emit<T: Serialize>(
        &self,
        title: &str,
        exit_code: i32,
        report: &T,
        lines: impl FnOnce(OutputStyle, &T) -> Vec<String>,
    ) -> Result<i32> {
        if self.json {
            let payload = Envelope {
                ok: exit_code == EXIT_OK,
                exit_code,
                report,
            };
            let rendered =
                serde_json::to_string_pretty(&payload).context("failed to serialize report")?;
            println!("{rendered}");
        } else {
            self.renderer.print_section(title);
            self.renderer
                .print_lines(&lines(self.renderer.style(), report));
        }
        Ok(exit_code)
    }
}

pub(crate) fn run_cli(cli: Cli) -> Result<i32> {
    match cli.command {
        Some(Commands::Completions { shell }) => print_completions(shell),
        _ => run_doctor(cli),
    }
}

fn print_completions(shell: Shell) -> Result<i32> {
    write_completions_script(shell, &mut io::stdout().lock())?;
    Ok(EXIT_OK)
}

fn active_prefix() -> Option<PathBuf> {
    std::env::var_os(ACTIVE_PREFIX_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn run_doctor(cli: Cli) -> Result<i32> {
    let Cli {
        json,
        debug,
        workdir,
        yes,
        plan,
        run,
        command,
        ..
    } = cli;

    let cancel = install_interrupt_handler().context("failed to install the Ctrl-C handler")?;
    let runner = build_runner(cancel, debug, json);
    let managers = DetectedManagers::detect();
    tracing::debug!(?managers, "detected package managers");

    let layout = WorkLayout::new(workdir.unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR)));
    let file = load_file_config(&layout)
        .map_err(|err| PreconditionError::Config(format!("{err:#}")))?;

    let no_repair_args = RepairArgs::default();
    let (repair, uses_channels) = match &command {
        None => (&run.repair, true),
        Some(Commands::OneShot { repair, .. }) => (repair, true),
        Some(_) => (&no_repair_args, false),
    };
    let from_manager = if uses_channels && !repair.no_channels_from_condarc {
        manager_channels(&managers, &runner)?
    } else {
        Vec::new()
    };
    let config = build_doctor_config(&file, repair, yes, plan, &from_manager);
    tracing::debug!(channels = ?config.channels, "resolved channels");

    let doctor = Doctor::new(layout, runner, managers, config);
    let renderer = TerminalRenderer::current();
    let mut interaction = TerminalInteraction::for_terminal(renderer, json);
    let output = Output { json, renderer };

    match command {
        None => {
            let inventory = doctor.discover(active_prefix())?;
            let prefixes = select_environments(&inventory, &run.envs)?;
            let result = doctor.run(&prefixes, run.fix, &mut interaction);
            interaction.finish(result.is_ok());
            let report = result?;
            output.emit("report", report.exit_code, &report, format_run_report_lines)
        }
        Some(Commands::Rollback { env, to, dry_run }) => {
            let target: RevisionTarget = to
                .parse()
                .map_err(|err: InvalidRevisionTarget| {
                    PreconditionError::InvalidRevisionTarget(err.0)
                })?;
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let report = doctor.rollback(&prefix, target, dry_run, &mut interaction)?;
            output.emit("rollback", report.exit_code(), &report, format_rollback_lines)
        }
        Some(Commands::Revisions { env }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let known = doctor.list_revisions(&prefix)?;
            let report = RevisionsReport {
                prefix,
                current: known.last().copied(),
                revisions: known.into_iter().collect(),
            };
            output.emit("revisions", EXIT_OK, &report, format_revisions_lines)
        }
        Some(Commands::Rebuild { env, to, verify }) => {
            let destination = EnvTarget::parse(&to);
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let report =
                doctor.rebuild(&prefix, &destination, &inventory, verify, &mut interaction)?;
            output.emit("rebuild", report.exit_code(), &report, format_rebuild_lines)
        }
        Some(Commands::DiagnoseClobber { env, logfile }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let report = doctor.diagnose_clobber(&prefix, &logfile)?;
            output.emit("clobber", EXIT_OK, &report, format_clobber_lines)
        }
        Some(Commands::DiagnoseSsl { env }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, env.as_deref(), active_prefix())?;
            let report = doctor.diagnose_ssl(&prefix)?;
            output.emit("ssl", EXIT_OK, &report, format_ssl_lines)
        }
        Some(Commands::DiagnoseInconsistent { env }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let report = doctor.diagnose_inconsistent(&prefix)?;
            output.emit("inconsistency", EXIT_OK, &report, format_inconsistency_lines)
        }
        Some(Commands::FixInconsistent { env, level }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, Some(env.as_str()), None)?;
            let report = doctor.fix_inconsistent(&prefix, level.into(), &mut interaction)?;
            output.emit("inconsistency", report.exit_code(), &report, |style, report| {
                format_maintenance_lines(style, "inconsistency fix", report)
            })
        }
        Some(Commands::OneShot { env, level, .. }) => {
            let inventory = doctor.discover(active_prefix())?;
            let prefix = select_environment(&inventory, env.as_deref(), active_prefix())?;
            let result = doctor.one_shot(&prefix, level.into(), &mut interaction);
            interaction.finish(result.is_ok());
            let report = result?;
            output.emit("one-shot", report.exit_code(), &report, format_one_shot_lines)
        }
        Some(Commands::CacheCheck) => {
            let report = CacheDirsReport {
                pkgs_dirs: doctor.cache_check()?,
            };
            output.emit("cache", EXIT_OK, &report, format_cache_lines)
        }
        Some(Commands::CacheFix { level }) => {
            let report = doctor.cache_fix(level.into(), &mut interaction)?;
            output.emit("cache", report.exit_code(), &report, |style, report| {
                format_maintenance_lines(style, "package cache cleanup", report)
            })
        }
        Some(Commands::Resume { restore }) => {
            let report = doctor.resume(restore, &mut interaction)?;
            output.emit("resume", report.exit_code(), &report, format_resume_lines)
        }
        Some(Commands::Completions { shell }) => print_completions(shell),
    }
}

/// JSON mode owns stdout, so child progress output moves to stderr.
pub(crate) fn build_runner(cancel: CancelToken, debug: bool, json: bool) -> SystemRunner {
    let live_output = if json {
        LiveOutput::Stderr
    } else {
        LiveOutput::Terminal
    };
    SystemRunner::new(cancel)
        .with_echo(debug)
        .with_live_output(live_output)
}

/// Channels configured for the preferred manager. A failed query only loses
/// those channels; an interruption still stops the command.
fn manager_channels<R: CommandRunner>(
    managers: &DetectedManagers,
    runner: &R,
) -> Result<Vec<String>> {
    let Some(kind) = managers.preferred() else {
        return Ok(Vec::new());
    };
    match PackageManager::new(kind, runner).configured_channels() {
        Ok(channels) => Ok(channels),
        Err(err) if err.is_interrupted() => Err(err.into()),
        Err(err) => {
            tracing::warn!("could not read configured channels: {err}");
            Ok(Vec::new())
        }
    }
}

/// Command-line flags win over `config.toml`, which wins over built-in defaults.
pub(crate) fn build_doctor_config(
    file: &FileConfig,
    repair: &RepairArgs,
    yes: bool,
    plan: bool,
    from_manager: &[String],
) -> DoctorConfig {
    let explicit = if repair.channels.is_empty() {
        file.channels.clone().unwrap_or_default()
    } else {
        repair.channels.clone()
    };
    let pip_fallback = if repair.no_pip_fallback {
        false
    } else {
        repair.pip_fallback || file.pip_fallback.unwrap_or(false)
    };

    DoctorConfig {
        channels: assemble_channels(from_manager, &explicit, !repair.no_default_channels),
        install: InstallOptions {
            ignore_pins: repair.ignore_pinned || file.ignore_pinned.unwrap_or(false),
            force_reinstall: repair.force_reinstall,
        },
        prefer: repair
            .prefer
            .map(Into::into)
            .or(file.prefer)
            .unwrap_or_default(),
        pip_fallback,
        adopt_pip: repair.adopt_pip,
        uninstall_pip: !repair.keep_pip,
        approval: if yes {
            Approval::Granted
        } else {
            Approval::Prompt
        },
        plan,
        heuristics: file.heuristics(),
        snapshot_path: repair.snapshot.clone(),
    }
}

pub(crate) fn select_environments(
    inventory: &EnvironmentInventory,
    targets: &[String],
) -> Result<Vec<PathBuf>, PreconditionError> {
    let (selected, unmatched) = resolve_targets(inventory, targets);
    if !unmatched.is_empty() {
        return Err(PreconditionError::UnknownEnvironments(unmatched));
    }
    if selected.is_empty() {
        return Err(PreconditionError::NoEnvironments);
    }
    Ok(selected)
}

/// One environment: the explicit target, else the active prefix, else the
/// only discovered environment.
pub(crate) fn select_environment(
    inventory: &EnvironmentInventory,
    target: Option<&str>,
    active: Option<PathBuf>,
) -> Result<PathBuf, PreconditionError> {
    if let Some(target) = target {
        let mut selected = select_environments(inventory, &[target.to_string()])?;
        return match selected.len() {
            1 => Ok(selected.remove(0)),
            count => Err(PreconditionError::AmbiguousEnvironment(count)),
        };
    }
    if let Some(active) = active.filter(|path| path.exists()) {
        return Ok(active);
    }
    match inventory.environments.as_slice() {
        [] => Err(PreconditionError::NoEnvironments),
        [only] => Ok(only.clone()),
        many => Err(PreconditionError::AmbiguousEnvironment(many.len())),
    }
}
