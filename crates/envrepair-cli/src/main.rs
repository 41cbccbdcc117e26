use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use envrepair_doctor::{
    CacheLevel, InconsistencyLevel, PreconditionError, EXIT_INTERRUPTED, EXIT_PRECONDITION,
    EXIT_UNRESOLVED,
};
use envrepair_gateway::GatewayError;
use envrepair_resolver::InstallerPreference;
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod prompt;
mod render;

#[derive(Parser, Debug)]
#[command(name = "env-repair")]
#[command(
    about = "Diagnose and repair conda, mamba and pip environments",
    long_about = None
)]
struct Cli {
    /// Print only the machine-readable report on stdout.
    #[arg(long, global = true)]
    json: bool,
    /// Echo every external command and log at trace level.
    #[arg(long, global = true)]
    debug: bool,
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// Directory holding snapshots, interruption state and config.toml.
    #[arg(long, global = true, value_name = "DIR")]
    workdir: Option<PathBuf>,
    /// Approve every mutating step without prompting.
    #[arg(short = 'y', long, global = true)]
    yes: bool,
    /// Print what would be done and change nothing.
    #[arg(long, global = true)]
    plan: bool,
    #[command(flatten)]
    run: RunArgs,
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Scan (and optionally repair) one or more environments.
#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Environment name, path or `base`; repeatable. Defaults to every
    /// discovered environment.
    #[arg(long = "env", value_name = "ENV")]
    envs: Vec<String>,
    /// Repair the issues the scan finds.
    #[arg(long)]
    fix: bool,
    #[command(flatten)]
    repair: RepairArgs,
}

#[derive(Args, Debug, Default, Clone)]
struct RepairArgs {
    /// Replace pip-only packages with conda equivalents when available.
    #[arg(long)]
    adopt_pip: bool,
    /// Keep the pip copies of adopted packages.
    #[arg(long)]
    keep_pip: bool,
    /// Installer used to reinstall duplicate packages.
    #[arg(long, value_enum)]
    prefer: Option<PreferArg>,
    /// Fall back to pip for packages no channel knows about.
    #[arg(long, conflicts_with = "no_pip_fallback")]
    pip_fallback: bool,
    #[arg(long)]
    no_pip_fallback: bool,
    /// Extra channel to search and install from; repeatable.
    #[arg(long = "channel", value_name = "CHANNEL")]
    channels: Vec<String>,
    /// Ignore the channels configured for the package manager.
    #[arg(long)]
    no_channels_from_condarc: bool,
    /// Do not append conda-forge to the channel list.
    #[arg(long)]
    no_default_channels: bool,
    /// Let the solver change pinned packages.
    #[arg(long)]
    ignore_pinned: bool,
    /// Force-reinstall adopted packages even when already present.
    #[arg(long)]
    force_reinstall: bool,
    /// Write the pre-repair snapshot to this file.
    #[arg(long, value_name = "PATH")]
    snapshot: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Roll an environment back to an earlier revision.
    Rollback {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
        /// `prev`, `latest` or a revision number.
        #[arg(long, default_value = "prev")]
        to: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// List the revision history of an environment.
    Revisions {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
    },
    /// Recreate an environment from an export of its definition.
    Rebuild {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
        /// Destination name or path; must not exist yet.
        #[arg(long, value_name = "DEST")]
        to: String,
        /// Scan the new environment after creating it.
        #[arg(long)]
        verify: bool,
    },
    /// Map paths from a failed transaction log to the packages owning them.
    DiagnoseClobber {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
        #[arg(long, value_name = "FILE")]
        logfile: PathBuf,
    },
    /// Report which OpenSSL the environment's Python links against.
    DiagnoseSsl {
        /// Defaults to the active environment.
        #[arg(long = "env", value_name = "ENV")]
        env: Option<String>,
    },
    /// Ask the solver whether the environment is inconsistent.
    DiagnoseInconsistent {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
    },
    /// Clean caches and reinstall the packages the solver reports.
    FixInconsistent {
        #[arg(long = "env", value_name = "ENV")]
        env: String,
        #[arg(long, value_enum, default_value_t = InconsistencyLevelArg::Safe)]
        level: InconsistencyLevelArg,
    },
    /// Inconsistency fix followed by a full scan and repair.
    OneShot {
        /// Defaults to the active environment.
        #[arg(long = "env", value_name = "ENV")]
        env: Option<String>,
        #[arg(long, value_enum, default_value_t = InconsistencyLevelArg::Safe)]
        level: InconsistencyLevelArg,
        #[command(flatten)]
        repair: RepairArgs,
    },
    /// Show the package cache directories.
    CacheCheck,
    /// Clean the package cache.
    CacheFix {
        #[arg(long, value_enum, default_value_t = CacheLevelArg::Safe)]
        level: CacheLevelArg,
    },
    /// Show the last interruption and optionally restore its snapshot.
    Resume {
        #[arg(long)]
        restore: bool,
    },
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PreferArg {
    Auto,
    Conda,
    Pip,
}

impl From<PreferArg> for InstallerPreference {
    fn from(value: PreferArg) -> Self {
        match value {
            PreferArg::Auto => Self::Auto,
            PreferArg::Conda => Self::Conda,
            PreferArg::Pip => Self::Pip,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum InconsistencyLevelArg {
    Safe,
    Normal,
    Rebuild,
}

impl From<InconsistencyLevelArg> for InconsistencyLevel {
    fn from(value: InconsistencyLevelArg) -> Self {
        match value {
            InconsistencyLevelArg::Safe => Self::Safe,
            InconsistencyLevelArg::Normal => Self::Normal,
            InconsistencyLevelArg::Rebuild => Self::Rebuild,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CacheLevelArg {
    Safe,
    Targeted,
    Aggressive,
}

impl From<CacheLevelArg> for CacheLevel {
    fn from(value: CacheLevelArg) -> Self {
        match value {
            CacheLevelArg::Safe => Self::Safe,
            CacheLevelArg::Targeted => Self::Targeted,
            CacheLevelArg::Aggressive => Self::Aggressive,
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.verbose);

    let json = cli.json;
    let code = match dispatch::run_cli(cli) {
        Ok(code) => code,
        Err(err) => report_error(&err, json),
    };
    std::process::exit(code);
}

fn init_tracing(debug: bool, verbose: u8) {
    let level = if debug {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,env_repair={level},envrepair_core={level},envrepair_gateway={level},\
             envrepair_resolver={level},envrepair_doctor={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn error_exit_code(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<PreconditionError>().is_some() {
        EXIT_PRECONDITION
    } else if err
        .downcast_ref::<GatewayError>()
        .is_some_and(GatewayError::is_interrupted)
    {
        EXIT_INTERRUPTED
    } else {
        EXIT_UNRESOLVED
    }
}

fn report_error(err: &anyhow::Error, json: bool) -> i32 {
    let code = error_exit_code(err);
    if json {
        let payload = json!({
            "ok": false,
            "exit_code": code,
            "report": { "error": format!("{err:#}") },
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(rendered) => println!("{rendered}"),
            Err(_) => println!("{payload}"),
        }
    } else {
        eprintln!("error: {err:#}");
    }
    code
}
