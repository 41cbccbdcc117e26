use std::io::{self, Read};
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::CommandSpec;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("interrupted while running: {}", command.join(" "))]
    Interrupted { command: Vec<String> },
    #[error("failed launching {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed writing {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl GatewayError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn interrupted_command(&self) -> Option<&[String]> {
        match self {
            Self::Interrupted { command } => Some(command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stdout, self.stderr),
            (false, true) => self.stdout.clone(),
            _ => self.stderr.clone(),
        }
    }
}

/// Seam between the repair logic and real processes.
///
/// `capture` collects both streams for parsing. `live` forwards them to the
/// terminal and only reports the exit status. Both return
/// [`GatewayError::Interrupted`] when the user cancels mid-flight.
pub trait CommandRunner {
    fn capture(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError>;
    fn live(&self, command: &CommandSpec) -> Result<i32, GatewayError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn capture(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError> {
        (**self).capture(command)
    }

    fn live(&self, command: &CommandSpec) -> Result<i32, GatewayError> {
        (**self).live(command)
    }
}

/// Shared cancellation flag set by the Ctrl-C handler.
///
/// The flag latches: a Ctrl-C that lands between two gateway calls cancels
/// the next call before it spawns. Reporting the interruption clears it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clears the flag and reports whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Routes Ctrl-C into a token instead of killing the process, so running
/// children are terminated in an orderly way and interruption state is saved.
pub fn install_interrupt_handler() -> Result<CancelToken, ctrlc::Error> {
    let token = CancelToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || handler_token.cancel())?;
    Ok(token)
}

/// Where the stdout of a `live` child goes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LiveOutput {
    /// Shared with this process.
    #[default]
    Terminal,
    /// Sent to our stderr, keeping stdout for a machine-readable report.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct SystemRunner {
    cancel: CancelToken,
    echo_commands: bool,
    live_output: LiveOutput,
    termination_grace: Duration,
}

impl SystemRunner {
    pub fn new(cancel: CancelToken) -> Self {
        Self {
            cancel,
            echo_commands: false,
            live_output: LiveOutput::Terminal,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    pub fn with_echo(mut self, echo_commands: bool) -> Self {
        self.echo_commands = echo_commands;
        self
    }

    pub fn with_live_output(mut self, live_output: LiveOutput) -> Self {
        self.live_output = live_output;
        self
    }

    pub fn live_output(&self) -> LiveOutput {
        self.live_output
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    fn announce(&self, command: &CommandSpec) {
        if self.echo_commands {
            tracing::info!(command = %command, "running");
        } else {
            tracing::debug!(command = %command, "running");
        }
    }

    fn interrupted(&self, command: &CommandSpec) -> GatewayError {
        self.cancel.take();
        GatewayError::Interrupted {
            command: command.argv(),
        }
    }

    fn spawn(&self, command: &CommandSpec, capture: bool) -> Result<Child, GatewayError> {
        if self.cancel.is_cancelled() {
            return Err(self.interrupted(command));
        }
        self.announce(command);

        match self.configure(command, capture).spawn() {
            Ok(child) => Ok(child),
            Err(err) if err.kind() == io::ErrorKind::NotFound && cfg!(windows) => {
                let wrapped = command.via_cmd_exe();
                tracing::debug!(command = %wrapped, "retrying through cmd.exe");
                self.configure(&wrapped, capture)
                    .spawn()
                    .map_err(|source| GatewayError::Launch {
                        program: command.program().to_string(),
                        source,
                    })
            }
            Err(source) => Err(GatewayError::Launch {
                program: command.program().to_string(),
                source,
            }),
        }
    }

    fn wait(&self, command: &CommandSpec, child: &mut Child) -> Result<ExitStatus, GatewayError> {
        loop {
            if self.cancel.is_cancelled() {
                self.terminate(child);
                return Err(self.interrupted(command));
            }
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    return Err(GatewayError::Wait {
                        program: command.program().to_string(),
                        source,
                    })
                }
            }
        }
    }

    fn configure(&self, command: &CommandSpec, capture: bool) -> std::process::Command {
        let mut process = command.to_command();
        process.stdin(Stdio::null());
        if capture {
            process.stdout(Stdio::piped()).stderr(Stdio::piped());
            return process;
        }
        match self.live_output {
            LiveOutput::Terminal => process.stdout(Stdio::inherit()),
            LiveOutput::Stderr => process.stdout(Stdio::from(io::stderr())),
        };
        process.stderr(Stdio::inherit());
        process
    }

    /// Asks the child to stop, then gives it a bounded window to exit before
    /// killing it.
    fn terminate(&self, child: &mut Child) {
        request_termination(child);
        let deadline = Instant::now() + self.termination_grace;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        if let Err(err) = child.kill() {
            tracing::warn!("failed to kill interrupted child process: {err}");
        }
        let _ = child.wait();
    }
}

impl CommandRunner for SystemRunner {
    fn capture(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError> {
        let mut child = self.spawn(command, true)?;
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let status = self.wait(command, &mut child)?;
        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }

    fn live(&self, command: &CommandSpec) -> Result<i32, GatewayError> {
        let mut child = self.spawn(command, false)?;
        let status = self.wait(command, &mut child)?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(unix)]
fn request_termination(child: &Child) {
    let Ok(pid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: `pid` is our own child and has not been reaped yet.
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        tracing::debug!(pid, "SIGTERM not delivered: {}", io::Error::last_os_error());
    }
}

/// Console Ctrl-C already reaches every process attached to the console.
#[cfg(not(unix))]
fn request_termination(_child: &Child) {}

/// Pipes are drained on their own threads so a chatty child cannot block on a
/// full buffer while we poll for cancellation.
fn drain<T: Read + Send + 'static>(mut stream: T) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = stream.read_to_end(&mut buffer);
        String::from_utf8_lossy(&buffer).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
