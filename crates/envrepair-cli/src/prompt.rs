use std::io::{self, BufRead, IsTerminal, Write};

use envrepair_core::InterruptState;
use envrepair_doctor::{Interaction, ResumeChoice, RunEvent};

use crate::render::{format_fix_line, TerminalProgress, TerminalRenderer};

const RESUME_QUESTION: &str =
    "[r]esume with the next phase, re[s]tore the snapshot or [a]bort? [a]";

/// Terminal front end for the doctor: y/N prompts on stdin, a narrative of
/// phases and fixes, and a progress bar when several environments run.
pub(crate) struct TerminalInteraction {
    renderer: TerminalRenderer,
    interactive: bool,
    narrate: bool,
    progress: Option<TerminalProgress>,
}

impl TerminalInteraction {
    /// JSON output keeps stdout for the report, so it never prompts or narrates.
    pub(crate) fn for_terminal(renderer: TerminalRenderer, json: bool) -> Self {
        Self {
            renderer,
            interactive: !json && io::stdin().is_terminal(),
            narrate: !json,
            progress: None,
        }
    }

    fn emit(&self, line: &str) {
        if !self.narrate {
            return;
        }
        match &self.progress {
            Some(progress) => progress.println(line),
            None => println!("{line}"),
        }
    }

    fn ask(&self, question: &str) -> Option<String> {
        let read = || -> io::Result<String> {
            let mut stdout = io::stdout();
            write!(stdout, "{question} ")?;
            stdout.flush()?;
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer)?;
            Ok(answer)
        };
        let answer = match &self.progress {
            Some(progress) => progress.suspend(read),
            None => read(),
        };
        answer
            .map_err(|err| tracing::warn!("failed to read answer: {err}"))
            .ok()
    }

    /// Clears the progress bar once the run is over.
    pub(crate) fn finish(&mut self, completed: bool) {
        if let Some(progress) = self.progress.take() {
            if completed {
                progress.finish_success();
            } else {
                progress.finish_abandon();
            }
        }
    }
}

pub(crate) fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

pub(crate) fn parse_resume_choice(answer: &str) -> Option<ResumeChoice> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "r" | "resume" => Some(ResumeChoice::Resume),
        "s" | "restore" => Some(ResumeChoice::Restore),
        "" | "a" | "abort" => Some(ResumeChoice::Abort),
        _ => None,
    }
}

impl Interaction for TerminalInteraction {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn confirm(&mut self, prompt: &str) -> bool {
        self.ask(&format!("{prompt} [y/N]"))
            .is_some_and(|answer| parse_confirmation(&answer))
    }

    fn choose_after_interrupt(&mut self, state: &InterruptState) -> ResumeChoice {
        self.emit(&self.renderer.status_line(
            "warn",
            &format!("interrupted while running {}", state.command_line()),
        ));
        loop {
            let Some(answer) = self.ask(RESUME_QUESTION) else {
                return ResumeChoice::Abort;
            };
            match parse_resume_choice(&answer) {
                Some(choice) => return choice,
                None => self.emit("please answer r, s or a"),
            }
        }
    }

    fn notify(&mut self, event: RunEvent<'_>) {
        if !self.narrate {
            return;
        }
        match event {
            RunEvent::EnvironmentStarted {
                prefix,
                index,
                total,
            } => {
                if total > 1 {
                    let renderer = self.renderer;
                    let progress = self.progress.get_or_insert_with(|| {
                        renderer.start_progress("environments", total as u64)
                    });
                    progress.set(index as u64);
                }
                match self.renderer.section_line(&prefix.display().to_string()) {
                    Some(line) => self.emit(&line),
                    None => self.emit(&format!("environment: {}", prefix.display())),
                }
            }
            RunEvent::PhaseStarted(phase) => {
                self.emit(&self.renderer.status_line("..", phase.label()));
            }
            RunEvent::FixRecorded(fix) => {
                self.emit(&format_fix_line(self.renderer.style(), fix));
            }
        }
    }
}
