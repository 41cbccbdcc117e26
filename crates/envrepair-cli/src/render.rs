use std::io::{self, IsTerminal};
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use envrepair_core::{Fix, Issue};
use envrepair_doctor::{
    ClobberReport, Disposition, EnvironmentReport, InconsistencyDiagnosis, MaintenanceAction,
    MaintenanceReport, OneShotReport, RebuildReport, ResumeReport, RollbackReport, RunReport,
    SslDiagnosis,
};
use indicatif::{HumanCount, ProgressBar, ProgressStyle};

use crate::dispatch::{CacheDirsReport, RevisionsReport};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum UiMode {
    Plain,
    Interactive,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
    mode: UiMode,
}

pub(crate) struct TerminalProgress {
    style: OutputStyle,
    label: String,
    total: u64,
    current: u64,
    progress_bar: Option<ProgressBar>,
    started_at: Instant,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(io::stdout().is_terminal())
}

impl TerminalRenderer {
    pub(crate) fn from_style(style: OutputStyle) -> Self {
        Self {
            style,
            mode: ui_mode_from_style(style),
        }
    }

    pub(crate) fn current() -> Self {
        Self::from_style(current_output_style())
    }

    pub(crate) fn style(self) -> OutputStyle {
        self.style
    }

    pub(crate) fn status_line(self, status: &str, message: &str) -> String {
        render_status_line(self.style, status, message)
    }

    pub(crate) fn section_line(self, title: &str) -> Option<String> {
        let line = render_section_header(self.mode, title)?;
        Some(match self.style {
            OutputStyle::Plain => line,
            OutputStyle::Rich => colorize(section_style(), &line),
        })
    }

    pub(crate) fn print_section(self, title: &str) {
        if let Some(line) = self.section_line(title) {
            println!();
            println!("{line}");
        }
    }

    pub(crate) fn start_progress(self, label: &str, total: u64) -> TerminalProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new(total.max(1));
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.cyan.bold} {msg:<12} [{bar:20.cyan/blue}] {pos:>3}/{len:3} {elapsed_precise}",
            ) {
                progress_bar.set_style(style.tick_chars("|/-\\ ").progress_chars("=>-"));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        TerminalProgress {
            style: self.style,
            label: label.to_string(),
            total,
            current: 0,
            progress_bar,
            started_at: Instant::now(),
        }
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }
}

impl TerminalProgress {
    pub(crate) fn set(&mut self, current: u64) {
        self.current = current.min(self.total);

        let Some(progress_bar) = &self.progress_bar else {
            return;
        };

        let safe_total = self.total.max(1);
        progress_bar.set_length(safe_total);
        progress_bar.set_position(self.current.min(safe_total));
    }

    /// Prints above the bar so the line is not overdrawn.
    pub(crate) fn println(&self, line: &str) {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.println(line),
            None => println!("{line}"),
        }
    }

    pub(crate) fn suspend<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.suspend(f),
            None => f(),
        }
    }

    pub(crate) fn finish_success(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };

        progress_bar.finish_and_clear();
        if let Some(line) = render_progress_line(
            self.style,
            &self.label,
            self.total,
            self.total,
            Some(self.started_at.elapsed()),
        ) {
            println!("{line}");
        }
    }

    pub(crate) fn finish_abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn progress_label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn progress_bar_style() -> Style {
    Style::new().fg_color(Some(AnsiColor::BrightBlue.into()))
}

fn table_header_style() -> Style {
    Style::new().effects(Effects::BOLD | Effects::UNDERLINE)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}

fn ui_mode_from_style(style: OutputStyle) -> UiMode {
    match style {
        OutputStyle::Plain => UiMode::Plain,
        OutputStyle::Rich => UiMode::Interactive,
    }
}

fn render_section_header(mode: UiMode, title: &str) -> Option<String> {
    match mode {
        UiMode::Plain => None,
        UiMode::Interactive => Some(format!("== {title} ==")),
    }
}

fn render_progress_line(
    style: OutputStyle,
    label: &str,
    current: u64,
    total: u64,
    elapsed: Option<Duration>,
) -> Option<String> {
    if style == OutputStyle::Plain {
        return None;
    }

    let width = 18_usize;
    let safe_total = total.max(1);
    let bounded_current = current.min(safe_total);
    let filled = ((bounded_current as usize) * width) / (safe_total as usize);
    let bar = format!(
        "{}{}",
        "=".repeat(filled),
        "-".repeat(width.saturating_sub(filled))
    );
    let percent = (bounded_current * 100) / safe_total;
    let counts = format!("{}/{}", HumanCount(current), HumanCount(total));
    let suffix = elapsed
        .map(|value| format!(" complete in {}", format_elapsed(value)))
        .unwrap_or_default();

    Some(format!(
        "{} [{}] {:>3}% {}{}",
        colorize(progress_label_style(), label),
        colorize(progress_bar_style(), &bar),
        percent,
        counts,
        suffix
    ))
}

fn status_badge(status: &str) -> &'static str {
    match status {
        "ok" => "[OK]",
        "warn" => "[WARN]",
        "err" => "[ERR]",
        _ => "[..]",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => format!("{} {message}", status_badge(status)),
    }
}

fn outcome_status(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "err"
    }
}

fn fix_item(fix: &Fix) -> String {
    match fix.count {
        Some(count) => format!("{} ({count})", fix.target),
        None => fix.target.clone(),
    }
}

pub(crate) fn format_fix_line(style: OutputStyle, fix: &Fix) -> String {
    render_status_line(
        style,
        outcome_status(fix.succeeded),
        &format!(
            "{} {}: {}",
            fix.method.as_str(),
            fix_item(fix),
            fix.reason.describe()
        ),
    )
}

/// Four columns: action, item, result, reason. The last column is not padded.
pub(crate) fn format_fix_table(style: OutputStyle, fixes: &[Fix]) -> Vec<String> {
    let header = ["action", "item", "result", "reason"];
    let rows: Vec<[String; 4]> = fixes
        .iter()
        .map(|fix| {
            [
                fix.method.as_str().to_string(),
                fix_item(fix),
                fix.result_label().to_string(),
                fix.reason.describe(),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row.iter()) {
            *width = (*width).max(cell.len());
        }
    }

    let render_row = |cells: [&str; 4]| {
        format!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            cells[0],
            cells[1],
            cells[2],
            cells[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        )
        .trim_end()
        .to_string()
    };

    let header_line = render_row(header);
    let mut lines = vec![match style {
        OutputStyle::Plain => header_line,
        OutputStyle::Rich => colorize(table_header_style(), &header_line),
    }];
    lines.extend(
        rows.iter()
            .map(|row| render_row([row[0].as_str(), row[1].as_str(), row[2].as_str(), row[3].as_str()])),
    );
    lines
}

fn format_issue_line(issue: &Issue) -> String {
    format!("  - {}: {}", issue.kind().as_str(), issue.summary())
}

fn disposition_status(env: &EnvironmentReport) -> (&'static str, String) {
    let path = env.path.display();
    match env.disposition {
        Disposition::Scanned if env.issues.is_empty() => ("ok", format!("{path}: no issues found")),
        Disposition::Scanned => (
            "warn",
            format!("{path}: {} issue(s) found", env.issues.len()),
        ),
        Disposition::Clean => ("ok", format!("{path}: nothing to repair")),
        Disposition::Planned => (
            "..",
            format!("{path}: {} planned action(s)", env.plan.len()),
        ),
        Disposition::Declined => ("warn", format!("{path}: repairs not approved")),
        Disposition::Repaired => {
            let remaining = env
                .post_scan
                .as_ref()
                .map(|post| post.issues.len())
                .unwrap_or(env.remaining.len());
            if remaining == 0 && env.failed_fixes() == 0 {
                ("ok", format!("{path}: repaired"))
            } else {
                (
                    "warn",
                    format!(
                        "{path}: repaired with {} failed fix(es), {remaining} issue(s) remaining",
                        env.failed_fixes()
                    ),
                )
            }
        }
        Disposition::Interrupted => ("err", format!("{path}: interrupted")),
        Disposition::Restored => ("warn", format!("{path}: interrupted, snapshot restored")),
        Disposition::RestoreFailed => (
            "err",
            format!("{path}: interrupted, snapshot restore failed"),
        ),
        Disposition::Aborted => ("err", format!("{path}: aborted after interruption")),
    }
}

pub(crate) fn format_environment_lines(style: OutputStyle, env: &EnvironmentReport) -> Vec<String> {
    let (status, message) = disposition_status(env);
    let mut lines = vec![render_status_line(style, status, &message)];
    lines.extend(env.issues.iter().map(format_issue_line));
    if !env.pinned.is_empty() {
        lines.push(format!("  pinned: {}", env.pinned.join(", ")));
    }
    for action in &env.plan {
        lines.push(format!("  plan: [{}] {}", action.phase, action.summary));
    }
    if let Some(snapshot) = &env.snapshot {
        let state = if snapshot.succeeded { "" } else { " (failed)" };
        lines.push(format!("  snapshot: {}{state}", snapshot.path.display()));
    }
    if !env.fixes.is_empty() {
        lines.push(String::new());
        lines.extend(
            format_fix_table(style, &env.fixes)
                .into_iter()
                .map(|line| format!("  {line}")),
        );
    }
    if env.disposition == Disposition::Repaired {
        if let Some(post) = env.post_scan.as_ref().filter(|post| post.has_issues()) {
            lines.push("  remaining after verification:".to_string());
            lines.extend(post.issues.iter().map(|issue| format!("  {}", format_issue_line(issue))));
        }
    }
    if matches!(
        env.disposition,
        Disposition::Interrupted | Disposition::Aborted
    ) && env.snapshot.as_ref().is_some_and(|snapshot| snapshot.succeeded)
    {
        lines.push("  run `env-repair resume --restore` to restore the snapshot".to_string());
    }
    lines
}

pub(crate) fn format_run_report_lines(style: OutputStyle, report: &RunReport) -> Vec<String> {
    if report.environments.is_empty() {
        return vec![render_status_line(style, "warn", "no environments were processed")];
    }
    let mut lines = Vec::new();
    for env in &report.environments {
        lines.extend(format_environment_lines(style, env));
    }
    lines
}

pub(crate) fn format_rollback_lines(style: OutputStyle, report: &RollbackReport) -> Vec<String> {
    let prefix = report.prefix.display();
    let known = report
        .known
        .iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let (status, message) = if report.planned {
        (
            "..",
            format!(
                "plan: roll {prefix} back from revision {} to {}",
                report.current, report.target
            ),
        )
    } else if !report.approved {
        ("warn", format!("rollback of {prefix} not approved"))
    } else if let Some(state) = &report.interrupted {
        (
            "err",
            format!("rollback interrupted while running {}", state.command_line()),
        )
    } else if report.succeeded && report.dry_run {
        (
            "ok",
            format!("dry run: {prefix} can roll back to revision {}", report.target),
        )
    } else if report.succeeded {
        ("ok", format!("rolled {prefix} back to revision {}", report.target))
    } else {
        (
            "err",
            format!("rollback of {prefix} to revision {} failed", report.target),
        )
    };

    let mut lines = vec![
        render_status_line(style, status, &message),
        format!("  known revisions: {known}"),
    ];
    if let Some(snapshot) = &report.snapshot {
        lines.push(format!("  snapshot: {}", snapshot.path.display()));
    }
    if let Some(post) = &report.post_scan {
        lines.extend(post.issues.iter().map(format_issue_line));
    }
    lines
}

pub(crate) fn format_rebuild_lines(style: OutputStyle, report: &RebuildReport) -> Vec<String> {
    let source = report.source.display();
    let destination = &report.destination;
    let (status, message) = if report.planned {
        ("..", format!("plan: export {source} and create {destination}"))
    } else if !report.approved {
        ("warn", format!("rebuild of {source} not approved"))
    } else if let Some(state) = &report.interrupted {
        (
            "err",
            format!("rebuild interrupted while running {}", state.command_line()),
        )
    } else if report.created {
        ("ok", format!("created {destination} from {source}"))
    } else {
        ("err", format!("could not create {destination} from {source}"))
    };

    let mut lines = vec![render_status_line(style, status, &message)];
    if let Some(snapshot) = &report.snapshot {
        lines.push(format!("  definition: {}", snapshot.path.display()));
    }
    if let Some(verification) = &report.verification {
        if verification.has_issues() {
            lines.push(render_status_line(
                style,
                "warn",
                &format!("verification found {} issue(s)", verification.issues.len()),
            ));
            lines.extend(verification.issues.iter().map(format_issue_line));
        } else {
            lines.push(render_status_line(style, "ok", "verification found no issues"));
        }
    }
    lines
}

fn format_maintenance_action(style: OutputStyle, action: &MaintenanceAction) -> String {
    match action {
        MaintenanceAction::Clean { scope, ok } => {
            render_status_line(style, outcome_status(*ok), &format!("clean {scope}"))
        }
        MaintenanceAction::ForceReinstall { packages, ok } => render_status_line(
            style,
            outcome_status(*ok),
            &format!("force-reinstall {}", packages.join(" ")),
        ),
        MaintenanceAction::SuggestRebuild => render_status_line(
            style,
            "..",
            "recreate the environment with `env-repair rebuild --env <ENV> --to <DEST>`",
        ),
    }
}

pub(crate) fn format_maintenance_lines(
    style: OutputStyle,
    title: &str,
    report: &MaintenanceReport,
) -> Vec<String> {
    let target = report
        .prefix
        .as_ref()
        .map(|prefix| format!(" for {}", prefix.display()))
        .unwrap_or_default();
    let mut lines = Vec::new();
    if report.planned {
        lines.push(render_status_line(
            style,
            "..",
            &format!("plan: {} {title}{target}", report.level),
        ));
        return lines;
    }
    if !report.approved {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("{} {title}{target} not approved", report.level),
        ));
        return lines;
    }

    lines.extend(
        report
            .actions
            .iter()
            .map(|action| format_maintenance_action(style, action)),
    );
    if let Some(state) = &report.interrupted {
        lines.push(render_status_line(
            style,
            "err",
            &format!("interrupted while running {}", state.command_line()),
        ));
    }
    lines.extend(
        report
            .pkgs_dirs
            .iter()
            .map(|dir| format!("  package cache: {}", dir.display())),
    );
    if let Some(post) = &report.post_scan {
        lines.extend(post.issues.iter().map(format_issue_line));
    }
    lines
}

pub(crate) fn format_inconsistency_lines(
    style: OutputStyle,
    diagnosis: &InconsistencyDiagnosis,
) -> Vec<String> {
    let prefix = diagnosis.prefix.display();
    if !diagnosis.inconsistent {
        return vec![render_status_line(
            style,
            "ok",
            &format!("{prefix}: the solver reports no inconsistency"),
        )];
    }
    let mut lines = vec![render_status_line(
        style,
        "warn",
        &format!("{prefix}: the environment is inconsistent"),
    )];
    lines.extend(
        diagnosis
            .packages
            .iter()
            .map(|package| format!("  - {package}")),
    );
    lines
}

pub(crate) fn format_clobber_lines(style: OutputStyle, report: &ClobberReport) -> Vec<String> {
    let prefix = report.prefix.display();
    if report.conflicts.is_empty() {
        return vec![render_status_line(
            style,
            "ok",
            &format!("the log mentions no paths inside {prefix}"),
        )];
    }
    let mut lines = vec![render_status_line(
        style,
        "warn",
        &format!("{} path(s) inside {prefix}", report.conflicts.len()),
    )];
    for conflict in &report.conflicts {
        let path = conflict.relpath.as_deref().unwrap_or(&conflict.path);
        let owner = match &conflict.owner {
            Some(owner) => [&owner.name, &owner.version, &owner.build]
                .into_iter()
                .flatten()
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
            None => "no owning package".to_string(),
        };
        lines.push(format!("  {path} -> {owner}"));
    }
    lines
}

pub(crate) fn format_ssl_lines(style: OutputStyle, diagnosis: &SslDiagnosis) -> Vec<String> {
    let prefix = diagnosis.prefix.display();
    let mut lines = match &diagnosis.openssl_version {
        Some(version) => vec![render_status_line(
            style,
            "ok",
            &format!("{prefix}: {version}"),
        )],
        None if diagnosis.ok => vec![render_status_line(
            style,
            "warn",
            &format!("{prefix}: ssl imports but reports no OpenSSL version"),
        )],
        None => vec![
            render_status_line(
                style,
                "err",
                &format!("{prefix}: ssl import failed: {}", diagnosis.failure()),
            ),
            "  reinstall openssl and python in this environment, or rebuild it".to_string(),
        ],
    };
    lines.extend(
        diagnosis
            .pkgs_dirs
            .iter()
            .map(|dir| format!("  package cache: {}", dir.display())),
    );
    lines
}

pub(crate) fn format_cache_lines(style: OutputStyle, report: &CacheDirsReport) -> Vec<String> {
    if report.pkgs_dirs.is_empty() {
        return vec![render_status_line(
            style,
            "warn",
            "the package manager reported no cache directories",
        )];
    }
    report
        .pkgs_dirs
        .iter()
        .map(|dir| {
            let state = if dir.exists() { "" } else { " (missing)" };
            render_status_line(
                style,
                "..",
                &format!("package cache: {}{state}", dir.display()),
            )
        })
        .collect()
}

pub(crate) fn format_revisions_lines(style: OutputStyle, report: &RevisionsReport) -> Vec<String> {
    if report.revisions.is_empty() {
        return vec![render_status_line(
            style,
            "warn",
            &format!("{}: no revision history", report.prefix.display()),
        )];
    }
    report
        .revisions
        .iter()
        .map(|revision| {
            if Some(*revision) == report.current {
                format!("{revision} (current)")
            } else {
                revision.to_string()
            }
        })
        .collect()
}

pub(crate) fn format_resume_lines(style: OutputStyle, report: &ResumeReport) -> Vec<String> {
    let Some(state) = &report.state else {
        return vec![render_status_line(style, "ok", "no interruption is recorded")];
    };
    let mut lines = vec![
        render_status_line(
            style,
            "warn",
            &format!("{} was interrupted", state.target_prefix.display()),
        ),
        format!("  command: {}", state.command_line()),
    ];
    match &state.snapshot {
        Some(snapshot) if snapshot.succeeded => {
            lines.push(format!("  snapshot: {}", snapshot.path.display()))
        }
        _ => lines.push("  snapshot: none".to_string()),
    }

    if !report.restore_requested {
        return lines;
    }
    let outcome = if !report.approved {
        render_status_line(style, "warn", "restore not approved")
    } else if let Some(state) = &report.interrupted {
        render_status_line(
            style,
            "err",
            &format!("restore interrupted while running {}", state.command_line()),
        )
    } else {
        match report.restored {
            Some(true) => render_status_line(style, "ok", "snapshot restored"),
            _ => render_status_line(style, "err", "snapshot restore failed"),
        }
    };
    lines.push(outcome);
    lines
}

pub(crate) fn format_one_shot_lines(style: OutputStyle, report: &OneShotReport) -> Vec<String> {
    let mut lines = format_maintenance_lines(style, "inconsistency fix", &report.inconsistency);
    if let Some(repair) = &report.repair {
        lines.extend(format_run_report_lines(style, repair));
    }
    lines
}
