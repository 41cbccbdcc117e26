use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::Result;
use envrepair_core::{
    EnvironmentRecord, Fix, FixMethod, FixReason, InterruptState, Issue, IssueKind, PackageEntry,
    Snapshot,
};
use envrepair_gateway::{CommandRunner, GatewayError, InstallOptions};
use envrepair_resolver::{
    adoption_candidates, choose_installer, find_cross_channel_conflicts, plan_adoption,
    plan_pip_uninstall, ChannelIndex, Installer,
};

use crate::fs_utils::{remove_path, remove_paths};
use crate::interaction::{approve, RepairPhase, ResumeChoice, RunEvent, RunPhase};
use crate::report::{Disposition, EnvironmentReport, PlannedAction, RunReport};
use crate::scan::{scan_dist_info_duplicates, scan_metadata_records};
use crate::{current_unix_timestamp, write_interrupt_state, Doctor, Interaction};

const CROSS_CHANNEL_TARGET: &str = "cross-channel";
const METADATA_TARGET: &str = "conda-meta";
const ADOPT_TARGET: &str = "pip-to-conda";

/// Live state of one environment while its repair phases run.
struct RepairRun {
    record: EnvironmentRecord,
    entries: Vec<PackageEntry>,
    fixes: Vec<Fix>,
    snapshot: Option<Snapshot>,
    /// Packages whose metadata directories were cleaned and need reinstalling.
    reinstall: BTreeSet<String>,
    interrupted: Option<InterruptState>,
}

impl RepairRun {
    fn push(&mut self, fix: Fix) {
        tracing::info!(
            method = fix.method.as_str(),
            target = %fix.target,
            succeeded = fix.succeeded,
            "{}",
            fix.reason.describe()
        );
        self.fixes.push(fix);
    }

    fn python(&self) -> Option<PathBuf> {
        self.record.interpreter.clone()
    }
}

enum AfterInterrupt {
    Continue,
    Stop(Disposition),
}

/// Gateway failures other than interruption become an unsuccessful fix.
fn settle(result: Result<bool, GatewayError>) -> Result<bool, GatewayError> {
    match result {
        Err(err) if !err.is_interrupted() => {
            tracing::warn!("{err}");
            Ok(false)
        }
        other => other,
    }
}

fn interrupted_command(err: GatewayError) -> Result<Vec<String>, GatewayError> {
    match err {
        GatewayError::Interrupted { command } => Ok(command),
        other => Err(other),
    }
}

impl<R: CommandRunner> Doctor<R> {
    /// Scans each environment and, when `fix` is set, runs the repair
    /// pipeline on it. Environments are processed one at a time; an
    /// interruption that stops the run leaves later environments untouched.
    pub fn run<I: Interaction + ?Sized>(
        &self,
        prefixes: &[PathBuf],
        fix: bool,
        interaction: &mut I,
    ) -> Result<RunReport> {
        let mut environments = Vec::with_capacity(prefixes.len());
        for (index, prefix) in prefixes.iter().enumerate() {
            interaction.notify(RunEvent::EnvironmentStarted {
                prefix,
                index,
                total: prefixes.len(),
            });
            let report = self.run_environment(prefix, fix, interaction)?;
            let stop = report.disposition.is_interrupted();
            environments.push(report);
            if stop {
                break;
            }
        }
        Ok(RunReport::from_environments(environments))
    }

    fn run_environment<I: Interaction + ?Sized>(
        &self,
        prefix: &Path,
        fix: bool,
        interaction: &mut I,
    ) -> Result<EnvironmentReport> {
        interaction.notify(RunEvent::PhaseStarted(RunPhase::Scanning));
        let record = match self.scan(prefix) {
            Ok(record) => record,
            Err(err) => {
                let command = interrupted_command(err)?;
                let record = EnvironmentRecord::new(prefix);
                if !fix {
                    // A read-only run never touches the saved interrupt state.
                    let mut report = EnvironmentReport::new(&record, Disposition::Interrupted);
                    report.interrupted = Some(self.interruption(prefix, None, command));
                    return Ok(report);
                }
                return self.interrupted_before_repair(record, command);
            }
        };
        if !fix {
            return Ok(EnvironmentReport::new(&record, Disposition::Scanned));
        }

        let entries = match self.installed_entries(&record) {
            Ok(entries) => entries,
            Err(err) => {
                let command = interrupted_command(err)?;
                return self.interrupted_before_repair(record, command);
            }
        };

        if !self.has_work(&record, &entries) {
            let mut report = EnvironmentReport::new(&record, Disposition::Clean);
            report.post_scan = Some(record);
            return Ok(report);
        }

        if self.config().plan {
            let mut report = EnvironmentReport::new(&record, Disposition::Planned);
            report.plan = self.plan_repairs(&record, &entries);
            return Ok(report);
        }

        let prompt = format!("Apply repairs to {}?", prefix.display());
        if !approve(self.config().approval, interaction, &prompt) {
            return Ok(EnvironmentReport::new(&record, Disposition::Declined));
        }

        let mut report = EnvironmentReport::new(&record, Disposition::Repaired);
        let mut run = RepairRun {
            record,
            entries,
            fixes: Vec::new(),
            snapshot: None,
            reinstall: BTreeSet::new(),
            interrupted: None,
        };

        interaction.notify(RunEvent::PhaseStarted(RunPhase::Snapshotting));
        let mut disposition = Disposition::Repaired;
        match self.take_snapshot(prefix) {
            Ok(snapshot) => run.snapshot = Some(snapshot),
            Err(err) => {
                let command = interrupted_command(err)?;
                if let AfterInterrupt::Stop(stopped) =
                    self.handle_interrupt(&mut run, command, interaction)?
                {
                    disposition = stopped;
                }
            }
        }

        if disposition == Disposition::Repaired {
            for phase in RepairPhase::ALL {
                interaction.notify(RunEvent::PhaseStarted(RunPhase::Repairing(phase)));
                let recorded = run.fixes.len();
                let outcome = self.run_phase(phase, &mut run);
                for fix in &run.fixes[recorded..] {
                    interaction.notify(RunEvent::FixRecorded(fix));
                }
                if let Err(err) = outcome {
                    let command = interrupted_command(err)?;
                    if let AfterInterrupt::Stop(stopped) =
                        self.handle_interrupt(&mut run, command, interaction)?
                    {
                        disposition = stopped;
                        break;
                    }
                }
            }
        }

        if disposition != Disposition::Interrupted {
            interaction.notify(RunEvent::PhaseStarted(RunPhase::Verifying));
            match self.scan(prefix) {
                Ok(post) => report.post_scan = Some(post),
                Err(err) => tracing::warn!("verification scan skipped: {err}"),
            }
        }

        report.remaining = run.record.issues;
        report.fixes = run.fixes;
        report.snapshot = run.snapshot;
        report.interrupted = run.interrupted;
        report.disposition = disposition;
        Ok(report)
    }

    fn has_work(&self, record: &EnvironmentRecord, entries: &[PackageEntry]) -> bool {
        record.has_repairable_issues()
            || !find_cross_channel_conflicts(entries).is_empty()
            || (self.config().adopt_pip
                && record.managed
                && !adoption_candidates(entries).is_empty())
    }

    fn interrupted_before_repair(
        &self,
        record: EnvironmentRecord,
        command: Vec<String>,
    ) -> Result<EnvironmentReport> {
        let state = self.record_interruption(&record.path, None, command);
        let mut report = EnvironmentReport::new(&record, Disposition::Interrupted);
        report.interrupted = Some(state);
        Ok(report)
    }

    fn interruption(
        &self,
        prefix: &Path,
        snapshot: Option<&Snapshot>,
        command: Vec<String>,
    ) -> InterruptState {
        InterruptState {
            target_prefix: prefix.to_path_buf(),
            snapshot: snapshot.cloned(),
            interrupted_command: command,
            timestamp: current_unix_timestamp().unwrap_or_default(),
        }
    }

    /// Persists the interruption. A failure to write the state file is
    /// logged; the interruption itself is still reported.
    pub(crate) fn record_interruption(
        &self,
        prefix: &Path,
        snapshot: Option<&Snapshot>,
        command: Vec<String>,
    ) -> InterruptState {
        let state = self.interruption(prefix, snapshot, command);
        match write_interrupt_state(self.layout(), &state) {
            Ok(path) => tracing::info!("interrupt state saved to {}", path.display()),
            Err(err) => tracing::warn!("failed to save interrupt state: {err:#}"),
        }
        state
    }

    fn handle_interrupt<I: Interaction + ?Sized>(
        &self,
        run: &mut RepairRun,
        command: Vec<String>,
        interaction: &mut I,
    ) -> Result<AfterInterrupt> {
        let state = self.record_interruption(&run.record.path, run.snapshot.as_ref(), command);
        run.push(Fix::new(
            false,
            FixMethod::Interrupted,
            state.command_line(),
            FixReason::Interrupted {
                command: state.command_line(),
            },
        ));
        run.interrupted = Some(state.clone());

        if !interaction.is_interactive() {
            return Ok(AfterInterrupt::Stop(Disposition::Interrupted));
        }

        match interaction.choose_after_interrupt(&state) {
            ResumeChoice::Resume => Ok(AfterInterrupt::Continue),
            ResumeChoice::Abort => Ok(AfterInterrupt::Stop(Disposition::Aborted)),
            ResumeChoice::Restore => {
                let Some(snapshot) = run.snapshot.clone().filter(Snapshot::is_restorable) else {
                    tracing::warn!("no usable snapshot to restore");
                    run.push(Fix::new(
                        false,
                        FixMethod::Restore,
                        "snapshot",
                        FixReason::SnapshotRestore,
                    ));
                    return Ok(AfterInterrupt::Stop(Disposition::RestoreFailed));
                };
                let restored = self
                    .restore_snapshot(&run.record.path, &snapshot)
                    .unwrap_or_else(|err| {
                        tracing::warn!("restore failed: {err}");
                        false
                    });
                run.push(Fix::new(
                    restored,
                    FixMethod::Restore,
                    snapshot.path.display().to_string(),
                    FixReason::SnapshotRestore,
                ));
                Ok(AfterInterrupt::Stop(if restored {
                    Disposition::Restored
                } else {
                    Disposition::RestoreFailed
                }))
            }
        }
    }

    fn run_phase(&self, phase: RepairPhase, run: &mut RepairRun) -> Result<(), GatewayError> {
        tracing::debug!(phase = phase.label(), "repair phase");
        match phase {
            RepairPhase::InvalidArtifacts => {
                self.remove_invalid_artifacts(run);
                Ok(())
            }
            RepairPhase::MetadataRecords => self.reinstall_metadata_owners(run),
            RepairPhase::DuplicateDistInfo => {
                self.remove_duplicate_dist_info(run);
                Ok(())
            }
            RepairPhase::CrossChannel => self.resolve_cross_channel(run),
            RepairPhase::DuplicatePackages => self.reinstall_duplicates(run),
            RepairPhase::AdoptPip => self.adopt_pip_packages(run),
        }
    }

    fn remove_invalid_artifacts(&self, run: &mut RepairRun) {
        let artifacts: Vec<(String, PathBuf)> = run
            .record
            .issues_of(IssueKind::InvalidArtifact)
            .filter_map(|issue| match issue {
                Issue::InvalidArtifact { name, path } => Some((name.clone(), path.clone())),
                _ => None,
            })
            .collect();

        for (name, path) in artifacts {
            let removed = remove_path(&path) && !path.exists();
            run.push(Fix::new(
                removed,
                FixMethod::Cleanup,
                name,
                FixReason::StaleArtifact,
            ));
            if removed {
                run.record.remove_matching(|issue| {
                    matches!(issue, Issue::InvalidArtifact { path: existing, .. } if *existing == path)
                });
            }
        }
    }

    fn reinstall_metadata_owners(&self, run: &mut RepairRun) -> Result<(), GatewayError> {
        let packages: BTreeSet<String> = run
            .record
            .issues
            .iter()
            .filter(|issue| {
                matches!(
                    issue.kind(),
                    IssueKind::MetadataInvalid | IssueKind::MetadataMissingDependencies
                )
            })
            .filter_map(|issue| issue.package().map(str::to_string))
            .collect();
        if packages.is_empty() || !run.record.managed {
            return Ok(());
        }
        let Some(manager) = self.manager() else {
            return Ok(());
        };

        let packages: Vec<String> = packages.into_iter().collect();
        let installed = settle(manager.install(
            &run.record.path,
            &packages,
            &self.config().channels,
            self.forced_install(),
        ))?;
        run.push(
            Fix::new(
                installed,
                FixMethod::Manager,
                METADATA_TARGET,
                FixReason::MetadataReinstall,
            )
            .with_count(packages.len()),
        );

        if installed {
            let still_broken = scan_metadata_records(&run.record.path, &self.config().heuristics);
            run.record.remove_matching(|issue| {
                matches!(
                    issue.kind(),
                    IssueKind::MetadataInvalid | IssueKind::MetadataMissingDependencies
                ) && !still_broken.contains(issue)
            });
        }
        Ok(())
    }

    fn remove_duplicate_dist_info(&self, run: &mut RepairRun) {
        let duplicates: Vec<(String, Vec<PathBuf>)> = run
            .record
            .issues_of(IssueKind::DuplicateDistInfo)
            .filter_map(|issue| match issue {
                Issue::DuplicateDistInfo { package, paths, .. } => {
                    Some((package.clone(), paths.clone()))
                }
                _ => None,
            })
            .collect();

        for (package, paths) in duplicates {
            let removed = remove_paths(paths.iter().map(PathBuf::as_path))
                && paths.iter().all(|path| !path.exists());
            run.push(Fix::new(
                removed,
                FixMethod::Cleanup,
                package.clone(),
                FixReason::DuplicateDistInfo,
            ));
            if removed {
                run.record.remove_matching(|issue| {
                    matches!(issue, Issue::DuplicateDistInfo { package: existing, .. } if *existing == package)
                });
            }
            run.reinstall.insert(package);
        }
    }

    fn resolve_cross_channel(&self, run: &mut RepairRun) -> Result<(), GatewayError> {
        let conflicts = find_cross_channel_conflicts(&run.entries);
        if conflicts.is_empty() {
            return Ok(());
        }
        let mut mutated = false;

        if let Some(python) = run.python().filter(|_| !conflicts.pip_to_remove.is_empty()) {
            let removed = settle(self.pip(&python).uninstall(&conflicts.pip_to_remove))?;
            run.push(
                Fix::new(
                    removed,
                    FixMethod::PipUninstall,
                    CROSS_CHANNEL_TARGET,
                    FixReason::CrossChannelPipUninstall,
                )
                .with_count(conflicts.pip_to_remove.len()),
            );
            mutated = true;
        }

        if !conflicts.conda_to_reinstall.is_empty() && run.record.managed {
            if let Some(manager) = self.manager() {
                let relinked = settle(manager.install(
                    &run.record.path,
                    &conflicts.conda_to_reinstall,
                    &self.config().channels,
                    self.forced_install(),
                ))?;
                run.push(
                    Fix::new(
                        relinked,
                        FixMethod::Manager,
                        CROSS_CHANNEL_TARGET,
                        FixReason::CrossChannelRelink,
                    )
                    .with_count(conflicts.conda_to_reinstall.len()),
                );
                mutated = true;
            }
        }

        if mutated {
            run.entries = self.installed_entries(&run.record)?;
        }
        Ok(())
    }

    fn reinstall_duplicates(&self, run: &mut RepairRun) -> Result<(), GatewayError> {
        let mut packages = std::mem::take(&mut run.reinstall);
        packages.extend(
            run.record
                .issues_of(IssueKind::DuplicateDistInfo)
                .filter_map(|issue| issue.package().map(str::to_string)),
        );
        if packages.is_empty() {
            return Ok(());
        }

        let index = ChannelIndex::build(&run.entries);
        let config = self.config();
        let mut any_reinstalled = false;
        for package in packages {
            let choice = choose_installer(&index, &package, config.prefer, config.pip_fallback);
            let fix = match choice {
                None => Fix::new(false, FixMethod::Skip, package, FixReason::NoInstaller),
                Some(choice) if choice.installer == Installer::Pip => {
                    let reinstalled = match run.python() {
                        Some(python) => settle(self.pip(&python).reinstall(&choice.name))?,
                        None => false,
                    };
                    Fix::new(
                        reinstalled,
                        FixMethod::Pip,
                        package,
                        FixReason::ReinstallDuplicates,
                    )
                }
                Some(choice) => {
                    let reinstalled = match self.manager().filter(|_| run.record.managed) {
                        Some(manager) => settle(manager.install(
                            &run.record.path,
                            std::slice::from_ref(&choice.name),
                            &config.channels,
                            self.forced_install(),
                        ))?,
                        None => false,
                    };
                    Fix::new(
                        reinstalled,
                        FixMethod::Manager,
                        package,
                        FixReason::ReinstallDuplicates,
                    )
                }
            };
            any_reinstalled |= fix.succeeded;
            run.push(fix);
        }

        if any_reinstalled {
            run.record.remove_kind(IssueKind::DuplicateDistInfo);
            let fresh: Vec<Issue> = run
                .record
                .site_packages
                .iter()
                .flat_map(|site| scan_dist_info_duplicates(site))
                .collect();
            run.record.issues.extend(fresh);
        }
        Ok(())
    }

    fn adopt_pip_packages(&self, run: &mut RepairRun) -> Result<(), GatewayError> {
        let config = self.config();
        if !config.adopt_pip || !run.record.managed {
            return Ok(());
        }
        let Some(manager) = self.manager() else {
            return Ok(());
        };
        let plan = plan_adoption(&run.entries);
        if plan.is_empty() {
            return Ok(());
        }

        tracing::info!(
            candidates = plan.variants.len(),
            terms = plan.search_terms.len(),
            "searching conda channels for pip packages"
        );
        let available = match manager.search(&plan.search_terms, &config.channels) {
            Ok(available) => available,
            Err(err) if err.is_interrupted() => return Err(err),
            Err(err) => {
                tracing::warn!("adoption search failed: {err}");
                return Ok(());
            }
        };
        let adopted = plan.resolve(&available);
        if adopted.is_empty() {
            return Ok(());
        }
        let conda_names: Vec<String> = adopted
            .values()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let installed = settle(manager.install(
            &run.record.path,
            &conda_names,
            &config.channels,
            config.install,
        ))?;
        run.push(
            Fix::new(
                installed,
                FixMethod::Manager,
                ADOPT_TARGET,
                FixReason::AdoptInstall,
            )
            .with_count(conda_names.len()),
        );
        if !installed || !config.uninstall_pip {
            return Ok(());
        }
        let Some(python) = run.python() else {
            return Ok(());
        };

        let refreshed = manager.list_installed(&run.record.path)?;
        let uninstall = plan_pip_uninstall(&adopted, &plan.pip_versions, &refreshed);
        for skipped in uninstall.skipped {
            run.push(Fix::new(
                true,
                FixMethod::Skip,
                ADOPT_TARGET,
                FixReason::AdoptSkipKeep {
                    pip_name: skipped.pip_name,
                    pip_version: skipped.pip_version,
                    conda_name: skipped.conda_name,
                    conda_version: skipped.conda_version,
                },
            ));
        }
        if uninstall.uninstall.is_empty() {
            run.entries = refreshed;
            return Ok(());
        }

        let removed = settle(self.pip(&python).uninstall(&uninstall.uninstall))?;
        run.push(
            Fix::new(
                removed,
                FixMethod::PipUninstall,
                ADOPT_TARGET,
                FixReason::AdoptPipUninstall,
            )
            .with_count(uninstall.uninstall.len()),
        );

        // pip removes every file in its RECORD, including paths conda now owns.
        let relinked = settle(manager.install(
            &run.record.path,
            &conda_names,
            &config.channels,
            self.forced_install(),
        ))?;
        run.push(
            Fix::new(
                relinked,
                FixMethod::Manager,
                ADOPT_TARGET,
                FixReason::AdoptRelink,
            )
            .with_count(conda_names.len()),
        );
        run.entries = self.installed_entries(&run.record)?;
        Ok(())
    }

    fn forced_install(&self) -> InstallOptions {
        InstallOptions {
            force_reinstall: true,
            ..self.config().install
        }
    }

    /// What the pipeline would do, without doing it.
    pub fn plan_repairs(
        &self,
        record: &EnvironmentRecord,
        entries: &[PackageEntry],
    ) -> Vec<PlannedAction> {
        let mut plan = Vec::new();
        let count = |kind: IssueKind| record.issues_of(kind).count();

        let artifacts = count(IssueKind::InvalidArtifact);
        if artifacts > 0 {
            plan.push(PlannedAction {
                phase: RepairPhase::InvalidArtifacts.label(),
                summary: format!("delete {artifacts} stale artifact(s)"),
            });
        }

        let metadata = count(IssueKind::MetadataInvalid) + count(IssueKind::MetadataMissingDependencies);
        if metadata > 0 && record.managed {
            plan.push(PlannedAction {
                phase: RepairPhase::MetadataRecords.label(),
                summary: format!("force-reinstall owners of {metadata} broken record(s)"),
            });
        }

        let duplicates: Vec<&str> = record
            .issues_of(IssueKind::DuplicateDistInfo)
            .filter_map(Issue::package)
            .collect();
        if !duplicates.is_empty() {
            plan.push(PlannedAction {
                phase: RepairPhase::DuplicateDistInfo.label(),
                summary: format!("remove dist-info for {}", duplicates.join(", ")),
            });
            plan.push(PlannedAction {
                phase: RepairPhase::DuplicatePackages.label(),
                summary: format!("reinstall {}", duplicates.join(", ")),
            });
        }

        let conflicts = find_cross_channel_conflicts(entries);
        if !conflicts.is_empty() {
            plan.push(PlannedAction {
                phase: RepairPhase::CrossChannel.label(),
                summary: format!(
                    "pip uninstall {}; conda reinstall {}",
                    conflicts.pip_to_remove.join(", "),
                    conflicts.conda_to_reinstall.join(", ")
                ),
            });
        }

        if self.config().adopt_pip && record.managed {
            let candidates: Vec<&str> = adoption_candidates(entries)
                .into_iter()
                .map(|entry| entry.name.as_str())
                .collect();
            if !candidates.is_empty() {
                plan.push(PlannedAction {
                    phase: RepairPhase::AdoptPip.label(),
                    summary: format!("search conda for {}", candidates.join(", ")),
                });
            }
        }

        plan.sort_by_key(|action| {
            RepairPhase::ALL
                .iter()
                .position(|phase| phase.label() == action.phase)
                .unwrap_or(usize::MAX)
        });
        plan
    }
}
