use super::*;
use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use envrepair_core::{
    FixMethod, InterruptState, Issue, IssueKind, RevisionTarget, Snapshot, SnapshotKind,
};
use envrepair_gateway::{
    CleanScope, CommandOutput, CommandRunner, CommandSpec, DetectedManagers, EnvTarget,
    EnvironmentInventory, GatewayError, OPENSSL_VERSION_SCRIPT,
};
use envrepair_resolver::InstallerPreference;
use serde_json::json;
use tempfile::TempDir;

use crate::scan::{missing_dependencies_is_benign, native_module_key};

type Matcher = Box<dyn Fn(&CommandSpec) -> bool>;

enum Reply {
    Output(CommandOutput),
    Interrupt,
}

/// Answers commands by rule; later rules take precedence. Unmatched commands
/// succeed with empty output.
struct FakeRunner {
    rules: Vec<(Matcher, Reply)>,
    seen: RefCell<Vec<CommandSpec>>,
}

impl FakeRunner {
    fn new(site: &Path) -> Self {
        let site_json = serde_json::to_string(&[site.display().to_string()]).expect("must encode");
        Self {
            rules: Vec::new(),
            seen: RefCell::new(Vec::new()),
        }
        .on(is_site_query, &site_json)
    }

    fn on(mut self, matcher: impl Fn(&CommandSpec) -> bool + 'static, stdout: &str) -> Self {
        self.rules.push((
            Box::new(matcher),
            Reply::Output(CommandOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        ));
        self
    }

    fn fail_on(mut self, matcher: impl Fn(&CommandSpec) -> bool + 'static, stderr: &str) -> Self {
        self.rules.push((
            Box::new(matcher),
            Reply::Output(CommandOutput {
                status: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }),
        ));
        self
    }

    fn interrupt_on(mut self, matcher: impl Fn(&CommandSpec) -> bool + 'static) -> Self {
        self.rules.push((Box::new(matcher), Reply::Interrupt));
        self
    }

    fn reply(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError> {
        self.seen.borrow_mut().push(command.clone());
        match self
            .rules
            .iter()
            .rev()
            .find(|(matcher, _)| matcher(command))
            .map(|(_, reply)| reply)
        {
            Some(Reply::Output(output)) => Ok(output.clone()),
            Some(Reply::Interrupt) => Err(GatewayError::Interrupted {
                command: command.argv(),
            }),
            None => Ok(CommandOutput::default()),
        }
    }

    fn seen_with(&self, arg: &str) -> Vec<CommandSpec> {
        self.seen
            .borrow()
            .iter()
            .filter(|command| command.has_arg(arg))
            .cloned()
            .collect()
    }

    fn last(&self) -> Option<CommandSpec> {
        self.seen.borrow().last().cloned()
    }
}

impl CommandRunner for FakeRunner {
    fn capture(&self, command: &CommandSpec) -> Result<CommandOutput, GatewayError> {
        self.reply(command)
    }

    fn live(&self, command: &CommandSpec) -> Result<i32, GatewayError> {
        self.reply(command).map(|output| output.status)
    }
}

struct ScriptedInteraction {
    interactive: bool,
    answers: VecDeque<bool>,
    after_interrupt: ResumeChoice,
    phases: Vec<String>,
}

impl ScriptedInteraction {
    fn new(interactive: bool, answers: &[bool], after_interrupt: ResumeChoice) -> Self {
        Self {
            interactive,
            answers: answers.iter().copied().collect(),
            after_interrupt,
            phases: Vec::new(),
        }
    }
}

impl Interaction for ScriptedInteraction {
    fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn confirm(&mut self, _prompt: &str) -> bool {
        self.answers.pop_front().unwrap_or(false)
    }

    fn choose_after_interrupt(&mut self, _state: &InterruptState) -> ResumeChoice {
        self.after_interrupt
    }

    fn notify(&mut self, event: RunEvent<'_>) {
        if let RunEvent::PhaseStarted(phase) = event {
            self.phases.push(phase.label().to_string());
        }
    }
}

struct Fixture {
    _dir: TempDir,
    prefix: PathBuf,
    site: PathBuf,
    layout: WorkLayout,
}

fn env_fixture(managed: bool) -> Fixture {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let prefix = dir.path().join("demo");
    let site = prefix.join("lib").join("python3.11").join("site-packages");
    fs::create_dir_all(&site).expect("must create site-packages");
    fs::create_dir_all(prefix.join("bin")).expect("must create bin");
    fs::write(prefix.join("bin").join("python"), "").expect("must write interpreter");
    fs::write(prefix.join("python.exe"), "").expect("must write interpreter");
    if managed {
        fs::create_dir_all(prefix.join("conda-meta")).expect("must create conda-meta");
    }
    let layout = WorkLayout::new(dir.path().join(DEFAULT_WORK_DIR));
    Fixture {
        _dir: dir,
        prefix,
        site,
        layout,
    }
}

fn write_record(prefix: &Path, file_name: &str, content: &str) -> PathBuf {
    let path = prefix.join("conda-meta").join(file_name);
    fs::create_dir_all(path.parent().expect("must have parent")).expect("must create conda-meta");
    fs::write(&path, content).expect("must write record");
    path
}

fn granted() -> DoctorConfig {
    DoctorConfig {
        approval: Approval::Granted,
        ..DoctorConfig::default()
    }
}

fn only_conda() -> DetectedManagers {
    DetectedManagers::from_lookup(|program| {
        (program == "conda").then(|| PathBuf::from("/opt/conda/bin/conda"))
    })
}

fn is_site_query(command: &CommandSpec) -> bool {
    command
        .arguments()
        .first()
        .is_some_and(|arg| arg == "-c")
}

fn is_pip_list(command: &CommandSpec) -> bool {
    command.has_arg("pip") && command.has_arg("list")
}

fn is_pip_reinstall(command: &CommandSpec) -> bool {
    command.has_arg("pip") && command.has_arg("--force-reinstall")
}

/// Stale artifact plus a dist-info duplicate in a plain (non-conda) env.
fn broken_pip_env() -> (Fixture, FakeRunner) {
    let fixture = env_fixture(false);
    fs::create_dir_all(fixture.site.join("~oo")).expect("must create artifact");
    fs::create_dir_all(fixture.site.join("foo-1.0.dist-info")).expect("must create dist-info");
    fs::create_dir_all(fixture.site.join("Foo-2.0.dist-info")).expect("must create dist-info");
    let runner = FakeRunner::new(&fixture.site)
        .on(is_pip_list, r#"[{"name": "foo", "version": "2.0"}]"#)
        .on(|command| command.has_arg("freeze"), "foo==2.0\n");
    (fixture, runner)
}

#[test]
fn dist_info_versions_of_one_name_are_one_issue() {
    let fixture = env_fixture(false);
    for name in ["foo_bar-1.0.dist-info", "Foo.Bar-2.0.dist-info", "other-1.0.dist-info"] {
        fs::create_dir_all(fixture.site.join(name)).expect("must create dist-info");
    }

    let issues = scan_dist_info_duplicates(&fixture.site);
    assert_eq!(issues.len(), 1);
    let Issue::DuplicateDistInfo {
        package,
        versions,
        paths,
    } = &issues[0]
    else {
        panic!("expected duplicate dist-info, got {:?}", issues[0]);
    };
    assert_eq!(package, "foo-bar");
    assert_eq!(versions, &vec!["1.0".to_string(), "2.0".to_string()]);
    assert_eq!(paths.len(), 2);
}

#[test]
fn same_version_dist_info_is_not_a_duplicate() {
    let fixture = env_fixture(false);
    fs::create_dir_all(fixture.site.join("foo-1.0.dist-info")).expect("must create dist-info");
    fs::create_dir_all(fixture.site.join("FOO-1.0.dist-info")).expect("must create dist-info");
    assert!(scan_dist_info_duplicates(&fixture.site).is_empty());
}

#[test]
fn native_key_keeps_interpreter_tag_and_drops_copy_markers() {
    assert_eq!(
        native_module_key("foo.cp310-win_amd64.pyd").as_deref(),
        Some("foo.cp310-win_amd64")
    );
    assert_eq!(
        native_module_key("foo.cp310-win_amd64(1).pyd").as_deref(),
        Some("foo.cp310-win_amd64")
    );
    assert_eq!(
        native_module_key("_speedups.cpython-311-x86_64-linux-gnu - Copy.so").as_deref(),
        Some("_speedups.cpython-311-x86_64-linux-gnu")
    );
    assert_eq!(native_module_key("plain.pyd").as_deref(), Some("plain"));
    assert!(native_module_key("module.py").is_none());
}

#[test]
fn native_modules_for_different_interpreters_coexist() {
    let fixture = env_fixture(false);
    fs::write(fixture.site.join("foo.cp310-win_amd64.pyd"), "").expect("must write module");
    fs::write(fixture.site.join("foo.cp311-win_amd64.pyd"), "").expect("must write module");
    assert!(scan_native_duplicates(&fixture.site).is_empty());
}

#[test]
fn copied_native_module_is_reported() {
    let fixture = env_fixture(false);
    fs::write(fixture.site.join("foo.cp310-win_amd64.pyd"), "").expect("must write module");
    fs::write(fixture.site.join("foo.cp310-win_amd64(1).pyd"), "").expect("must write module");

    let issues = scan_native_duplicates(&fixture.site);
    assert_eq!(issues.len(), 1);
    let Issue::DuplicateNativeModule { base, files, .. } = &issues[0] else {
        panic!("expected duplicate native module, got {:?}", issues[0]);
    };
    assert_eq!(base, "foo.cp310-win_amd64");
    assert_eq!(
        files,
        &vec![
            "foo.cp310-win_amd64(1).pyd".to_string(),
            "foo.cp310-win_amd64.pyd".to_string()
        ]
    );
}

#[test]
fn leftover_markers_are_invalid_artifacts() {
    let fixture = env_fixture(false);
    fs::create_dir_all(fixture.site.join("~umpy")).expect("must create artifact");
    fs::write(fixture.site.join("libfoo.so.c~a1b2.conda_trash"), "").expect("must write trash");
    fs::create_dir_all(fixture.site.join("numpy")).expect("must create package");

    let names: Vec<String> = scan_invalid_artifacts(&fixture.site)
        .into_iter()
        .filter_map(|issue| match issue {
            Issue::InvalidArtifact { name, .. } => Some(name),
            _ => None,
        })
        .collect();
    assert_eq!(names, vec!["libfoo.so.c~a1b2.conda_trash", "~umpy"]);
}

#[test]
fn noarch_record_without_depends_is_benign_even_with_subdir() {
    let fixture = env_fixture(true);
    write_record(
        &fixture.prefix,
        "helper-1.0-0.json",
        r#"{"name": "helper", "version": "1.0", "build": "0", "noarch": "generic", "subdir": "noarch"}"#,
    );
    write_record(
        &fixture.prefix,
        "marker-1.0-0.json",
        r#"{"name": "marker", "version": "1.0", "build": "0"}"#,
    );
    let issues = scan_metadata_records(&fixture.prefix, &MetadataHeuristics::default());
    assert!(issues.is_empty(), "unexpected issues: {issues:?}");
}

#[test]
fn record_missing_identity_is_flagged_regardless_of_noarch() {
    let fixture = env_fixture(true);
    write_record(
        &fixture.prefix,
        "nobuild-1.0-0.json",
        r#"{"name": "nobuild", "version": "1.0", "noarch": "python"}"#,
    );
    write_record(
        &fixture.prefix,
        "platform-1.0-h1.json",
        r#"{"name": "platform", "version": "1.0", "build": "h1", "subdir": "linux-64", "files": []}"#,
    );
    write_record(
        &fixture.prefix,
        "healthy-1.0-0.json",
        r#"{"name": "healthy", "version": "1.0", "build": "0", "depends": []}"#,
    );

    let issues = scan_metadata_records(&fixture.prefix, &MetadataHeuristics::default());
    let flagged: Vec<(IssueKind, Option<&str>)> = issues
        .iter()
        .map(|issue| (issue.kind(), issue.package()))
        .collect();
    assert_eq!(
        flagged,
        vec![
            (IssueKind::MetadataMissingDependencies, Some("nobuild")),
            (IssueKind::MetadataMissingDependencies, Some("platform")),
        ]
    );
}

#[test]
fn unparseable_or_non_object_records_are_invalid() {
    let fixture = env_fixture(true);
    write_record(&fixture.prefix, "broken-1.0-0.json", "{not json");
    write_record(&fixture.prefix, "listy-1.0-0.json", "[1, 2]");
    fs::write(fixture.prefix.join("conda-meta").join("history"), "==> log").expect("must write");

    let issues = scan_metadata_records(&fixture.prefix, &MetadataHeuristics::default());
    assert_eq!(issues.len(), 2);
    assert!(issues
        .iter()
        .all(|issue| issue.kind() == IssueKind::MetadataInvalid));
}

#[test]
fn heuristic_signal_lists_are_tunable() {
    let fields = json!({"name": "a", "version": "1", "build": "0", "license": "MIT"});
    let fields = fields.as_object().expect("must be object");
    let mut heuristics = MetadataHeuristics::default();
    assert!(missing_dependencies_is_benign(fields, &heuristics));

    heuristics.real_record_keys.push("license".to_string());
    assert!(!missing_dependencies_is_benign(fields, &heuristics));
}

#[test]
fn missing_interpreter_stops_the_scan() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let runner = FakeRunner::new(dir.path());
    let record = scan_environment(dir.path(), &runner, &MetadataHeuristics::default())
        .expect("must scan");
    assert_eq!(record.issues, vec![Issue::MissingInterpreter]);
    assert!(runner.seen.borrow().is_empty());
}

#[test]
fn unresolvable_site_packages_stops_the_scan() {
    let fixture = env_fixture(true);
    write_record(&fixture.prefix, "broken-1.0-0.json", "{not json");
    let runner = FakeRunner::new(&fixture.site).on(is_site_query, "[]");

    let record = scan_environment(&fixture.prefix, &runner, &MetadataHeuristics::default())
        .expect("must scan");
    assert_eq!(record.issues, vec![Issue::MissingSitePackages]);
}

#[test]
fn repeated_scans_are_identical() {
    let fixture = env_fixture(true);
    for name in ["b-1.0.dist-info", "B-2.0.dist-info", "a-1.0.dist-info", "A-3.0.dist-info"] {
        fs::create_dir_all(fixture.site.join(name)).expect("must create dist-info");
    }
    fs::create_dir_all(fixture.site.join("~tmp")).expect("must create artifact");
    write_record(&fixture.prefix, "broken-1.0-0.json", "{");
    fs::write(
        fixture.prefix.join("conda-meta").join("pinned"),
        "# pins\npython 3.11.*\n\n",
    )
    .expect("must write pins");
    let runner = FakeRunner::new(&fixture.site);

    let first = scan_environment(&fixture.prefix, &runner, &MetadataHeuristics::default())
        .expect("must scan");
    let second = scan_environment(&fixture.prefix, &runner, &MetadataHeuristics::default())
        .expect("must scan");
    assert_eq!(first, second);
    assert!(first.managed);
    assert_eq!(first.pinned, vec!["python 3.11.*"]);
    assert_eq!(first.issues.len(), 4);
}

#[test]
fn file_config_supplies_defaults_and_rejects_unknown_keys() {
    let config = FileConfig::from_toml_str(
        r#"
channels = ["bioconda"]
prefer = "pip"
pip_fallback = true

[metadata]
identity_keys = ["name", "version"]
"#,
    )
    .expect("must parse");
    assert_eq!(config.channels, Some(vec!["bioconda".to_string()]));
    assert_eq!(config.prefer, Some(InstallerPreference::Pip));
    assert_eq!(config.pip_fallback, Some(true));
    let heuristics = config.heuristics();
    assert_eq!(heuristics.identity_keys, vec!["name", "version"]);
    assert_eq!(
        heuristics.real_record_keys,
        MetadataHeuristics::default().real_record_keys
    );

    assert!(FileConfig::from_toml_str("chanels = []").is_err());
}

#[test]
fn missing_config_file_is_default() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let layout = WorkLayout::new(dir.path().join(DEFAULT_WORK_DIR));
    assert_eq!(
        load_file_config(&layout).expect("must load"),
        FileConfig::default()
    );
}

#[test]
fn channels_assemble_in_order_without_duplicates() {
    let from_manager = vec!["defaults".to_string(), "conda-forge".to_string()];
    let explicit = vec!["bioconda".to_string(), "defaults".to_string()];
    assert_eq!(
        assemble_channels(&from_manager, &explicit, true),
        vec!["defaults", "conda-forge", "bioconda"]
    );
    assert_eq!(
        assemble_channels(&[], &explicit, false),
        vec!["bioconda", "defaults"]
    );
    assert_eq!(assemble_channels(&[], &[], true), vec![DEFAULT_CHANNEL]);
}

#[test]
fn interrupt_state_round_trips_and_overwrites() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let layout = WorkLayout::new(dir.path().join(DEFAULT_WORK_DIR));
    assert!(read_interrupt_state(&layout).expect("must read").is_none());

    let mut state = InterruptState {
        target_prefix: PathBuf::from("/envs/demo"),
        snapshot: Some(Snapshot {
            path: PathBuf::from("/work/snapshots/demo-1/env.yml"),
            succeeded: true,
            kind: SnapshotKind::ManagerExport,
        }),
        interrupted_command: vec!["conda".to_string(), "install".to_string()],
        timestamp: 1,
    };
    write_interrupt_state(&layout, &state).expect("must write");
    state.timestamp = 2;
    write_interrupt_state(&layout, &state).expect("must overwrite");

    assert_eq!(read_interrupt_state(&layout).expect("must read"), Some(state));
}

#[test]
fn snapshot_dirs_never_collide() {
    let dir = tempfile::tempdir().expect("must create temp dir");
    let layout = WorkLayout::new(dir.path());
    let first = layout.allocate_snapshot_dir("demo", 7).expect("must allocate");
    let second = layout.allocate_snapshot_dir("demo", 7).expect("must allocate");
    assert_ne!(first, second);
    assert!(first.is_dir() && second.is_dir());
}

#[test]
fn revision_targets_resolve_against_known_history() {
    let known: BTreeSet<u64> = [3, 4, 5].into_iter().collect();
    let prefix = Path::new("/envs/demo");
    assert_eq!(
        resolve_revision(&known, RevisionTarget::Previous, prefix).expect("must resolve"),
        4
    );
    assert_eq!(
        resolve_revision(&known, RevisionTarget::Latest, prefix).expect("must resolve"),
        5
    );
    assert!(matches!(
        resolve_revision(&known, RevisionTarget::Number(2), prefix),
        Err(PreconditionError::UnknownRevision { .. })
    ));
    assert!(matches!(
        resolve_revision(&BTreeSet::new(), RevisionTarget::Latest, prefix),
        Err(PreconditionError::NoRevisions(_))
    ));

    let gap: BTreeSet<u64> = [1, 5].into_iter().collect();
    assert!(resolve_revision(&gap, RevisionTarget::Previous, prefix).is_err());
}

#[test]
fn repair_pipeline_fixes_pip_environment_and_is_idempotent() {
    let (fixture, runner) = broken_pip_env();
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    assert_eq!(report.exit_code, EXIT_OK, "{report:#?}");
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Repaired);
    let methods: Vec<FixMethod> = env.fixes.iter().map(|fix| fix.method).collect();
    assert_eq!(
        methods,
        vec![FixMethod::Cleanup, FixMethod::Cleanup, FixMethod::Pip]
    );
    assert!(env.fixes.iter().all(|fix| fix.succeeded));
    assert!(env.remaining.is_empty());
    assert!(!fixture.site.join("~oo").exists());
    assert!(!fixture.site.join("foo-1.0.dist-info").exists());

    let snapshot = env.snapshot.as_ref().expect("must snapshot");
    assert_eq!(snapshot.kind, SnapshotKind::PipFreeze);
    assert_eq!(
        fs::read_to_string(&snapshot.path).expect("must read snapshot"),
        "foo==2.0\n"
    );
    let post = env.post_scan.as_ref().expect("must verify");
    assert!(post.issues.is_empty());

    let again = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    assert_eq!(again.environments[0].disposition, Disposition::Clean);
    assert!(again.environments[0].fixes.is_empty());
    assert_eq!(again.exit_code, EXIT_OK);
}

#[test]
fn interruption_without_a_terminal_stops_and_persists_state() {
    let (fixture, runner) = broken_pip_env();
    let runner = runner.interrupt_on(is_pip_reinstall);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    let mut interaction = ScriptedInteraction::new(false, &[], ResumeChoice::Resume);

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut interaction)
        .expect("must run");
    assert_eq!(report.exit_code, EXIT_INTERRUPTED);
    assert!(!report.ok);
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Interrupted);
    assert_eq!(
        env.fixes.last().map(|fix| fix.method),
        Some(FixMethod::Interrupted)
    );

    let state = read_interrupt_state(&fixture.layout)
        .expect("must read state")
        .expect("must persist state");
    assert_eq!(state.target_prefix, fixture.prefix);
    assert_eq!(
        state.snapshot.as_ref().map(|snapshot| &snapshot.path),
        env.snapshot.as_ref().map(|snapshot| &snapshot.path)
    );
    assert!(state
        .interrupted_command
        .iter()
        .any(|arg| arg == "--force-reinstall"));
    assert_eq!(env.interrupted.as_ref(), Some(&state));

    assert!(runner.last().is_some_and(|command| is_pip_reinstall(&command)));
    assert!(!interaction
        .phases
        .iter()
        .any(|phase| phase == RepairPhase::AdoptPip.label() || phase == "verify"));
}

#[test]
fn interactive_restore_applies_the_snapshot() {
    let (fixture, runner) = broken_pip_env();
    let runner = runner.interrupt_on(is_pip_reinstall);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        DoctorConfig::default(),
    );
    let mut interaction = ScriptedInteraction::new(true, &[true], ResumeChoice::Restore);

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut interaction)
        .expect("must run");
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Restored);
    assert_eq!(report.exit_code, EXIT_INTERRUPTED);
    let restore = env.fixes.last().expect("must record restore");
    assert_eq!(restore.method, FixMethod::Restore);
    assert!(restore.succeeded);

    let snapshot = env.snapshot.as_ref().expect("must snapshot");
    let restores = runner.seen_with("-r");
    assert_eq!(restores.len(), 1);
    assert!(restores[0]
        .arguments()
        .contains(&snapshot.path.display().to_string()));
}

#[test]
fn interactive_resume_continues_with_later_phases() {
    let (fixture, runner) = broken_pip_env();
    let runner = runner.interrupt_on(is_pip_reinstall);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    let mut interaction = ScriptedInteraction::new(true, &[], ResumeChoice::Resume);

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut interaction)
        .expect("must run");
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Repaired);
    assert!(interaction
        .phases
        .iter()
        .any(|phase| phase == RepairPhase::AdoptPip.label()));
    assert!(env.post_scan.is_some());
    assert!(env.was_interrupted());
    assert_eq!(report.exit_code, EXIT_INTERRUPTED);
    assert!(!report.ok);
}

#[test]
fn snapshot_override_replaces_the_work_directory_location() {
    let (fixture, runner) = broken_pip_env();
    let chosen = fixture.prefix.with_file_name("rescue").join("before.txt");
    let config = DoctorConfig {
        snapshot_path: Some(chosen.clone()),
        ..granted()
    };
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        config,
    );

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    let snapshot = report.environments[0]
        .snapshot
        .as_ref()
        .expect("must snapshot");
    assert!(snapshot.succeeded);
    assert_eq!(snapshot.path, chosen);
    assert_eq!(
        fs::read_to_string(&chosen).expect("must read snapshot"),
        "foo==2.0\n"
    );
    assert!(!fixture.layout.snapshots_dir().exists());
}

#[test]
fn interrupted_scan_only_run_keeps_saved_state() {
    let (fixture, runner) = broken_pip_env();
    let runner = runner.interrupt_on(is_pip_reinstall);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    let saved = read_interrupt_state(&fixture.layout)
        .expect("must read state")
        .expect("must persist state");
    assert!(saved.snapshot.is_some());

    let scan_runner = FakeRunner::new(&fixture.site).interrupt_on(is_site_query);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &scan_runner,
        DetectedManagers::default(),
        granted(),
    );
    let report = doctor
        .run(&[fixture.prefix.clone()], false, &mut NonInteractive)
        .expect("must run");
    assert_eq!(report.environments[0].disposition, Disposition::Interrupted);
    assert_eq!(report.exit_code, EXIT_INTERRUPTED);

    let after = read_interrupt_state(&fixture.layout)
        .expect("must read state")
        .expect("must keep state");
    assert_eq!(after, saved);
}

#[test]
fn unapproved_repairs_are_declined_without_mutation() {
    let (fixture, runner) = broken_pip_env();
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        DoctorConfig::default(),
    );

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    assert_eq!(report.environments[0].disposition, Disposition::Declined);
    assert_eq!(report.exit_code, EXIT_OK);
    assert!(fixture.site.join("~oo").exists());
    assert!(!fixture.layout.snapshots_dir().exists());
}

#[test]
fn plan_mode_lists_phases_and_runs_nothing() {
    let (fixture, runner) = broken_pip_env();
    let config = DoctorConfig {
        plan: true,
        ..granted()
    };
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        config,
    );

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Planned);
    let phases: Vec<&str> = env.plan.iter().map(|action| action.phase).collect();
    assert_eq!(
        phases,
        vec![
            RepairPhase::InvalidArtifacts.label(),
            RepairPhase::DuplicateDistInfo.label(),
            RepairPhase::DuplicatePackages.label(),
        ]
    );
    assert!(runner.seen_with("freeze").is_empty());
    assert!(fixture.site.join("~oo").exists());
}

#[test]
fn scan_only_runs_report_without_fixing() {
    let (fixture, runner) = broken_pip_env();
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    let report = doctor
        .run(&[fixture.prefix.clone()], false, &mut NonInteractive)
        .expect("must run");
    let env = &report.environments[0];
    assert_eq!(env.disposition, Disposition::Scanned);
    assert_eq!(env.issues.len(), 2);
    assert_eq!(report.exit_code, EXIT_OK);
}

#[test]
fn cross_channel_duplicates_are_relinked_through_conda() {
    let fixture = env_fixture(true);
    let listing = json!([
        {"name": "pkg", "version": "1.2.3", "channel": "pypi"},
        {"name": "pkg", "version": "1.2.3", "channel": "conda-forge"},
        {"name": "pkg-full", "version": "1.2.3", "channel": "defaults"},
    ])
    .to_string();
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.program() == "conda" && command.has_arg("list"),
        &listing,
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    let env = &report.environments[0];
    let methods: Vec<FixMethod> = env.fixes.iter().map(|fix| fix.method).collect();
    assert_eq!(methods, vec![FixMethod::PipUninstall, FixMethod::Manager]);
    assert_eq!(report.exit_code, EXIT_OK);

    let uninstall = runner.seen_with("uninstall");
    assert_eq!(uninstall.len(), 1);
    assert_eq!(uninstall[0].arguments().last().map(String::as_str), Some("pkg"));

    let relink: Vec<CommandSpec> = runner
        .seen_with("--force-reinstall")
        .into_iter()
        .filter(|command| command.program() == "conda")
        .collect();
    assert_eq!(relink.len(), 1);
    assert_eq!(relink[0].arguments().last().map(String::as_str), Some("pkg"));
    assert_eq!(
        env.snapshot.as_ref().map(|snapshot| snapshot.kind),
        Some(SnapshotKind::ManagerExport)
    );
}

#[test]
fn broken_metadata_owners_are_reinstalled() {
    let fixture = env_fixture(true);
    write_record(
        &fixture.prefix,
        "zlib-1.3-h1.json",
        r#"{"name": "zlib", "version": "1.3", "build": "h1", "subdir": "linux-64"}"#,
    );
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .run(&[fixture.prefix.clone()], true, &mut NonInteractive)
        .expect("must run");
    let env = &report.environments[0];
    assert_eq!(env.fixes.len(), 1);
    assert_eq!(env.fixes[0].method, FixMethod::Manager);
    assert!(env.fixes[0].succeeded);
    assert!(runner
        .seen_with("install")
        .iter()
        .any(|command| command.has_arg("zlib") && command.has_arg("--force-reinstall")));

    // The scripted install leaves the record untouched, so it is still broken.
    assert_eq!(env.remaining.len(), 1);
    assert_eq!(report.exit_code, EXIT_UNRESOLVED);
}

#[test]
fn rollback_rejects_unknown_revision_before_mutation() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.has_arg("--revisions"),
        "2024-01-01 10:00:00  (rev 3)\n2024-01-02 10:00:00  (rev 4)\n2024-01-03 10:00:00  (rev 5)\n",
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let err = doctor
        .rollback(
            &fixture.prefix,
            RevisionTarget::Number(2),
            false,
            &mut NonInteractive,
        )
        .expect_err("must reject");
    assert!(matches!(
        err.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::UnknownRevision { .. })
    ));
    assert!(runner.seen_with("--revision").is_empty());
    assert!(!fixture.layout.snapshots_dir().exists());
}

#[test]
fn rollback_snapshots_then_installs_the_previous_revision() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.has_arg("--revisions"),
        "(rev 3)\n(rev 4)\n(rev 5)\n",
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .rollback(
            &fixture.prefix,
            RevisionTarget::Previous,
            false,
            &mut NonInteractive,
        )
        .expect("must roll back");
    assert_eq!(report.current, 5);
    assert_eq!(report.target, 4);
    assert!(report.succeeded);
    assert!(report.snapshot.is_some());
    assert!(report.post_scan.is_some());
    assert_eq!(report.exit_code(), EXIT_OK);

    let rollbacks = runner.seen_with("--revision");
    assert_eq!(rollbacks.len(), 1);
    assert_eq!(rollbacks[0].arguments().last().map(String::as_str), Some("4"));
}

#[test]
fn dry_run_rollback_needs_no_approval_and_takes_no_snapshot() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site)
        .on(|command| command.has_arg("--revisions"), "(rev 1)\n(rev 2)\n");
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        only_conda(),
        DoctorConfig::default(),
    );

    let report = doctor
        .rollback(
            &fixture.prefix,
            RevisionTarget::Latest,
            true,
            &mut NonInteractive,
        )
        .expect("must simulate");
    assert!(report.dry_run && report.succeeded);
    assert!(report.snapshot.is_none());
    assert_eq!(runner.seen_with("--dry-run").len(), 1);
}

#[test]
fn rebuild_refuses_existing_destinations() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());
    let inventory = EnvironmentInventory {
        environments: vec![PathBuf::from("/envs/Analysis")],
        ..EnvironmentInventory::default()
    };

    let by_path = doctor
        .rebuild(
            &fixture.prefix,
            &EnvTarget::Path(fixture.site.clone()),
            &inventory,
            false,
            &mut NonInteractive,
        )
        .expect_err("must refuse existing path");
    assert!(matches!(
        by_path.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::DestinationExists(_))
    ));

    let by_name = doctor
        .rebuild(
            &fixture.prefix,
            &EnvTarget::Name("analysis".to_string()),
            &inventory,
            false,
            &mut NonInteractive,
        )
        .expect_err("must refuse known name");
    assert!(matches!(
        by_name.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::DestinationExists(_))
    ));
    assert!(runner.seen.borrow().is_empty());
}

#[test]
fn rebuild_creates_from_export_and_verifies() {
    let fixture = env_fixture(true);
    let destination = fixture.prefix.with_file_name("demo-rebuilt");
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.has_arg("export"),
        "name: demo\ndependencies:\n  - python=3.11\n",
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .rebuild(
            &fixture.prefix,
            &EnvTarget::Path(destination.clone()),
            &EnvironmentInventory::default(),
            true,
            &mut NonInteractive,
        )
        .expect("must rebuild");
    assert!(report.created);
    let snapshot = report.snapshot.as_ref().expect("must export");
    assert!(snapshot.path.is_file());

    let creates = runner.seen_with("create");
    assert_eq!(creates.len(), 1);
    assert!(creates[0]
        .arguments()
        .contains(&destination.display().to_string()));
    let verification = report.verification.as_ref().expect("must verify");
    assert_eq!(verification.path, destination);
}

#[test]
fn inconsistency_diagnosis_reads_dry_run_output() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.has_arg("--dry-run"),
        "The environment is inconsistent, please check the package plan carefully\n\
The following packages are causing the inconsistency:\n\n\
  - conda-forge/linux-64::numpy==1.26.0=py311_0\n\
  - defaults::scipy-1.11.0-py311h1\n\n\
done\n",
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let diagnosis = doctor
        .diagnose_inconsistent(&fixture.prefix)
        .expect("must diagnose");
    assert!(diagnosis.inconsistent);
    assert_eq!(diagnosis.packages, vec!["numpy", "scipy"]);
    assert!(runner.seen_with("install").iter().all(|command| command.has_arg("--dry-run")));
}

#[test]
fn normal_inconsistency_fix_reinstalls_reported_packages() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site).on(
        |command| command.has_arg("--dry-run"),
        "The environment is inconsistent\n  - numpy-1.26.0-py311_0\n\n",
    );
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .fix_inconsistent(&fixture.prefix, InconsistencyLevel::Normal, &mut NonInteractive)
        .expect("must fix");
    assert_eq!(
        report.actions,
        vec![
            MaintenanceAction::Clean {
                scope: CleanScope::IndexCache.flag().to_string(),
                ok: true,
            },
            MaintenanceAction::ForceReinstall {
                packages: vec!["numpy".to_string()],
                ok: true,
            },
        ]
    );
    assert!(report.post_scan.is_some());
    assert_eq!(report.exit_code(), EXIT_OK);
}

#[test]
fn cache_fix_levels_map_to_clean_scopes() {
    let fixture = env_fixture(false);
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .cache_fix(CacheLevel::Safe, &mut NonInteractive)
        .expect("must clean");
    let cleans = runner.seen_with("clean");
    let scopes: Vec<&str> = cleans
        .iter()
        .filter_map(|command| command.arguments().get(1).map(String::as_str))
        .collect();
    assert_eq!(
        scopes,
        vec![CleanScope::IndexCache.flag(), CleanScope::TempFiles.flag()]
    );
    assert_eq!(report.actions.len(), 2);
    assert_eq!(CacheLevel::Aggressive.scopes(), &[CleanScope::All]);
}

#[test]
fn clobber_paths_map_to_owning_records() {
    let fixture = env_fixture(true);
    write_record(
        &fixture.prefix,
        "foo-1.0-py_0.json",
        r#"{"name": "foo", "version": "1.0", "build": "py_0", "files": ["lib/python3.11/site-packages/foo/__init__.py"]}"#,
    );
    let owned = fixture
        .prefix
        .join("lib/python3.11/site-packages/foo/__init__.py");
    let orphan = fixture.prefix.join("share/orphan.txt");
    let log = fixture.prefix.with_file_name("clobber.log");
    fs::write(
        &log,
        format!(
            "ClobberError: path '{}' is claimed twice.\nalso {}.\nunrelated /usr/lib/libc.so\n",
            owned.display(),
            orphan.display()
        ),
    )
    .expect("must write log");
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .diagnose_clobber(&fixture.prefix, &log)
        .expect("must diagnose");
    assert_eq!(report.conflicts.len(), 2);
    let owned_conflict = report
        .conflicts
        .iter()
        .find(|conflict| conflict.path == owned.display().to_string())
        .expect("must find owned path");
    assert_eq!(
        owned_conflict.relpath.as_deref(),
        Some("lib/python3.11/site-packages/foo/__init__.py")
    );
    let owner = owned_conflict.owner.as_ref().expect("must have owner");
    assert_eq!(owner.name.as_deref(), Some("foo"));
    assert_eq!(owner.record, "foo-1.0-py_0.json");

    let orphan_conflict = report
        .conflicts
        .iter()
        .find(|conflict| conflict.path == orphan.display().to_string())
        .expect("must find orphan path");
    assert!(orphan_conflict.owner.is_none());
}

#[test]
fn sibling_prefixes_are_not_inside_the_environment() {
    let log = "clobbered /opt/env2/lib/a.py and /opt/env/lib/b.py, then /OPT/ENV/Lib/c.py; /opt/env";
    assert_eq!(
        extract_prefix_paths(log, Path::new("/opt/env")),
        vec![
            "/OPT/ENV/Lib/c.py".to_string(),
            "/opt/env".to_string(),
            "/opt/env/lib/b.py".to_string(),
        ]
    );

    let fixture = env_fixture(true);
    let sibling = fixture.prefix.with_file_name("demo2").join("lib/x.py");
    let inside = fixture.prefix.join("lib/y.py");
    let log = fixture.prefix.with_file_name("clobber.log");
    fs::write(&log, format!("{} {}\n", sibling.display(), inside.display()))
        .expect("must write log");
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let report = doctor
        .diagnose_clobber(&fixture.prefix, &log)
        .expect("must diagnose");
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].relpath.as_deref(), Some("lib/y.py"));
}

#[test]
fn ssl_diagnosis_reports_openssl_and_package_caches() {
    let fixture = env_fixture(true);
    let info = json!({"root_prefix": "/opt/conda", "envs": [], "pkgs_dirs": ["/opt/conda/pkgs"]})
        .to_string();
    let runner = FakeRunner::new(&fixture.site)
        .on(|command| command.has_arg(OPENSSL_VERSION_SCRIPT), "OpenSSL 3.0.13 30 Jan 2024\n")
        .on(|command| command.has_arg("info"), &info);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());

    let diagnosis = doctor.diagnose_ssl(&fixture.prefix).expect("must diagnose");
    assert!(diagnosis.ok);
    assert_eq!(
        diagnosis.openssl_version.as_deref(),
        Some("OpenSSL 3.0.13 30 Jan 2024")
    );
    assert_eq!(diagnosis.manager.as_deref(), Some("conda"));
    assert_eq!(diagnosis.pkgs_dirs, vec![PathBuf::from("/opt/conda/pkgs")]);
}

#[test]
fn broken_ssl_import_is_reported_not_raised() {
    let fixture = env_fixture(false);
    let runner = FakeRunner::new(&fixture.site).fail_on(
        |command| command.has_arg(OPENSSL_VERSION_SCRIPT),
        "ImportError: DLL load failed while importing _ssl\n",
    );
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );

    let diagnosis = doctor.diagnose_ssl(&fixture.prefix).expect("must diagnose");
    assert!(!diagnosis.ok);
    assert_eq!(diagnosis.status, Some(1));
    assert!(diagnosis.openssl_version.is_none());
    assert_eq!(
        diagnosis.failure(),
        "ImportError: DLL load failed while importing _ssl"
    );
    assert!(diagnosis.manager.is_none());
}

#[test]
fn unreadable_clobber_log_is_a_precondition_failure() {
    let fixture = env_fixture(true);
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(fixture.layout.clone(), &runner, only_conda(), granted());
    let err = doctor
        .diagnose_clobber(&fixture.prefix, &fixture.prefix.join("missing.log"))
        .expect_err("must fail");
    assert!(matches!(
        err.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::LogUnreadable { .. })
    ));
}

#[test]
fn resume_without_state_reports_nothing() {
    let fixture = env_fixture(false);
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    let report = doctor.resume(true, &mut NonInteractive).expect("must resume");
    assert!(report.state.is_none());
    assert!(report.restored.is_none());
    assert_eq!(report.exit_code(), EXIT_OK);
}

#[test]
fn resume_restore_replays_the_recorded_snapshot() {
    let fixture = env_fixture(false);
    let requirements = fixture.layout.snapshots_dir().join("demo-1").join("requirements.txt");
    fs::create_dir_all(requirements.parent().expect("must have parent")).expect("must create dir");
    fs::write(&requirements, "foo==2.0\n").expect("must write snapshot");
    let state = InterruptState {
        target_prefix: fixture.prefix.clone(),
        snapshot: Some(Snapshot {
            path: requirements.clone(),
            succeeded: true,
            kind: SnapshotKind::PipFreeze,
        }),
        interrupted_command: vec!["pip".to_string()],
        timestamp: 1,
    };
    write_interrupt_state(&fixture.layout, &state).expect("must write state");
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );

    let report = doctor.resume(true, &mut NonInteractive).expect("must resume");
    assert_eq!(report.restored, Some(true));
    assert_eq!(runner.seen_with("-r").len(), 1);
    assert!(read_interrupt_state(&fixture.layout)
        .expect("must read")
        .is_some());
}

#[test]
fn resume_restore_without_snapshot_is_refused() {
    let fixture = env_fixture(false);
    let state = InterruptState {
        target_prefix: fixture.prefix.clone(),
        snapshot: None,
        interrupted_command: vec!["pip".to_string()],
        timestamp: 1,
    };
    write_interrupt_state(&fixture.layout, &state).expect("must write state");
    let runner = FakeRunner::new(&fixture.site);
    let doctor = Doctor::new(
        fixture.layout.clone(),
        &runner,
        DetectedManagers::default(),
        granted(),
    );
    let err = doctor
        .resume(true, &mut NonInteractive)
        .expect_err("must refuse");
    assert!(matches!(
        err.downcast_ref::<PreconditionError>(),
        Some(PreconditionError::NoSnapshot)
    ));
}
