use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use envrepair_core::{normalize_name, EnvironmentRecord, Issue, MetadataRecordRef};
use envrepair_gateway::{
    interpreter_path, is_managed_environment, CommandRunner, GatewayError, PipGateway,
};
use serde_json::{Map, Value};

use crate::MetadataHeuristics;

const DIST_INFO_SUFFIX: &str = ".dist-info";
const NATIVE_EXTENSIONS: &[&str] = &["pyd", "so"];
const TRASH_SUFFIX: &str = ".conda_trash";

/// Inspects one environment. Read-only; results are sorted so repeated scans
/// of an unchanged environment produce identical records.
///
/// Only an interruption of the interpreter query is an error. Every other
/// failure degrades into an issue or a skipped check.
pub fn scan_environment<R: CommandRunner>(
    prefix: &Path,
    runner: &R,
    heuristics: &MetadataHeuristics,
) -> Result<EnvironmentRecord, GatewayError> {
    let mut record = EnvironmentRecord::new(prefix);
    record.managed = is_managed_environment(prefix);
    record.pinned = read_pinned_specs(prefix);

    let Some(python) = interpreter_path(prefix) else {
        tracing::debug!("no interpreter under {}", prefix.display());
        record.issues.push(Issue::MissingInterpreter);
        return Ok(record);
    };
    record.interpreter = Some(python.clone());

    let queried = match PipGateway::new(&python, runner).site_packages() {
        Ok(paths) => paths,
        Err(err) if err.is_interrupted() => return Err(err),
        Err(err) => {
            tracing::warn!("site-packages query failed for {}: {err}", prefix.display());
            Vec::new()
        }
    };
    let site_packages: Vec<PathBuf> = queried
        .into_iter()
        .filter(|path| path.is_dir())
        .collect();
    if site_packages.is_empty() {
        tracing::debug!("no site-packages resolvable for {}", prefix.display());
        record.issues.push(Issue::MissingSitePackages);
        return Ok(record);
    }

    for site in &site_packages {
        record.issues.extend(scan_dist_info_duplicates(site));
        record.issues.extend(scan_native_duplicates(site));
        record.issues.extend(scan_invalid_artifacts(site));
    }
    record.site_packages = site_packages;

    if record.managed {
        record
            .issues
            .extend(scan_metadata_records(prefix, heuristics));
    }

    tracing::debug!(
        prefix = %prefix.display(),
        issues = record.issues.len(),
        "scan complete"
    );
    Ok(record)
}

fn sorted_entries(dir: &Path) -> Vec<(String, PathBuf)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::debug!("skipping unreadable {}: {err}", dir.display());
            return Vec::new();
        }
    };
    let mut entries: Vec<(String, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            Some((name, entry.path()))
        })
        .collect();
    entries.sort();
    entries
}

/// Groups `*.dist-info` directories by normalized distribution name and
/// reports names installed at more than one version.
pub fn scan_dist_info_duplicates(site: &Path) -> Vec<Issue> {
    let mut groups: BTreeMap<String, (BTreeSet<String>, Vec<PathBuf>)> = BTreeMap::new();
    for (name, path) in sorted_entries(site) {
        let Some(base) = name.strip_suffix(DIST_INFO_SUFFIX) else {
            continue;
        };
        if !path.is_dir() {
            continue;
        }
        let Some((dist, version)) = base.rsplit_once('-') else {
            continue;
        };
        let group = groups.entry(normalize_name(dist)).or_default();
        group.0.insert(version.to_string());
        group.1.push(path);
    }

    groups
        .into_iter()
        .filter(|(_, (versions, _))| versions.len() > 1)
        .map(|(package, (versions, paths))| Issue::DuplicateDistInfo {
            package,
            versions: versions.into_iter().collect(),
            paths,
        })
        .collect()
}

/// Reports native extension modules that appear more than once for the same
/// module and interpreter tag, e.g. `foo.cp310-win_amd64.pyd` next to a
/// copied `foo.cp310-win_amd64(1).pyd`. Modules built for different
/// interpreter tags are expected to coexist and are not reported.
pub fn scan_native_duplicates(site: &Path) -> Vec<Issue> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, path) in sorted_entries(site) {
        if !path.is_file() {
            continue;
        }
        if let Some(key) = native_module_key(&name) {
            groups.entry(key).or_default().push(name);
        }
    }

    groups
        .into_iter()
        .filter(|(_, files)| files.len() > 1)
        .map(|(base, files)| Issue::DuplicateNativeModule {
            base,
            files,
            site_packages: site.to_path_buf(),
        })
        .collect()
}

/// Module name plus interpreter tag, with copy markers such as `(1)` or
/// ` - Copy` removed from either part.
pub(crate) fn native_module_key(file_name: &str) -> Option<String> {
    let (stem, extension) = file_name.rsplit_once('.')?;
    if !NATIVE_EXTENSIONS
        .iter()
        .any(|native| extension.eq_ignore_ascii_case(native))
    {
        return None;
    }

    let (module, tag) = match stem.split_once('.') {
        Some((module, tag)) => (module, Some(tag)),
        None => (stem, None),
    };
    let module = strip_copy_marker(module);
    if module.is_empty() {
        return None;
    }
    Some(match tag.map(strip_copy_marker) {
        Some(tag) if !tag.is_empty() => format!("{module}.{tag}"),
        _ => module.to_string(),
    })
}

fn strip_copy_marker(part: &str) -> &str {
    let trimmed = part.trim_end();
    if let Some(stripped) = trimmed.strip_suffix(" - Copy") {
        return stripped.trim_end();
    }
    if let Some(open) = trimmed.rfind('(') {
        let inner = &trimmed[open + 1..];
        if let Some(digits) = inner.strip_suffix(')') {
            if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) {
                return trimmed[..open].trim_end();
            }
        }
    }
    trimmed
}

/// Leftovers from interrupted pip or conda operations: `~`-prefixed
/// directories and `.conda_trash` files.
pub fn scan_invalid_artifacts(site: &Path) -> Vec<Issue> {
    sorted_entries(site)
        .into_iter()
        .filter(|(name, _)| name.starts_with('~') || name.ends_with(TRASH_SUFFIX))
        .map(|(name, path)| Issue::InvalidArtifact { name, path })
        .collect()
}

pub fn scan_metadata_records(prefix: &Path, heuristics: &MetadataHeuristics) -> Vec<Issue> {
    let mut issues = Vec::new();
    for (name, path) in sorted_entries(&prefix.join("conda-meta")) {
        if !name.ends_with(".json") || !path.is_file() {
            continue;
        }
        let record = MetadataRecordRef::from_path(path.clone());
        let parsed = fs::read(&path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok());
        let Some(Value::Object(fields)) = parsed else {
            issues.push(Issue::MetadataInvalid { record });
            continue;
        };
        if fields.contains_key("depends") {
            continue;
        }
        if !missing_dependencies_is_benign(&fields, heuristics) {
            issues.push(Issue::MetadataMissingDependencies { record });
        }
    }
    issues
}

/// Minimal helper markers and noarch records may omit `depends`. A record is
/// broken when it lacks identity keys, or when it is a platform record that
/// otherwise looks like a full package record.
pub(crate) fn missing_dependencies_is_benign(
    fields: &Map<String, Value>,
    heuristics: &MetadataHeuristics,
) -> bool {
    let complete = heuristics
        .identity_keys
        .iter()
        .all(|key| fields.contains_key(key));
    if !complete {
        return false;
    }
    let noarch = fields.get("noarch").map(is_truthy).unwrap_or(false);
    let looks_real = heuristics
        .real_record_keys
        .iter()
        .any(|key| fields.contains_key(key));
    noarch || !looks_real
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Non-empty, non-comment lines of `conda-meta/pinned`.
pub fn read_pinned_specs(prefix: &Path) -> Vec<String> {
    let path = prefix.join("conda-meta").join("pinned");
    match fs::read_to_string(&path) {
        Ok(raw) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}
