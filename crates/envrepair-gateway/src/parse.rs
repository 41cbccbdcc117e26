use std::collections::BTreeSet;
use std::path::PathBuf;

use envrepair_core::{PackageEntry, PYPI_CHANNEL};
use serde::Serialize;
use serde_json::Value;

use crate::ManagerInfo;

const INCONSISTENT_MARKER: &str = "the environment is inconsistent";

pub fn parse_info(value: &Value) -> ManagerInfo {
    let base_prefix = ["base_prefix", "root_prefix", "base environment"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|prefix| !prefix.is_empty())
        .map(PathBuf::from);

    ManagerInfo {
        base_prefix,
        env_paths: string_list(value.get("envs")),
        pkgs_dirs: string_list(value.get("pkgs_dirs")),
    }
}

fn string_list(value: Option<&Value>) -> Vec<PathBuf> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(PathBuf::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Parses `list --json` output. Non-object items and entries without a string
/// name and version are ignored.
pub fn parse_list_entries(raw: &str) -> Vec<PackageEntry> {
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("name")?.as_str()?;
            let version = item.get("version")?.as_str()?;
            let channel = item
                .get("channel")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(PackageEntry::new(name, version, channel))
        })
        .collect()
}

pub fn parse_pip_list(raw: &str) -> Vec<PackageEntry> {
    parse_list_entries(raw)
        .into_iter()
        .map(|entry| PackageEntry::new(entry.name, entry.version, PYPI_CHANNEL))
        .collect()
}

/// Accepts both the `{name: [records]}` shape and the nested
/// `{"result": {"pkgs": [{name}]}}` shape some managers emit.
pub fn parse_search_names(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let Some(object) = value.as_object() else {
        return names;
    };

    if let Some(pkgs) = value
        .get("result")
        .and_then(|result| result.get("pkgs"))
        .and_then(Value::as_array)
    {
        for pkg in pkgs {
            if let Some(name) = pkg.get("name").and_then(Value::as_str) {
                names.insert(name.to_string());
            }
        }
        return names;
    }

    for (name, records) in object {
        if records.is_array() {
            names.insert(name.clone());
        }
    }
    names
}

/// Revision numbers from `list --revisions`. Both the `(rev N)` headers and a
/// bare leading integer followed by whitespace are recognised.
pub fn parse_revisions(raw: &str) -> BTreeSet<u64> {
    let mut revisions = BTreeSet::new();
    for line in raw.lines() {
        if let Some(revision) = rev_marker(line).or_else(|| leading_integer(line)) {
            revisions.insert(revision);
        }
    }
    revisions
}

fn rev_marker(line: &str) -> Option<u64> {
    let start = line.find("(rev ")? + "(rev ".len();
    let rest = &line[start..];
    let end = rest.find(')')?;
    rest[..end].trim().parse().ok()
}

fn leading_integer(line: &str) -> Option<u64> {
    let trimmed = line.trim_start();
    let digits_end = trimmed
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(trimmed.len());
    if digits_end == 0 {
        return None;
    }
    let rest = &trimmed[digits_end..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    trimmed[..digits_end].parse().ok()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InconsistencyReport {
    pub inconsistent: bool,
    pub packages: Vec<String>,
}

/// Scans dry-run solver output for the inconsistency banner and the package
/// list that follows it.
pub fn parse_inconsistent(output: &str) -> InconsistencyReport {
    let mut report = InconsistencyReport::default();
    let mut packages = BTreeSet::new();
    let mut collecting = false;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.to_ascii_lowercase().contains(INCONSISTENT_MARKER) {
            report.inconsistent = true;
            collecting = true;
            continue;
        }
        if !collecting {
            continue;
        }
        if let Some(item) = trimmed
            .strip_prefix("- ")
            .or_else(|| bare_package_line(line, trimmed))
        {
            if let Some(name) = package_name_from_spec(item) {
                packages.insert(name);
            }
        } else if !packages.is_empty() && trimmed.is_empty() {
            collecting = false;
        }
    }

    report.packages = packages.into_iter().collect();
    report
}

/// An indented single token such as `  numpy` or `  numpy-1.26.4-py311h0`.
fn bare_package_line<'a>(line: &str, trimmed: &'a str) -> Option<&'a str> {
    let indented = line.starts_with(char::is_whitespace);
    let single_token = !trimmed.is_empty() && !trimmed.contains(char::is_whitespace);
    (indented && single_token && !trimmed.ends_with(':')).then_some(trimmed)
}

fn package_name_from_spec(item: &str) -> Option<String> {
    let spec = item.trim();
    let spec = spec.rsplit_once("::").map_or(spec, |(_, rest)| rest);
    let name = if let Some(index) = spec.find('=') {
        &spec[..index]
    } else {
        let parts: Vec<&str> = spec.rsplitn(3, '-').collect();
        if parts.len() == 3 {
            parts[2]
        } else {
            spec
        }
    };
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub fn parse_channels(value: &Value) -> Vec<String> {
    value
        .get("channels")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn parse_site_packages(raw: &str) -> Vec<PathBuf> {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect(),
        _ => Vec::new(),
    }
}
