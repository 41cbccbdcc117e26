const KNOWN_ALIASES: &[(&str, &[&str])] = &[
    ("torch", &["pytorch"]),
    ("tables", &["pytables"]),
    ("msgpack", &["msgpack-python"]),
    ("opencv-python", &["opencv", "py-opencv"]),
    ("opencv-python-headless", &["opencv", "py-opencv"]),
    ("opencv-contrib-python", &["opencv", "py-opencv"]),
    ("pyqt5", &["pyqt"]),
    ("docker", &["docker-py"]),
    ("graphviz", &["python-graphviz"]),
    ("faiss-cpu", &["faiss-cpu", "faiss"]),
];

/// Canonical comparison key for a distribution name.
///
/// Case is folded and every run of `-`, `_` or `.` collapses to a single `-`,
/// so `Typing_Extensions` and `typing.extensions` compare equal.
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut pending_separator = false;
    for ch in name.trim().chars() {
        if matches!(ch, '-' | '_' | '.') {
            pending_separator = true;
            continue;
        }
        if pending_separator && !normalized.is_empty() {
            normalized.push('-');
        }
        pending_separator = false;
        normalized.push(ch.to_ascii_lowercase());
    }
    normalized
}

/// Candidate conda package names for a pip distribution, most specific first.
///
/// The first variant the manager reports as available wins, so ordering
/// matters: the literal name, its normalized forms, known renames and finally
/// the common `python-`/`-python`/`py-` affix conventions.
pub fn build_search_variants(pip_name: &str) -> Vec<String> {
    let mut variants = Vec::new();
    let mut push = |candidate: String| {
        if !candidate.is_empty() && !variants.contains(&candidate) {
            variants.push(candidate);
        }
    };

    let lowered = pip_name.trim().to_ascii_lowercase();
    let normalized = normalize_name(pip_name);
    push(lowered);
    push(normalized.clone());
    push(normalized.replace('-', "_"));

    for (pypi, conda_names) in KNOWN_ALIASES {
        if *pypi == normalized {
            for conda_name in *conda_names {
                push((*conda_name).to_string());
            }
        }
    }

    if let Some(stripped) = normalized.strip_prefix("python-") {
        push(stripped.to_string());
    }
    if let Some(stripped) = normalized.strip_suffix("-python") {
        push(stripped.to_string());
    }
    if let Some(stripped) = normalized.strip_prefix("py-") {
        push(stripped.to_string());
    }
    push(format!("{normalized}-python"));
    push(format!("python-{normalized}"));
    push(format!("py-{normalized}"));

    variants
}
