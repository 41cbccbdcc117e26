use std::fs;
use std::io;
use std::path::Path;

/// Removes a file or directory tree. An already-missing path counts as removed.
pub fn remove_path(path: &Path) -> bool {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(err) if err.kind() == io::ErrorKind::NotFound => return true,
        Err(err) => Err(err),
    };
    match result {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("failed to remove {}: {err}", path.display());
            false
        }
    }
}

/// Attempts every path and reports whether all of them are gone.
pub fn remove_paths<'a>(paths: impl IntoIterator<Item = &'a Path>) -> bool {
    paths
        .into_iter()
        .fold(true, |all_removed, path| remove_path(path) && all_removed)
}
