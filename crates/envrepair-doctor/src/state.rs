use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use envrepair_core::InterruptState;

use crate::WorkLayout;

pub fn current_unix_timestamp() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system time is before unix epoch")?
        .as_secs())
}

/// Overwrites any earlier interruption record.
pub fn write_interrupt_state(layout: &WorkLayout, state: &InterruptState) -> Result<PathBuf> {
    let path = layout.state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let payload =
        serde_json::to_string_pretty(state).context("failed to serialize interrupt state")?;
    fs::write(&path, payload)
        .with_context(|| format!("failed to write interrupt state: {}", path.display()))?;
    Ok(path)
}

pub fn read_interrupt_state(layout: &WorkLayout) -> Result<Option<InterruptState>> {
    let path = layout.state_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read interrupt state: {}", path.display())
            });
        }
    };
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse interrupt state: {}", path.display()))?;
    Ok(Some(state))
}
