//! Startup recovery
//!
//! A crash between staging and publishing leaves a hidden `.{name}.tmp`
//! file behind. Published files are never partial, so recovery is only a
//! matter of deleting those artifacts before the first flush.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::atomic::TEMP_SUFFIX;

/// Whether `name` looks like a staging artifact.
pub fn is_orphaned_temp(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

/// Delete every staging artifact directly inside `dir`. Returns the removed
/// paths. A missing directory has nothing to sweep.
pub fn sweep_orphaned_temps(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut removed = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if !is_orphaned_temp(&name.to_string_lossy()) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) => warn!(path = %path.display(), error = %err, "Could not remove orphaned temp file"),
        }
    }

    if !removed.is_empty() {
        info!(dir = %dir.display(), removed = removed.len(), "Removed orphaned temp files");
    }
    Ok(removed)
}
