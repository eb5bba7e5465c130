//! Stage-then-publish file writes
//!
//! Bytes go to a hidden `.{name}.tmp` sibling, are fsynced, and only then
//! renamed over the final name. Rename within one directory is atomic, so a
//! reader sees either nothing or the complete file; a crash mid-write leaves
//! only the temp artifact, which the startup sweep removes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const TEMP_SUFFIX: &str = ".tmp";

/// `dir/name` → `dir/.name.tmp`
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}{TEMP_SUFFIX}"))
}

pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp_path = temp_path_for(path);
    let staged = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()
    })();
    if let Err(err) = staged {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    fs::rename(&tmp_path, path)
}
