//! Crash-safe file replacement
//!
//! Writers produce a sibling `<name>.tmp`, flush and fsync it, then rename it
//! over the destination. A crash leaves either the old or the new file, plus
//! at worst a stray temp file that `sweep_temp_files` removes on next open.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Sibling temporary path for `path`
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TEMP_SUFFIX);
    path.with_file_name(name)
}

/// Replace `path` with `data` atomically
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    replace_with(path, |file| file.write_all(data))
}

/// Create the temp file, let `fill` write it, then commit it over `path`
///
/// The temp file is removed if any step fails.
pub(crate) fn replace_with<E, F>(path: &Path, fill: F) -> Result<(), E>
where
    F: FnOnce(&mut File) -> Result<(), E>,
    E: From<io::Error>,
{
    let temp = temp_path(path);
    let result = (|| -> Result<(), E> {
        let mut file = File::create(&temp)?;
        fill(&mut file)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp, path)?;
        sync_parent(path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp);
    }
    result
}

/// Remove temp files left behind by an interrupted write
pub(crate) fn sweep_temp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_string_lossy().ends_with(TEMP_SUFFIX) && entry.file_type()?.is_file() {
            fs::remove_file(entry.path())?;
            debug!(file = %name.to_string_lossy(), "Removed stale temp file");
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(unix)]
pub(crate) fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
pub(crate) fn sync_parent(_path: &Path) -> io::Result<()> {
    Ok(())
}
