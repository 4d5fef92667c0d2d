//! Temp-file-then-rename persistence.
//!
//! Every file the engine publishes (partition files, counter tables) goes
//! through [`write_atomic`] or [`write_atomic_with`]. The payload is written
//! to a hidden temp file in the target's directory, flushed and synced, then
//! renamed over the target. Readers therefore see either the previous version
//! or the complete new one. On failure the temp file is removed and the
//! target is left untouched.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Errors raised while publishing a file atomically.
#[derive(Debug, thiserror::Error)]
pub enum AtomicWriteError {
    #[error("target path {0} has no file name")]
    InvalidTarget(PathBuf),

    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to write temp file {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

/// Prefix shared by every temp file so store scans can skip them.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Temp file path used while publishing `target`.
///
/// # Errors
///
/// Returns [`AtomicWriteError::InvalidTarget`] if `target` has no file name.
pub fn temp_path_for(target: &Path) -> Result<PathBuf, AtomicWriteError> {
    let name = target
        .file_name()
        .ok_or_else(|| AtomicWriteError::InvalidTarget(target.to_path_buf()))?;
    let tmp_name = format!(
        "{TEMP_PREFIX}{}-{}",
        name.to_string_lossy(),
        std::process::id()
    );
    Ok(target.with_file_name(tmp_name))
}

/// Returns true if `path` names a temp file left by an interrupted write.
#[must_use]
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

/// Atomically replace `target` with `bytes`.
///
/// # Errors
///
/// Returns [`AtomicWriteError`] if the temp file cannot be written or renamed.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), AtomicWriteError> {
    write_atomic_with(target, |w| w.write_all(bytes))
}

/// Atomically replace `target` with whatever `write` produces.
///
/// # Errors
///
/// Returns [`AtomicWriteError`] if `write` fails, or if the temp file cannot
/// be synced or renamed.
pub fn write_atomic_with<F>(target: &Path, write: F) -> Result<(), AtomicWriteError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    publish(target, write, |from, to| fs::rename(from, to))
}

fn publish<F, R>(target: &Path, write: F, rename: R) -> Result<(), AtomicWriteError>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
    R: FnOnce(&Path, &Path) -> io::Result<()>,
{
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| AtomicWriteError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let tmp = temp_path_for(target)?;
    let written = write_temp(&tmp, write);
    if let Err(source) = written {
        discard(&tmp);
        return Err(AtomicWriteError::Write { path: tmp, source });
    }

    if let Err(source) = rename(&tmp, target) {
        discard(&tmp);
        return Err(AtomicWriteError::Rename {
            from: tmp,
            to: target.to_path_buf(),
            source,
        });
    }
    Ok(())
}

fn write_temp<F>(tmp: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> io::Result<()>,
{
    let file = File::create(tmp)?;
    let mut writer = BufWriter::new(file);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(io::IntoInnerError::into_error)?;
    file.sync_all()
}

fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %tmp.display(), error = %e, "failed to remove temp file");
    }
}
