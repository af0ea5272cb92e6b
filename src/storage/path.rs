// Validation of the user-supplied snapshot path
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::PathError;

const PROBE_PREFIX: &str = ".ipcache-probe-";

/// Check that `raw` names a file we could later write atomically.
///
/// - blank input returns `Ok(None)`: persistence is off, not broken
/// - the result is absolute with symlinks resolved; the file itself may
///   not exist yet
/// - the parent must exist, be a directory and accept a probe file
///
/// Nothing is created besides the short-lived probe.
pub fn validate_persistence_path(raw: &str) -> Result<Option<PathBuf>, PathError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    let absolute = make_absolute(Path::new(raw))?;
    let resolved = resolve_symlinks(&absolute)?;

    let parent = resolved
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PathError::NoFileName(resolved.clone()))?;

    match fs::metadata(&parent) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(PathError::ParentNotDirectory(parent)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(PathError::ParentMissing(parent))
        }
        Err(e) => return Err(PathError::Stat { path: parent, source: e }),
    }

    probe_writable(&parent)?;
    Ok(Some(resolved))
}

fn make_absolute(path: &Path) -> Result<PathBuf, PathError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(PathError::Absolute)?;
    Ok(cwd.join(path))
}

fn resolve_symlinks(absolute: &Path) -> Result<PathBuf, PathError> {
    let parent = absolute
        .parent()
        .ok_or_else(|| PathError::NoFileName(absolute.to_path_buf()))?;

    match fs::canonicalize(absolute) {
        Ok(resolved) => Ok(resolved),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // The leaf may be new; resolve the parent chain only.
            let name = absolute
                .file_name()
                .ok_or_else(|| PathError::NoFileName(absolute.to_path_buf()))?;

            match fs::canonicalize(parent) {
                Ok(parent) => Ok(parent.join(name)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(PathError::ParentMissing(parent.to_path_buf()))
                }
                Err(source) => Err(not_a_directory(parent).unwrap_or(PathError::ResolveParent {
                    path: parent.to_path_buf(),
                    source,
                })),
            }
        }
        Err(source) => Err(not_a_directory(parent).unwrap_or(PathError::Resolve {
            path: absolute.to_path_buf(),
            source,
        })),
    }
}

fn not_a_directory(parent: &Path) -> Option<PathError> {
    match fs::metadata(parent) {
        Ok(meta) if !meta.is_dir() => Some(PathError::ParentNotDirectory(parent.to_path_buf())),
        _ => None,
    }
}

// Permission bits lie on some platforms, so actually create a file.
fn probe_writable(dir: &Path) -> Result<(), PathError> {
    let probe = tempfile::Builder::new()
        .prefix(PROBE_PREFIX)
        .tempfile_in(dir)
        .map_err(|source| PathError::NotWritable {
            path: dir.to_path_buf(),
            source,
        })?;

    probe.close().map_err(PathError::ProbeCleanup)
}
