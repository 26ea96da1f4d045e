//! Filesystem operations module.
//!
//! This module provides the low-level operations the orchestrator drives:
//! - Walking the source tree (skipping the engine's own artifacts)
//! - Copying files through a partial file with mtime preservation
//! - Moving files, with a copy-then-delete fallback across volumes
//! - Creating directories recursively and deleting files
//! - Clearing partial files left by an interrupted copy
//!
//! Every function reports failure as an `EngineError`; none of them panics
//! or aborts a run on its own.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::decision::DestinationState;
use crate::error::EngineError;
use crate::lock::LOCK_MARKER_NAME;
use crate::manifest::META_DIR_NAME;
use crate::model::{mtime_secs, FileEntry};
use crate::runlog::RUN_LOG_SUFFIX;

/// Suffix of in-flight copies; renamed away once complete.
pub const PARTIAL_SUFFIX: &str = ".tapestage-partial";

/// One item produced by the source walk.
#[derive(Debug)]
pub enum WalkItem {
    /// A directory (the root itself has an empty relative path)
    Dir {
        rel_path: String,
        rel_native: PathBuf,
        path: PathBuf,
    },
    File(FileEntry),
    Failed { path: PathBuf, error: EngineError },
}

/// True for files the engine itself writes and must never stage.
pub fn is_engine_artifact(file_name: &str) -> bool {
    file_name == LOCK_MARKER_NAME
        || file_name == META_DIR_NAME
        || file_name.ends_with(RUN_LOG_SUFFIX)
        || file_name.ends_with(PARTIAL_SUFFIX)
}

/// Forward-slash form of a relative path, used as the manifest key.
pub fn manifest_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk the source tree, visiting every directory and file once.
///
/// Entries are sorted by name and symlinks are not descended. Metadata
/// directories and engine artifacts are skipped at any depth, and so is
/// `prune` (the staging root, when it lies inside the source).
pub fn walk_source<'a>(root: &'a Path, prune: Option<&'a Path>) -> impl Iterator<Item = WalkItem> + 'a {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |e| {
            e.depth() == 0
                || !(e.file_name() == META_DIR_NAME || prune.is_some_and(|p| e.path() == p))
        })
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().unwrap_or(root).to_path_buf();
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
                    return Some(WalkItem::Failed {
                        error: EngineError::EnumerationFailed {
                            path: path.clone(),
                            source,
                        },
                        path,
                    });
                }
            };

            let path = entry.path().to_path_buf();
            let rel_native = path.strip_prefix(root).unwrap_or(path.as_path()).to_path_buf();
            let rel_path = manifest_key(&rel_native);

            if entry.file_type().is_dir() {
                return Some(WalkItem::Dir {
                    rel_path,
                    rel_native,
                    path,
                });
            }
            if is_engine_artifact(&entry.file_name().to_string_lossy()) {
                return None;
            }

            // Symlinked files are staged by content, like any other file
            match fs::metadata(&path) {
                Ok(metadata) if metadata.is_file() => Some(WalkItem::File(FileEntry {
                    rel_path,
                    rel_native,
                    source_path: path,
                    size: metadata.len(),
                    mtime: metadata.modified().map(mtime_secs).unwrap_or(0.0),
                })),
                // Linked directories are mirrored but not descended
                Ok(metadata) if metadata.is_dir() => Some(WalkItem::Dir {
                    rel_path,
                    rel_native,
                    path,
                }),
                Ok(_) => Some(WalkItem::Failed {
                    error: EngineError::ReadError {
                        path: path.clone(),
                        source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
                    },
                    path,
                }),
                Err(e) => Some(WalkItem::Failed {
                    error: EngineError::ReadError {
                        path: path.clone(),
                        source: e,
                    },
                    path,
                }),
            }
        })
}

/// Inspect a destination path without following symlinks.
pub fn destination_state(path: &Path) -> Result<DestinationState, EngineError> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => Ok(DestinationState::Present {
            size: metadata.len(),
            mtime: metadata.modified().map(mtime_secs).unwrap_or(0.0),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DestinationState::Absent),
        Err(e) => Err(EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Create a directory and its parents if missing.
///
/// Returns true if anything was created.
pub fn ensure_dir(path: &Path) -> Result<bool, EngineError> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(false),
        Ok(_) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::AlreadyExists,
                "Path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| EngineError::DirectoryCreationFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            Ok(true)
        }
        Err(e) => Err(EngineError::DirectoryCreationFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<bool, EngineError> {
    match path.parent() {
        // Skip if parent is empty path (root or relative root)
        Some(parent) if !parent.as_os_str().is_empty() => ensure_dir(parent),
        _ => Ok(false),
    }
}

fn partial_path(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(PARTIAL_SUFFIX);
    dst.with_file_name(name)
}

/// Delete `.tapestage-partial` files left in `dir` by an interrupted copy.
///
/// Returns the paths removed. Entries that cannot be removed are skipped
/// with a warning.
pub fn remove_stale_partials(dir: &Path) -> Result<Vec<PathBuf>, EngineError> {
    let entries = fs::read_dir(dir).map_err(|e| EngineError::EnumerationFailed {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let is_partial = entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX);
        if !is_partial || !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove stale partial file"),
        }
    }
    Ok(removed)
}

/// Copy a file, preserving its modification time.
///
/// Content goes to `<dst>.tapestage-partial` first and is renamed into place
/// only once complete, so an interrupted copy never leaves a full-looking
/// destination behind.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| EngineError::ReadError {
        path: src.to_path_buf(),
        source: e,
    })?;
    let src_mtime = src_file
        .metadata()
        .and_then(|m| m.modified())
        .map_err(|e| EngineError::ReadError {
            path: src.to_path_buf(),
            source: e,
        })?;

    let partial = partial_path(dst);
    let result = (|| -> Result<u64, EngineError> {
        let mut dst_file = fs::File::create(&partial).map_err(|e| EngineError::WriteError {
            path: partial.clone(),
            source: e,
        })?;

        let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                EngineError::WriteError {
                    path: partial.clone(),
                    source: e,
                }
            } else {
                EngineError::ReadError {
                    path: src.to_path_buf(),
                    source: e,
                }
            }
        })?;
        dst_file.sync_all().map_err(|e| EngineError::WriteError {
            path: partial.clone(),
            source: e,
        })?;
        drop(dst_file);

        filetime::set_file_mtime(&partial, filetime::FileTime::from_system_time(src_mtime))
            .map_err(|e| EngineError::WriteError {
                path: partial.clone(),
                source: e,
            })?;
        fs::rename(&partial, dst).map_err(|e| EngineError::WriteError {
            path: dst.to_path_buf(),
            source: e,
        })?;
        Ok(bytes_copied)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

/// Move a file. Falls back to copy-then-delete when rename fails (e.g.
/// across volumes).
///
/// # Returns
/// Number of bytes moved
pub fn move_file(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    let size = fs::metadata(src)
        .map_err(|e| EngineError::ReadError {
            path: src.to_path_buf(),
            source: e,
        })?
        .len();
    ensure_parent_dir_exists(dst)?;

    match fs::rename(src, dst) {
        Ok(()) => Ok(size),
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %e,
                "rename failed; falling back to copy and delete"
            );
            let bytes = copy_file_with_metadata(src, dst)?;
            remove_file(src)?;
            Ok(bytes)
        }
    }
}

/// Delete a single file.
pub fn remove_file(path: &Path) -> Result<(), EngineError> {
    fs::remove_file(path).map_err(|e| EngineError::RemoveFailed {
        path: path.to_path_buf(),
        source: e,
    })
}
