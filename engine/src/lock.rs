//! Lock marker detection.
//!
//! The archiving process drops a marker file directly inside the staging
//! root while it works on the tree. Its presence alone (content is ignored)
//! forces the whole run into simulation.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Name of the marker file inside the staging root.
pub const LOCK_MARKER_NAME: &str = "TAPE_TRANSFER.lock";

/// Result of probing the staging root for the lock marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Clear,
    Locked { marker: PathBuf },
}

impl LockState {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockState::Locked { .. })
    }
}

/// Path of the lock marker for a staging root.
pub fn lock_marker_path(staging_root: &Path) -> PathBuf {
    staging_root.join(LOCK_MARKER_NAME)
}

/// Probe the staging root for the lock marker. Read-only.
///
/// A probe that fails for any reason other than "not found" counts as
/// locked: an unreadable staging root is no place to write into.
pub fn check_lock(staging_root: &Path) -> LockState {
    let marker = lock_marker_path(staging_root);
    match fs::symlink_metadata(&marker) {
        Ok(_) => LockState::Locked { marker },
        Err(e) if e.kind() == io::ErrorKind::NotFound => LockState::Clear,
        Err(e) => {
            tracing::warn!(
                marker = %marker.display(),
                error = %e,
                "cannot probe lock marker; assuming locked"
            );
            LockState::Locked { marker }
        }
    }
}
