//! Core data model for staging runs.
//!
//! This module defines the data structures shared by every stage of a run:
//! - FileEntry: one file under the source root at transfer time
//! - TransferAction: the outcome of the decision engine for one file
//! - StagePolicy: every tunable that drives classification and safety checks
//! - RunSummary, RunMode, ExitStatus: what a run reports back

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::EngineError;
use crate::integrity::SampleParams;
use crate::path_map::PathMapper;

/// Bytes in one GiB; the move threshold is configured in these units.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Windows MAX_PATH without the terminating NUL.
pub const DEFAULT_MAX_PATH_LEN: usize = 259;

/// A single file under the source root, as seen at transfer time.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Root-relative path with forward slashes; the manifest key
    pub rel_path: String,

    /// Root-relative path exactly as found on disk; destinations join this
    pub rel_native: PathBuf,

    /// Full source path
    pub source_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Modification time in seconds since the Unix epoch
    pub mtime: f64,
}

impl FileEntry {
    /// File name component of the relative path.
    pub fn file_name(&self) -> &str {
        self.rel_path.rsplit('/').next().unwrap_or(&self.rel_path)
    }

    /// Lower-cased extension including the leading dot, or "" if none.
    pub fn extension(&self) -> String {
        let name = self.file_name();
        match name.rfind('.') {
            Some(0) | None => String::new(),
            Some(idx) => name[idx..].to_lowercase(),
        }
    }
}

/// Convert a modification time to float seconds since the Unix epoch.
pub fn mtime_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Outcome of the decision engine for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferAction {
    /// Extension not in the include list
    SkipFiltered,
    /// Already recorded in the manifest with matching size and mtime
    SkipManifest,
    /// Destination exists and is left alone (differs, or already transferred)
    SkipMismatch,
    /// Duplicate source into the staging tree
    Copy,
    /// Relocate source into the staging tree
    Move,
    /// Destination verified identical; remove the leftover source
    DeleteSource,
    /// Per-file failure
    Error,
}

impl fmt::Display for TransferAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferAction::SkipFiltered => "SKIP_FILTERED",
            TransferAction::SkipManifest => "SKIP_MANIFEST",
            TransferAction::SkipMismatch => "SKIP_MISMATCH",
            TransferAction::Copy => "COPY",
            TransferAction::Move => "MOVE",
            TransferAction::DeleteSource => "DELETE_SOURCE",
            TransferAction::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Normalize extensions to lower-case with a leading dot, dropping blanks.
pub fn normalize_exts<I, S>(exts: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    exts.into_iter()
        .filter_map(|e| {
            let e = e.as_ref().trim();
            if e.is_empty() || e == "." {
                return None;
            }
            let e = e.to_lowercase();
            Some(if e.starts_with('.') { e } else { format!(".{}", e) })
        })
        .collect()
}

/// Lower-case keywords, dropping blanks.
pub fn normalize_keywords<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    keys.into_iter()
        .map(|k| k.as_ref().trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Policy parameters for a staging run.
#[derive(Debug, Clone)]
pub struct StagePolicy {
    /// Only these extensions are processed (empty = everything)
    pub include_exts: BTreeSet<String>,

    /// Extensions that are always moved
    pub move_exts: BTreeSet<String>,

    /// Case-insensitive name substrings that force a move
    pub move_keywords: Vec<String>,

    /// Files strictly larger than this are moved
    pub move_threshold_bytes: u64,

    /// Replace existing destination files
    pub overwrite: bool,

    /// User-requested simulation
    pub simulate: bool,

    /// Ignore the manifest when deciding (records are still appended)
    pub bypass_manifest: bool,

    /// Allow a source root that already lies under a staging root
    pub allow_source_in_staging: bool,

    /// Integrity sampling parameters
    pub sample: SampleParams,

    /// Tolerance for manifest mtime comparisons, in seconds
    pub mtime_tolerance_secs: f64,

    /// Longest destination path (in characters) the engine will attempt
    pub max_path_len: usize,

    /// Source root to staging root mapping
    pub mapper: PathMapper,
}

impl Default for StagePolicy {
    fn default() -> Self {
        StagePolicy {
            include_exts: BTreeSet::new(),
            move_exts: BTreeSet::new(),
            move_keywords: Vec::new(),
            move_threshold_bytes: 10 * GIB,
            overwrite: false,
            simulate: false,
            bypass_manifest: false,
            allow_source_in_staging: false,
            sample: SampleParams::default(),
            mtime_tolerance_secs: 2.0,
            max_path_len: DEFAULT_MAX_PATH_LEN,
            mapper: PathMapper::default(),
        }
    }
}

impl StagePolicy {
    /// Convert a threshold given in (possibly fractional) GiB to bytes.
    pub fn threshold_from_gb(gb: f64) -> Result<u64, EngineError> {
        if !gb.is_finite() || gb < 0.0 {
            return Err(EngineError::InvalidPolicy(format!(
                "move threshold must be a non-negative number of GB, got {}",
                gb
            )));
        }
        Ok((gb * GIB as f64) as u64)
    }

    /// Reject parameter combinations that cannot drive a run.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.sample.block_count == 0 {
            return Err(EngineError::InvalidPolicy(
                "sample block count must be at least 1".to_string(),
            ));
        }
        if self.sample.block_size == 0 {
            return Err(EngineError::InvalidPolicy(
                "sample block size must be at least 1 byte".to_string(),
            ));
        }
        if !self.mtime_tolerance_secs.is_finite() || self.mtime_tolerance_secs < 0.0 {
            return Err(EngineError::InvalidPolicy(format!(
                "mtime tolerance must be a non-negative number of seconds, got {}",
                self.mtime_tolerance_secs
            )));
        }
        if self.max_path_len == 0 {
            return Err(EngineError::InvalidPolicy(
                "maximum path length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a run treats the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Actions are performed
    Live,
    /// User-requested simulation
    Simulation,
    /// Simulation forced by the lock marker
    LockedSimulation,
}

impl RunMode {
    /// True when no filesystem mutation may happen.
    pub fn is_simulation(&self) -> bool {
        !matches!(self, RunMode::Live)
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Live => write!(f, "LIVE"),
            RunMode::Simulation => write!(f, "SIMULATION"),
            RunMode::LockedSimulation => write!(f, "SIMULATION (forced by lock)"),
        }
    }
}

/// Stable process exit signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Completed with zero errors
    Success,
    /// Completed with one or more per-file errors
    FileErrors,
    /// Configuration error; nothing was mutated
    ConfigError,
    /// Source already lies under a staging root
    SafetyRefusal,
    /// Lock marker present; run forced into simulation
    Locked,
}

impl ExitStatus {
    /// Process exit code.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::FileErrors => 1,
            ExitStatus::ConfigError => 2,
            ExitStatus::SafetyRefusal => 3,
            ExitStatus::Locked => 4,
        }
    }
}

/// End-of-run counters and status.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mode: RunMode,
    pub files_seen: u64,
    pub copied: u64,
    pub moved: u64,
    pub deleted_source: u64,
    pub skipped_manifest: u64,
    pub skipped_existing: u64,
    pub skipped_filtered: u64,
    pub errors: u64,
    pub bytes_copied: u64,
    pub bytes_moved: u64,
    pub manifest_write_failures: u64,
    pub manifest_malformed: u64,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn new(mode: RunMode) -> Self {
        RunSummary {
            mode,
            files_seen: 0,
            copied: 0,
            moved: 0,
            deleted_source: 0,
            skipped_manifest: 0,
            skipped_existing: 0,
            skipped_filtered: 0,
            errors: 0,
            bytes_copied: 0,
            bytes_moved: 0,
            manifest_write_failures: 0,
            manifest_malformed: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }

    /// Number of copy, move and delete-source actions (performed or intended).
    pub fn actions(&self) -> u64 {
        self.copied + self.moved + self.deleted_source
    }

    /// Exit status for automation. A lock-forced run always reports `Locked`.
    pub fn exit_status(&self) -> ExitStatus {
        if self.mode == RunMode::LockedSimulation {
            ExitStatus::Locked
        } else if self.errors > 0 {
            ExitStatus::FileErrors
        } else {
            ExitStatus::Success
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Copied: {} | Moved: {} | Deleted-source: {} | Skipped (manifest): {} | \
             Skipped (existing): {} | Skipped (filtered): {} | Errors: {}",
            self.copied,
            self.moved,
            self.deleted_source,
            self.skipped_manifest,
            self.skipped_existing,
            self.skipped_filtered,
            self.errors
        )
    }
}
