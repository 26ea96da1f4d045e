//! Append-only staging manifest.
//!
//! One JSON record per line under `<source>/.tape_transfer/manifest.jsonl`.
//! Records are never rewritten; the in-memory index is a fold over all
//! lines keeping the latest record per relative path. The manifest is a
//! robustness aid layered over the filesystem, so loading never fails a
//! run and append failures are reported to the caller as warnings.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Hidden per-source directory holding engine metadata.
pub const META_DIR_NAME: &str = ".tape_transfer";

pub const MANIFEST_FILE_NAME: &str = "manifest.jsonl";

/// Action recorded for a staged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestAction {
    #[serde(rename = "COPY")]
    Copy,
    #[serde(rename = "MOVE")]
    Move,
    #[serde(rename = "DELETE-SRC")]
    DeleteSource,
}

impl std::fmt::Display for ManifestAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestAction::Copy => write!(f, "COPY"),
            ManifestAction::Move => write!(f, "MOVE"),
            ManifestAction::DeleteSource => write!(f, "DELETE-SRC"),
        }
    }
}

/// One immutable manifest line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestRecord {
    pub ts: DateTime<Utc>,
    pub user: String,
    pub src_root: String,
    pub dst_root: String,
    pub rel: String,
    pub size: u64,
    /// Source modification time, float seconds since the Unix epoch
    pub mtime: f64,
    pub action: ManifestAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ManifestRecord {
    /// Render the record as a single manifest line (without newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Latest record per relative path.
#[derive(Debug, Clone, Default)]
pub struct ManifestIndex {
    entries: HashMap<String, ManifestRecord>,
    /// Well-formed records replayed
    pub records_read: u64,
    /// Lines skipped as unparseable
    pub malformed_lines: u64,
}

impl ManifestIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index by replaying records in order (last write wins).
    pub fn from_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = ManifestRecord>,
    {
        records.into_iter().fold(Self::new(), |mut index, record| {
            index.records_read += 1;
            index.insert(record);
            index
        })
    }

    /// Make a record the latest for its path.
    pub fn insert(&mut self, record: ManifestRecord) {
        self.entries.insert(record.rel.clone(), record);
    }

    pub fn get(&self, rel_path: &str) -> Option<&ManifestRecord> {
        self.entries.get(rel_path)
    }

    /// True iff the latest record for `rel_path` has exactly this size and
    /// an mtime within `tolerance_secs`.
    pub fn contains(&self, rel_path: &str, size: u64, mtime: f64, tolerance_secs: f64) -> bool {
        self.entries
            .get(rel_path)
            .map(|r| r.size == size && (r.mtime - mtime).abs() <= tolerance_secs)
            .unwrap_or(false)
    }

    /// Number of distinct relative paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Manifest location for a source root.
pub fn manifest_path(source_root: &Path) -> PathBuf {
    source_root.join(META_DIR_NAME).join(MANIFEST_FILE_NAME)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

fn parse_line(line: &[u8]) -> Option<ManifestRecord> {
    let record: ManifestRecord = serde_json::from_slice(line).ok()?;
    if record.rel.is_empty() {
        return None;
    }
    Some(record)
}

/// Replay the manifest into an index.
///
/// Never fails: a missing manifest is an empty index, an unreadable one is
/// logged and treated as empty, malformed lines are counted and skipped.
pub fn load_manifest(path: &Path) -> ManifestIndex {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no manifest yet");
            return ManifestIndex::new();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "manifest unreadable; continuing without it");
            return ManifestIndex::new();
        }
    };

    let mut index = ManifestIndex::new();
    for line in BufReader::new(file).split(b'\n') {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "manifest read interrupted; using records so far");
                break;
            }
        };
        let trimmed = trim_line(&line);
        if trimmed.is_empty() {
            continue;
        }
        match parse_line(trimmed) {
            Some(record) => {
                index.records_read += 1;
                index.insert(record);
            }
            None => index.malformed_lines += 1,
        }
    }

    if index.malformed_lines > 0 {
        tracing::warn!(
            path = %path.display(),
            malformed = index.malformed_lines,
            "skipped malformed manifest lines"
        );
    }
    tracing::debug!(
        path = %path.display(),
        records = index.records_read,
        paths = index.len(),
        "manifest loaded"
    );
    index
}

/// Durably append one record.
pub fn append_record(path: &Path, record: &ManifestRecord) -> Result<(), EngineError> {
    let fail = |reason: String| EngineError::ManifestWrite {
        path: path.to_path_buf(),
        reason,
    };

    let mut line = record.to_line().map_err(|e| fail(e.to_string()))?;
    line.push('\n');

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| fail(e.to_string()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| fail(e.to_string()))?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.sync_data())
        .map_err(|e| fail(e.to_string()))
}
