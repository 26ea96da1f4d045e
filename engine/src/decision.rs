//! Per-file transfer policy.
//!
//! `decide` is a pure function of a metadata snapshot and the policy. The
//! only I/O it can trigger is the integrity comparison, which the caller
//! supplies as a closure and which runs solely on the "destination exists,
//! MOVE-eligible, no overwrite" branch. Precedence:
//!
//! filter -> path length -> classify -> exists+move (verify) -> manifest
//! -> exists+overwrite -> exists+copy -> act

use std::fmt;
use std::path::Path;

use crate::error::EngineError;
use crate::integrity::IntegrityVerdict;
use crate::model::{FileEntry, StagePolicy, TransferAction};

/// Why a file is MOVE-eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveReason {
    Size,
    Extension(String),
    Keyword(String),
}

impl fmt::Display for MoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MoveReason::Size => write!(f, "size above threshold"),
            MoveReason::Extension(ext) => write!(f, "extension {}", ext),
            MoveReason::Keyword(kw) => write!(f, "keyword '{}'", kw),
        }
    }
}

/// Copy-vs-move classification of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Copy,
    Move(MoveReason),
}

impl Classification {
    pub fn is_move(&self) -> bool {
        matches!(self, Classification::Move(_))
    }
}

/// Classify a file by size, extension and name keywords.
pub fn classify(entry: &FileEntry, policy: &StagePolicy) -> Classification {
    if entry.size > policy.move_threshold_bytes {
        return Classification::Move(MoveReason::Size);
    }
    let ext = entry.extension();
    if !ext.is_empty() && policy.move_exts.contains(&ext) {
        return Classification::Move(MoveReason::Extension(ext));
    }
    let name = entry.file_name().to_lowercase();
    if let Some(kw) = policy.move_keywords.iter().find(|k| name.contains(k.as_str())) {
        return Classification::Move(MoveReason::Keyword(kw.clone()));
    }
    Classification::Copy
}

/// What is at the destination path right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DestinationState {
    Absent,
    Present { size: u64, mtime: f64 },
}

/// Immutable snapshot the decision is made from.
#[derive(Debug, Clone)]
pub struct DecisionInput<'a> {
    pub entry: &'a FileEntry,
    pub destination: &'a Path,
    pub destination_state: DestinationState,
    /// Latest manifest record matches size and mtime
    pub manifest_hit: bool,
}

/// Why an existing destination was left alone.
#[derive(Debug, Clone, PartialEq)]
pub enum ExistingReason {
    /// MOVE-eligible and the integrity check failed; source is kept
    VerifyMismatch(IntegrityVerdict),
    /// COPY-eligible and size and mtime agree
    AlreadyTransferred,
    /// COPY-eligible and size or mtime differ; needs overwrite
    Differs,
}

/// Decision for one file; one case per `TransferAction`, with details.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    SkipFiltered,
    PathTooLong { length: usize, limit: usize },
    VerifyFailed { message: String },
    DeleteSource,
    SkipManifest,
    SkipExisting(ExistingReason),
    Transfer {
        class: Classification,
        replace_existing: bool,
    },
}

impl Decision {
    pub fn action(&self) -> TransferAction {
        match self {
            Decision::SkipFiltered => TransferAction::SkipFiltered,
            Decision::PathTooLong { .. } | Decision::VerifyFailed { .. } => TransferAction::Error,
            Decision::DeleteSource => TransferAction::DeleteSource,
            Decision::SkipManifest => TransferAction::SkipManifest,
            Decision::SkipExisting(_) => TransferAction::SkipMismatch,
            Decision::Transfer { class, .. } => {
                if class.is_move() {
                    TransferAction::Move
                } else {
                    TransferAction::Copy
                }
            }
        }
    }
}

/// Decide what to do with one file.
///
/// `verify` compares source and the existing destination; it is called at
/// most once, and only for a MOVE-eligible file whose destination exists
/// while overwrite is off.
pub fn decide<F>(input: &DecisionInput<'_>, policy: &StagePolicy, verify: F) -> Decision
where
    F: FnOnce() -> Result<IntegrityVerdict, EngineError>,
{
    let entry = input.entry;

    if !policy.include_exts.is_empty() && !policy.include_exts.contains(&entry.extension()) {
        return Decision::SkipFiltered;
    }

    let length = input.destination.to_string_lossy().chars().count();
    if length > policy.max_path_len {
        return Decision::PathTooLong {
            length,
            limit: policy.max_path_len,
        };
    }

    let class = classify(entry, policy);
    let exists = matches!(input.destination_state, DestinationState::Present { .. });

    if exists && class.is_move() && !policy.overwrite {
        return match verify() {
            Ok(IntegrityVerdict::Match) => Decision::DeleteSource,
            Ok(verdict) => Decision::SkipExisting(ExistingReason::VerifyMismatch(verdict)),
            Err(e) => Decision::VerifyFailed {
                message: e.detail(),
            },
        };
    }

    if input.manifest_hit && !policy.bypass_manifest {
        return Decision::SkipManifest;
    }

    match input.destination_state {
        DestinationState::Present { .. } if policy.overwrite => Decision::Transfer {
            class,
            replace_existing: true,
        },
        DestinationState::Present { size, mtime } => {
            let same = size == entry.size
                && (mtime - entry.mtime).abs() <= policy.mtime_tolerance_secs;
            Decision::SkipExisting(if same {
                ExistingReason::AlreadyTransferred
            } else {
                ExistingReason::Differs
            })
        }
        DestinationState::Absent => Decision::Transfer {
            class,
            replace_existing: false,
        },
    }
}
