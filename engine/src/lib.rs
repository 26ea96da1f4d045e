//! # TapeStage Engine - Tape Staging Library
//!
//! A headless engine that stages a source directory tree into its derived
//! `TAPE_TRANSFER` mirror ahead of archival to tape.
//!
//! ## Overview
//!
//! For every file under the source root the engine decides whether to copy
//! it, move it, delete an already-staged source, or skip it, and records
//! each completed action in an append-only manifest so that reruns are
//! idempotent. It features:
//! - Deterministic, host-independent source-to-target path mapping
//! - A lock marker that forces the whole run into simulation
//! - Sampled content fingerprints guarding every source deletion
//! - Per-file error isolation and a counted end-of-run summary
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use tapestage_engine::{create_job, run_job, RunContext, StagePolicy};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Create a job: validates the source, maps it and probes the lock
//! let mut job = create_job(r"D:\data\run1", StagePolicy::default())?;
//! println!("Staging into {}", job.layout.target_root.display());
//!
//! // Run it
//! let ctx = RunContext::new("operator");
//! let summary = run_job(&mut job, &ctx, None)?;
//! println!("{}", summary);
//! std::process::exit(summary.exit_status().code());
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (FileEntry, StagePolicy, RunSummary)
//! - **error**: Error types and handling
//! - **context**: Run identity (operator, clock, run id)
//! - **path_map**: Source to staging path mapping
//! - **lock**: Lock marker detection
//! - **integrity**: Sampled content fingerprints
//! - **manifest**: Append-only manifest and its index
//! - **decision**: Per-file transfer decision
//! - **fs_ops**: Low-level filesystem operations
//! - **job**: Job orchestration (create, run)
//! - **progress**: Progress callback trait
//! - **runlog**: Human-readable run log files

pub mod context;
pub mod decision;
pub mod error;
pub mod fs_ops;
pub mod integrity;
pub mod job;
pub mod lock;
pub mod manifest;
pub mod model;
pub mod path_map;
pub mod progress;
pub mod runlog;

// Re-export main types and functions
pub use context::{Clock, FixedClock, RunContext, SystemClock};
pub use decision::{classify, decide, Classification, Decision, DecisionInput, DestinationState};
pub use error::EngineError;
pub use integrity::{
    compare_files, fingerprint_file, FingerprintAlgorithm, IntegrityVerdict, SampleParams,
    DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE,
};
pub use job::{create_job, run_job, JobState, StageJob};
pub use lock::{check_lock, LockState, LOCK_MARKER_NAME};
pub use manifest::{ManifestAction, ManifestIndex, ManifestRecord};
pub use model::{
    normalize_exts, normalize_keywords, ExitStatus, FileEntry, RunMode, RunSummary, StagePolicy,
    TransferAction, DEFAULT_MAX_PATH_LEN, GIB,
};
pub use path_map::{PathMapper, StagingLayout, STAGING_MARKER};
pub use progress::{FileOutcome, ProgressCallback};
pub use runlog::RunLog;
