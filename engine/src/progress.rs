//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! staging engine from any specific front end. The CLI prints the lines and
//! forwards them to the run log; tests record them.

use crate::job::StageJob;
use crate::model::{RunSummary, TransferAction};

/// Result of processing one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    /// Relative path with `/` separators
    pub rel_path: String,
    pub action: TransferAction,
    /// Bytes copied or moved (zero for skips and simulated actions)
    pub bytes: u64,
    /// True if the action was only reported, not performed
    pub simulated: bool,
    /// Reason for skips and errors
    pub detail: Option<String>,
}

/// Trait for receiving progress updates from a staging job.
///
/// All methods are called synchronously on the thread running the job.
pub trait ProgressCallback: Send {
    /// Called once after the run header has been emitted.
    fn on_job_started(&self, job: &StageJob);

    /// Called for every human-readable log line (`[COPY] ...`, `[SIM] ...`).
    fn on_log_line(&self, line: &str);

    /// Called when a file is done (acted on, skipped, or failed).
    fn on_file_completed(&self, job: &StageJob, outcome: &FileOutcome);

    /// Called when the run is over, including cancelled runs.
    fn on_job_completed(&self, job: &StageJob, summary: &RunSummary);
}
