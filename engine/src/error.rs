//! Error types for the staging engine.
//!
//! `EngineError` covers both job-level failures (bad source root, invalid
//! policy) and the per-file failures raised by `fs_ops`, `integrity` and
//! `manifest`. The orchestrator never lets a per-file error escape a run: it
//! turns it into an `ERROR` outcome and keeps going.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::model::ExitStatus;

/// Errors produced by the staging engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Path has no drive, share or root anchor (or is empty)
    #[error("Invalid path: {path} ({reason})")]
    InvalidPath { path: String, reason: String },

    /// Source directory does not exist
    #[error("Source directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    /// Source exists but is not a directory
    #[error("Source is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    /// Source directory could not be inspected
    #[error("Source directory access denied: {}", path.display())]
    SourceAccessDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Source already lies under a staging root
    #[error("Source path lies under a '{marker}' staging root: {}", path.display())]
    SourceInStagingRoot { path: PathBuf, marker: String },

    /// Policy values that cannot drive a run
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Job used out of order (e.g. run twice)
    #[error("Job is in state {state} and cannot {operation}")]
    JobState { state: String, operation: String },

    /// Failed to read from a file
    #[error("Failed to read file: {}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to write to a file
    #[error("Failed to write file: {}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to enumerate a directory
    #[error("Failed to enumerate directory: {}", path.display())]
    EnumerationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to create a directory
    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to delete a file
    #[error("Failed to delete file: {}", path.display())]
    RemoveFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Failed to append to the manifest
    #[error("Failed to append manifest record to {}: {reason}", path.display())]
    ManifestWrite { path: PathBuf, reason: String },
}

impl EngineError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::SourceAccessDenied { source, .. }
            | Self::ReadError { source, .. }
            | Self::WriteError { source, .. }
            | Self::EnumerationFailed { source, .. }
            | Self::DirectoryCreationFailed { source, .. }
            | Self::RemoveFailed { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// The process exit status a job-level error should produce.
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::SourceInStagingRoot { .. } => ExitStatus::SafetyRefusal,
            _ => ExitStatus::ConfigError,
        }
    }

    /// Error message including the underlying I/O cause, for log lines.
    pub fn detail(&self) -> String {
        match std::error::Error::source(self) {
            Some(cause) => format!("{} ({})", self, cause),
            None => self.to_string(),
        }
    }
}
