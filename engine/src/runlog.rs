//! Human-readable run log.
//!
//! Every tagged line of a run is appended to a log beside the source root
//! and a log beside the target root, so the history travels with both
//! trees. Logging is best effort: a sink that cannot be opened or written
//! is dropped with a warning and the run carries on.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::job::StageJob;

/// Suffix of run log file names (`<dir-name>_tapestage.log`).
pub const RUN_LOG_SUFFIX: &str = "_tapestage.log";

/// Log file placed beside `root`: `<parent>/<name>_tapestage.log`.
///
/// `None` for roots without a parent or a name (e.g. a drive root).
pub fn run_log_path(root: &Path) -> Option<PathBuf> {
    let name = root.file_name()?.to_string_lossy();
    let parent = root.parent().filter(|p| !p.as_os_str().is_empty())?;
    Some(parent.join(format!("{}{}", name, RUN_LOG_SUFFIX)))
}

#[derive(Debug)]
struct LogSink {
    path: PathBuf,
    file: File,
}

/// Appends identical lines to every open log file.
#[derive(Debug, Default)]
pub struct RunLog {
    sinks: Mutex<Vec<LogSink>>,
}

impl RunLog {
    /// Open (append mode) every path that can be opened.
    pub fn open<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let sinks = paths
            .into_iter()
            .filter_map(|path| {
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => Some(LogSink { path, file }),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "cannot open run log");
                        None
                    }
                }
            })
            .collect();
        RunLog {
            sinks: Mutex::new(sinks),
        }
    }

    /// Open the run logs for a job, plus an optional extra log file.
    ///
    /// The target-side log is left out when the staging root is locked. In
    /// simulation it is only opened when its directory already exists.
    pub fn for_job(job: &StageJob, extra: Option<&Path>) -> Self {
        let mut paths = Vec::new();
        if let Some(path) = run_log_path(&job.source_root) {
            paths.push(path);
        }

        if !job.lock.is_locked() {
            if let Some(path) = run_log_path(&job.layout.target_root) {
                let parent_ready = match path.parent() {
                    Some(parent) if job.mode().is_simulation() => parent.is_dir(),
                    Some(parent) => match fs::create_dir_all(parent) {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!(path = %parent.display(), error = %e, "cannot create run log directory");
                            false
                        }
                    },
                    None => false,
                };
                if parent_ready {
                    paths.push(path);
                }
            }
        }

        if let Some(extra) = extra {
            if !paths.iter().any(|p| p == extra) {
                paths.push(extra.to_path_buf());
            }
        }
        Self::open(paths)
    }

    /// Append one line to every sink; failing sinks are dropped.
    pub fn write_line(&self, line: &str) {
        let mut sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.retain_mut(|sink| match writeln!(sink.file, "{}", line) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(path = %sink.path.display(), error = %e, "run log write failed; closing it");
                false
            }
        });
    }

    /// Paths currently being written.
    pub fn paths(&self) -> Vec<PathBuf> {
        let sinks = self.sinks.lock().unwrap_or_else(|e| e.into_inner());
        sinks.iter().map(|s| s.path.clone()).collect()
    }
}
