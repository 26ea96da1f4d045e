//! Job orchestration module.
//!
//! This module provides the staging job lifecycle:
//! - Creating a job from a source root and a policy (validation, mapping,
//!   lock probe)
//! - Running a job (walking the tree, deciding and acting per file)
//!
//! Individual file errors are counted and logged but never stop a run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use uuid::Uuid;

use crate::context::RunContext;
use crate::decision::{decide, Classification, Decision, DecisionInput, ExistingReason};
use crate::error::EngineError;
use crate::fs_ops::{self, WalkItem};
use crate::integrity;
use crate::lock::{check_lock, LockState};
use crate::manifest::{self, ManifestAction, ManifestIndex, ManifestRecord};
use crate::model::{FileEntry, RunMode, RunSummary, StagePolicy, TransferAction, GIB};
use crate::path_map::{has_anchor, StagingLayout};
use crate::progress::{FileOutcome, ProgressCallback};

/// Lifecycle of a staging job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// A staging run over one source root.
#[derive(Debug)]
pub struct StageJob {
    pub id: Uuid,

    /// Absolute source root
    pub source_root: PathBuf,

    /// Where the source root maps to
    pub layout: StagingLayout,

    pub policy: StagePolicy,

    /// Lock marker state, probed once when the job is created
    pub lock: LockState,

    pub state: JobState,

    pub created_at: SystemTime,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,

    /// Set to request a stop before the next file
    pub cancel_flag: Option<Arc<AtomicBool>>,
}

impl StageJob {
    /// Effective mode: the lock marker overrides everything.
    pub fn mode(&self) -> RunMode {
        if self.lock.is_locked() {
            RunMode::LockedSimulation
        } else if self.policy.simulate {
            RunMode::Simulation
        } else {
            RunMode::Live
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        manifest::manifest_path(&self.source_root)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}

fn absolutize(source: &Path) -> Result<PathBuf, EngineError> {
    if has_anchor(&source.to_string_lossy()) {
        return Ok(source.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| EngineError::SourceAccessDenied {
        path: source.to_path_buf(),
        source: e,
    })?;
    Ok(cwd.join(source))
}

/// Create a new staging job.
///
/// Checks, in order: the path is non-empty, the source does not already lie
/// under a staging root (unless allowed), the path maps, the source is an
/// existing directory, and the policy is valid. Finally the lock marker is
/// probed. Nothing is written.
///
/// # Errors
/// Configuration errors; `SourceInStagingRoot` for the safety refusal.
pub fn create_job<P: AsRef<Path>>(source: P, policy: StagePolicy) -> Result<StageJob, EngineError> {
    let source = source.as_ref();
    if source.as_os_str().is_empty() {
        return Err(EngineError::InvalidPath {
            path: String::new(),
            reason: "Source path is empty".to_string(),
        });
    }

    let source_root = absolutize(source)?;
    if policy.mapper.contains_marker(&source_root.to_string_lossy()) && !policy.allow_source_in_staging {
        return Err(EngineError::SourceInStagingRoot {
            path: source_root,
            marker: policy.mapper.marker().to_string(),
        });
    }

    let layout = policy.mapper.map_path(&source_root)?;

    // Validate source exists and is a directory
    match std::fs::metadata(&source_root) {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(EngineError::NotADirectory { path: source_root });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::SourceNotFound { path: source_root });
        }
        Err(e) => {
            return Err(EngineError::SourceAccessDenied {
                path: source_root,
                source: e,
            });
        }
    }

    policy.validate()?;
    let lock = check_lock(&layout.staging_root);

    Ok(StageJob {
        id: Uuid::new_v4(),
        source_root,
        layout,
        policy,
        lock,
        state: JobState::Pending,
        created_at: SystemTime::now(),
        start_time: None,
        end_time: None,
        cancel_flag: None,
    })
}

/// Run a job, staging the source tree into its target root.
///
/// Transitions the job from Pending to Running to Completed (or Cancelled).
/// In simulation, lock-forced or requested, every decision is made and
/// reported but nothing is mutated and no manifest record is written.
///
/// # Errors
/// Only `JobState` if the job is not pending. File-level errors are
/// counted in the returned summary.
pub fn run_job(
    job: &mut StageJob,
    ctx: &RunContext,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<RunSummary, EngineError> {
    if job.state != JobState::Pending {
        return Err(EngineError::JobState {
            state: format!("{:?}", job.state),
            operation: "run".to_string(),
        });
    }

    job.state = JobState::Running;
    job.start_time = Some(SystemTime::now());

    let summary = Run::new(job, ctx, progress_callback).execute();

    job.state = if summary.cancelled {
        JobState::Cancelled
    } else {
        JobState::Completed
    };
    job.end_time = Some(SystemTime::now());

    tracing::info!(
        job_id = %job.id,
        mode = %summary.mode,
        copied = summary.copied,
        moved = summary.moved,
        deleted_source = summary.deleted_source,
        skipped_manifest = summary.skipped_manifest,
        errors = summary.errors,
        "staging run finished"
    );
    if let Some(callback) = progress_callback {
        callback.on_job_completed(job, &summary);
    }
    Ok(summary)
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / GIB as f64
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// State of one executing run.
struct Run<'a> {
    job: &'a StageJob,
    ctx: &'a RunContext,
    progress: Option<&'a dyn ProgressCallback>,
    index: ManifestIndex,
    summary: RunSummary,
    simulate: bool,
}

impl<'a> Run<'a> {
    fn new(job: &'a StageJob, ctx: &'a RunContext, progress: Option<&'a dyn ProgressCallback>) -> Self {
        let mode = job.mode();
        Run {
            job,
            ctx,
            progress,
            index: ManifestIndex::new(),
            summary: RunSummary::new(mode),
            simulate: mode.is_simulation(),
        }
    }

    fn log(&self, line: &str) {
        if let Some(callback) = self.progress {
            callback.on_log_line(line);
        }
    }

    /// Log a mutating action, marked as simulated when nothing is done.
    fn log_action(&self, line: &str) {
        if self.simulate {
            self.log(&format!("[SIM] {}", line));
        } else {
            self.log(line);
        }
    }

    fn execute(mut self) -> RunSummary {
        let started = Instant::now();
        let job = self.job;

        self.write_header();
        tracing::info!(
            job_id = %job.id,
            run_id = %self.ctx.run_id,
            source = %job.source_root.display(),
            target = %job.layout.target_root.display(),
            mode = %self.summary.mode,
            "staging run started"
        );
        if let Some(callback) = self.progress {
            callback.on_job_started(job);
        }

        if let LockState::Locked { marker } = &job.lock {
            tracing::warn!(marker = %marker.display(), "lock marker present; forcing simulation");
            self.log(&format!(
                "[LOCK] Lock marker present: {} - forcing simulation, nothing will be modified",
                marker.display()
            ));
        }

        if !job.policy.bypass_manifest {
            self.index = manifest::load_manifest(&job.manifest_path());
            self.summary.manifest_malformed = self.index.malformed_lines;
            if self.index.malformed_lines > 0 {
                self.log(&format!(
                    "[WARN] Manifest: skipped {} malformed line(s) in {}",
                    self.index.malformed_lines,
                    job.manifest_path().display()
                ));
            }
        }

        // A source at a special root or drive root contains its own staging root
        let prune = job
            .layout
            .staging_root
            .starts_with(&job.source_root)
            .then_some(job.layout.staging_root.as_path());
        for item in fs_ops::walk_source(&job.source_root, prune) {
            if job.is_cancelled() {
                self.summary.cancelled = true;
                self.log("[WARN] Cancelled; stopping before the next file");
                break;
            }
            match item {
                WalkItem::Dir { rel_native, .. } => self.mirror_dir(&rel_native),
                WalkItem::File(entry) => self.process_file(&entry),
                WalkItem::Failed { path, error } => {
                    self.summary.errors += 1;
                    tracing::warn!(path = %path.display(), error = %error, "walk error");
                    self.log(&format!("[ERROR] Cannot read: {} ({})", path.display(), error.detail()));
                    let rel_path = path
                        .strip_prefix(&job.source_root)
                        .map(fs_ops::manifest_key)
                        .unwrap_or_else(|_| path.to_string_lossy().to_string());
                    self.completed(FileOutcome {
                        rel_path,
                        action: TransferAction::Error,
                        bytes: 0,
                        simulated: self.simulate,
                        detail: Some(error.detail()),
                    });
                }
            }
        }

        self.summary.elapsed = started.elapsed();
        self.write_footer();
        self.summary
    }

    fn write_header(&self) {
        let job = self.job;
        let policy = &job.policy;
        self.log(&format!(
            "Run {} by {} at {}",
            self.ctx.run_id,
            self.ctx.operator,
            self.ctx.now().to_rfc3339()
        ));
        self.log(&format!("Source: {}", job.source_root.display()));
        self.log(&format!("Target: {}", job.layout.target_root.display()));
        self.log(&format!(
            "Default: COPY everything; MOVE only if > {:.3} GB or matches move extensions/keywords",
            gib(policy.move_threshold_bytes)
        ));
        if !policy.move_exts.is_empty() {
            self.log(&format!("Move extensions: {:?}", policy.move_exts));
        }
        if !policy.move_keywords.is_empty() {
            self.log(&format!("Move keywords: {:?}", policy.move_keywords));
        }
        if !policy.include_exts.is_empty() {
            self.log(&format!("Include extensions only: {:?}", policy.include_exts));
        }
        self.log(&format!(
            "Integrity: {} over size + {} x {} KiB sampled blocks",
            policy.sample.algorithm,
            policy.sample.block_count,
            policy.sample.block_size / 1024
        ));
        self.log(&format!(
            "Mode: {} | Overwrite: {} | Manifest: {}",
            self.summary.mode,
            policy.overwrite,
            if policy.bypass_manifest { "bypassed" } else { "on" }
        ));
        self.log(&"-".repeat(70));
    }

    fn write_footer(&self) {
        let s = &self.summary;
        self.log(&"-".repeat(70));
        if s.cancelled {
            self.log("Run cancelled; only completed actions were recorded.");
        }
        if s.manifest_write_failures > 0 {
            self.log(&format!(
                "[WARN] {} manifest record(s) could not be written",
                s.manifest_write_failures
            ));
        }
        self.log(&format!("Done ({}). {}", s.mode, s));
        self.log(&format!(
            "Files seen: {} | Bytes copied: {} | Bytes moved: {} | Elapsed: {:.1}s",
            s.files_seen,
            s.bytes_copied,
            s.bytes_moved,
            s.elapsed.as_secs_f64()
        ));
    }

    fn completed(&self, outcome: FileOutcome) {
        tracing::debug!(
            rel = %outcome.rel_path,
            action = %outcome.action,
            simulated = outcome.simulated,
            "file processed"
        );
        if let Some(callback) = self.progress {
            callback.on_file_completed(self.job, &outcome);
        }
    }

    fn mirror_dir(&mut self, rel: &Path) {
        let dst = self.job.layout.destination_for(rel);
        if self.simulate {
            if !dst.is_dir() {
                self.log_action(&format!("[MKDIR] {}", dst.display()));
            }
            return;
        }
        match fs_ops::ensure_dir(&dst) {
            Ok(true) => self.log(&format!("[MKDIR] {}", dst.display())),
            Ok(false) => self.sweep_partials(&dst),
            Err(e) => {
                self.summary.errors += 1;
                tracing::warn!(path = %dst.display(), error = %e, "cannot create directory");
                self.log(&format!("[ERROR] Cannot create directory: {} ({})", dst.display(), e.detail()));
            }
        }
    }

    /// Remove partial files an interrupted run left in an existing directory.
    fn sweep_partials(&self, dir: &Path) {
        match fs_ops::remove_stale_partials(dir) {
            Ok(removed) => {
                for path in removed {
                    self.log(&format!("[CLEAN] Removed stale partial file: {}", path.display()));
                }
            }
            Err(e) => {
                tracing::warn!(path = %dir.display(), error = %e, "cannot scan for stale partial files");
                self.log(&format!("[WARN] Cannot scan for stale partial files: {} ({})", dir.display(), e.detail()));
            }
        }
    }

    fn process_file(&mut self, entry: &FileEntry) {
        self.summary.files_seen += 1;
        let dst = self.job.layout.destination_for(&entry.rel_native);

        let destination_state = match fs_ops::destination_state(&dst) {
            Ok(state) => state,
            Err(e) => {
                let detail = e.detail();
                self.fail(entry, format!("[ERROR] Cannot stat destination: {} ({})", dst.display(), detail), detail);
                return;
            }
        };

        let job = self.job;
        let policy = &job.policy;
        let input = DecisionInput {
            entry,
            destination: &dst,
            destination_state,
            manifest_hit: self.index.contains(
                &entry.rel_path,
                entry.size,
                entry.mtime,
                policy.mtime_tolerance_secs,
            ),
        };
        let decision = decide(&input, policy, || {
            integrity::compare_files(&entry.source_path, &dst, &entry.rel_path, &policy.sample)
        });

        let src = entry.source_path.display();
        match decision {
            Decision::SkipFiltered => {
                self.summary.skipped_filtered += 1;
                self.log(&format!("[SKIP] Not in include list: {}", src));
                self.outcome(entry, TransferAction::SkipFiltered, 0, Some("extension not included".to_string()));
            }
            Decision::PathTooLong { length, limit } => {
                let detail = format!("destination path too long ({} > {} characters)", length, limit);
                self.fail(entry, format!("[ERROR] {}: {}", detail, dst.display()), detail);
            }
            Decision::VerifyFailed { message } => {
                self.fail(
                    entry,
                    format!("[ERROR] Integrity check failed: {} -> {} ({})", src, dst.display(), message),
                    message,
                );
            }
            Decision::SkipManifest => {
                self.summary.skipped_manifest += 1;
                self.log(&format!("[SKIP] In manifest (size+mtime match): {}", src));
                self.outcome(entry, TransferAction::SkipManifest, 0, None);
            }
            Decision::SkipExisting(reason) => {
                self.summary.skipped_existing += 1;
                let (line, detail) = match reason {
                    ExistingReason::AlreadyTransferred => (
                        format!("[SKIP] Exists (size+mtime match): {}", dst.display()),
                        "already transferred".to_string(),
                    ),
                    ExistingReason::Differs => (
                        format!("[SKIP] Exists (mismatch; use --overwrite to replace): {}", dst.display()),
                        "destination differs".to_string(),
                    ),
                    ExistingReason::VerifyMismatch(verdict) => (
                        format!("[SKIP] Integrity mismatch ({}); source kept: {}", verdict, src),
                        verdict.to_string(),
                    ),
                };
                self.log(&line);
                self.outcome(entry, TransferAction::SkipMismatch, 0, Some(detail));
            }
            Decision::DeleteSource => self.delete_source(entry, &dst),
            Decision::Transfer {
                class,
                replace_existing,
            } => self.transfer(entry, &dst, class, replace_existing),
        }
    }

    fn delete_source(&mut self, entry: &FileEntry, dst: &Path) {
        let line = format!(
            "[DEL-SRC] {} (destination verified: {})",
            entry.source_path.display(),
            dst.display()
        );
        if !self.simulate {
            if let Err(e) = fs_ops::remove_file(&entry.source_path) {
                let detail = e.detail();
                self.fail(
                    entry,
                    format!("[ERROR] Cannot delete source: {} ({})", entry.source_path.display(), detail),
                    detail,
                );
                return;
            }
        }
        self.log_action(&line);
        self.summary.deleted_source += 1;
        self.record(entry, ManifestAction::DeleteSource, Some("destination verified".to_string()));
        self.outcome(entry, TransferAction::DeleteSource, 0, None);
    }

    fn transfer(&mut self, entry: &FileEntry, dst: &Path, class: Classification, replace_existing: bool) {
        if replace_existing {
            if !self.simulate {
                if let Err(e) = fs_ops::remove_file(dst) {
                    let detail = e.detail();
                    self.fail(
                        entry,
                        format!("[ERROR] Cannot delete existing destination: {} ({})", dst.display(), detail),
                        detail,
                    );
                    return;
                }
            }
            self.log_action(&format!("[DEL ] {}", dst.display()));
        }

        if !self.simulate {
            match fs_ops::ensure_parent_dir_exists(dst) {
                Ok(true) => {
                    if let Some(parent) = dst.parent() {
                        self.log(&format!("[MKDIR] {}", parent.display()));
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    let detail = e.detail();
                    self.fail(entry, format!("[ERROR] Cannot create parent of: {} ({})", dst.display(), detail), detail);
                    return;
                }
            }
        }

        let src = entry.source_path.display();
        match class {
            Classification::Move(reason) => {
                let bytes = if self.simulate {
                    0
                } else {
                    match fs_ops::move_file(&entry.source_path, dst) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let detail = e.detail();
                            self.fail(
                                entry,
                                format!("[ERROR] MOVE failed: {} -> {} ({})", src, dst.display(), detail),
                                detail,
                            );
                            return;
                        }
                    }
                };
                self.log_action(&format!(
                    "[MOVE] {} -> {} ({:.3} GB; {})",
                    src,
                    dst.display(),
                    gib(entry.size),
                    reason
                ));
                self.summary.moved += 1;
                self.summary.bytes_moved += bytes;
                self.record(entry, ManifestAction::Move, None);
                self.outcome(entry, TransferAction::Move, bytes, Some(reason.to_string()));
            }
            Classification::Copy => {
                let bytes = if self.simulate {
                    0
                } else {
                    match fs_ops::copy_file_with_metadata(&entry.source_path, dst) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            let detail = e.detail();
                            self.fail(
                                entry,
                                format!("[ERROR] COPY failed: {} -> {} ({})", src, dst.display(), detail),
                                detail,
                            );
                            return;
                        }
                    }
                };
                self.log_action(&format!(
                    "[COPY] {} -> {} ({:.1} MB)",
                    src,
                    dst.display(),
                    mib(entry.size)
                ));
                self.summary.copied += 1;
                self.summary.bytes_copied += bytes;
                self.record(entry, ManifestAction::Copy, None);
                self.outcome(entry, TransferAction::Copy, bytes, None);
            }
        }
    }

    /// Append the manifest record for a completed action.
    fn record(&mut self, entry: &FileEntry, action: ManifestAction, note: Option<String>) {
        let job = self.job;
        let record = ManifestRecord {
            ts: self.ctx.now(),
            user: self.ctx.operator.clone(),
            src_root: job.source_root.display().to_string(),
            dst_root: job.layout.target_root.display().to_string(),
            rel: entry.rel_path.clone(),
            size: entry.size,
            mtime: entry.mtime,
            action,
            note,
        };

        if self.simulate {
            match record.to_line() {
                Ok(line) => self.log(&format!("[SIM] manifest <= {}", line)),
                Err(e) => self.log(&format!("[SIM] manifest <= (unrenderable record: {})", e)),
            }
            return;
        }

        match manifest::append_record(&job.manifest_path(), &record) {
            Ok(()) => self.index.insert(record),
            Err(e) => {
                self.summary.manifest_write_failures += 1;
                tracing::warn!(rel = %entry.rel_path, error = %e, "manifest append failed");
                self.log(&format!("[WARN] {}", e));
            }
        }
    }

    fn fail(&mut self, entry: &FileEntry, line: String, detail: String) {
        self.summary.errors += 1;
        tracing::warn!(rel = %entry.rel_path, error = %detail, "file failed");
        self.log(&line);
        self.outcome(entry, TransferAction::Error, 0, Some(detail));
    }

    fn outcome(&self, entry: &FileEntry, action: TransferAction, bytes: u64, detail: Option<String>) {
        let simulated = self.simulate && matches!(
            action,
            TransferAction::Copy | TransferAction::Move | TransferAction::DeleteSource
        );
        self.completed(FileOutcome {
            rel_path: entry.rel_path.clone(),
            action,
            bytes,
            simulated,
            detail,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::FixedClock;
    use crate::lock::LOCK_MARKER_NAME;
    use crate::model::normalize_exts;
    use crate::path_map::PathMapper;
    use chrono::{TimeZone, Utc};
    use std::fs;
    use std::sync::Mutex;

    struct TestProgressCallback {
        lines: Mutex<Vec<String>>,
        outcomes: Mutex<Vec<FileOutcome>>,
        calls: Mutex<Vec<String>>,
    }

    impl TestProgressCallback {
        fn new() -> Self {
            TestProgressCallback {
                lines: Mutex::new(Vec::new()),
                outcomes: Mutex::new(Vec::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        fn outcomes(&self) -> Vec<FileOutcome> {
            self.outcomes.lock().unwrap().clone()
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProgressCallback for TestProgressCallback {
        fn on_job_started(&self, job: &StageJob) {
            assert_eq!(job.state, JobState::Running);
            self.calls.lock().unwrap().push("on_job_started".to_string());
        }

        fn on_log_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn on_file_completed(&self, _job: &StageJob, outcome: &FileOutcome) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("on_file_completed:{}", outcome.rel_path));
            self.outcomes.lock().unwrap().push(outcome.clone());
        }

        fn on_job_completed(&self, job: &StageJob, _summary: &RunSummary) {
            assert_ne!(job.state, JobState::Running);
            self.calls.lock().unwrap().push("on_job_completed".to_string());
        }
    }

    /// Scratch tree whose temp root acts as the special root, so the target
    /// lands at `<tmp>/TAPE_TRANSFER/<name>`.
    struct Fixture {
        temp_dir: tempfile::TempDir,
        src: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
            let src = temp_dir.path().join("run1");
            fs::create_dir(&src).expect("Failed to create src dir");
            Fixture { temp_dir, src }
        }

        fn policy(&self) -> StagePolicy {
            StagePolicy {
                mapper: PathMapper::default()
                    .with_special_roots([self.temp_dir.path().to_string_lossy().to_string()]),
                ..StagePolicy::default()
            }
        }

        fn staging(&self) -> PathBuf {
            self.temp_dir.path().join("TAPE_TRANSFER")
        }

        fn target(&self) -> PathBuf {
            self.staging().join("run1")
        }

        fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
            let path = self.src.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, content).unwrap();
            path
        }

        fn run(&self, policy: StagePolicy) -> (StageJob, RunSummary, TestProgressCallback) {
            let mut job = create_job(&self.src, policy).expect("Failed to create job");
            let progress = TestProgressCallback::new();
            let summary = run_job(&mut job, &ctx(), Some(&progress)).expect("Failed to run job");
            (job, summary, progress)
        }
    }

    fn ctx() -> RunContext {
        RunContext::new("tester").with_clock(FixedClock(Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap()))
    }

    #[test]
    fn test_create_job_with_valid_source() {
        let fx = Fixture::new();
        let job = create_job(&fx.src, fx.policy()).expect("Failed to create job");

        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.layout.target_root, fx.target());
        assert_eq!(job.layout.staging_root, fx.staging());
        assert_eq!(job.lock, LockState::Clear);
        assert_eq!(job.mode(), RunMode::Live);
    }

    #[test]
    fn test_create_job_with_missing_source() {
        let fx = Fixture::new();
        let result = create_job(fx.temp_dir.path().join("nonexistent"), fx.policy());
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }

    #[test]
    fn test_create_job_with_file_as_source() {
        let fx = Fixture::new();
        let file = fx.write("file.txt", b"x");
        let result = create_job(&file, fx.policy());
        assert!(matches!(result, Err(EngineError::NotADirectory { .. })));
    }

    #[test]
    fn test_create_job_with_empty_source() {
        let fx = Fixture::new();
        let result = create_job("", fx.policy());
        assert!(matches!(result, Err(EngineError::InvalidPath { .. })));
    }

    #[test]
    fn test_create_job_refuses_source_under_staging_root() {
        let fx = Fixture::new();
        let inside = fx.target().join("nested");
        fs::create_dir_all(&inside).unwrap();

        let err = create_job(&inside, fx.policy()).unwrap_err();
        assert!(matches!(err, EngineError::SourceInStagingRoot { .. }));
        assert_eq!(err.exit_status(), crate::model::ExitStatus::SafetyRefusal);

        let allowed = StagePolicy {
            allow_source_in_staging: true,
            ..fx.policy()
        };
        assert!(create_job(&inside, allowed).is_ok());
    }

    #[test]
    fn test_create_job_rejects_invalid_policy() {
        let fx = Fixture::new();
        let mut policy = fx.policy();
        policy.sample.block_count = 0;
        assert!(matches!(
            create_job(&fx.src, policy),
            Err(EngineError::InvalidPolicy(_))
        ));
    }

    #[test]
    fn test_copy_run_mirrors_tree_and_records_manifest() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.write("sub/b.txt", b"bravo!");
        fs::create_dir_all(fx.src.join("empty")).unwrap();

        let (job, summary, progress) = fx.run(fx.policy());

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(summary.copied, 2);
        assert_eq!(summary.bytes_copied, 11);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.exit_status(), crate::model::ExitStatus::Success);
        assert_eq!(fs::read(fx.target().join("sub").join("b.txt")).unwrap(), b"bravo!");
        assert!(fx.target().join("empty").is_dir());
        // Copies leave the source in place
        assert!(fx.src.join("a.txt").exists());

        let index = manifest::load_manifest(&job.manifest_path());
        assert_eq!(index.len(), 2);
        let rec = index.get("sub/b.txt").unwrap();
        assert_eq!(rec.action, ManifestAction::Copy);
        assert_eq!(rec.user, "tester");
        assert_eq!(rec.size, 6);

        let lines = progress.lines();
        assert!(lines[0].contains("by tester at 2026-03-01T08:00:00"));
        assert!(lines.iter().any(|l| l.starts_with("[MKDIR]")));
        assert_eq!(lines.iter().filter(|l| l.starts_with("[COPY]")).count(), 2);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.write("sub/b.txt", b"bravo");
        let policy = StagePolicy {
            move_exts: normalize_exts([".bin"]),
            ..fx.policy()
        };
        fx.write("c.bin", b"payload");

        let (_, first, _) = fx.run(policy.clone());
        assert_eq!(first.copied, 2);
        assert_eq!(first.moved, 1);

        let (_, second, _) = fx.run(policy);
        assert_eq!(second.actions(), 0);
        assert_eq!(second.skipped_manifest, 2);
        assert_eq!(second.errors, 0);
    }

    #[test]
    fn test_move_eligible_file_is_moved_and_recorded() {
        let fx = Fixture::new();
        let src_file = fx.write("a.bin", b"binary payload");
        let policy = StagePolicy {
            move_exts: normalize_exts(["bin"]),
            ..fx.policy()
        };

        let (job, summary, progress) = fx.run(policy);

        assert_eq!(summary.moved, 1);
        assert_eq!(summary.bytes_moved, 14);
        assert!(!src_file.exists());
        assert_eq!(fs::read(fx.target().join("a.bin")).unwrap(), b"binary payload");

        let index = manifest::load_manifest(&job.manifest_path());
        assert_eq!(index.get("a.bin").unwrap().action, ManifestAction::Move);
        let outcome = &progress.outcomes()[0];
        assert_eq!(outcome.action, TransferAction::Move);
        assert!(!outcome.simulated);
    }

    #[test]
    fn test_restored_source_is_deleted_after_verification() {
        let fx = Fixture::new();
        let content = vec![7u8; 300 * 1024];
        let src_file = fx.write("big.bin", &content);
        let policy = StagePolicy {
            move_exts: normalize_exts([".bin"]),
            ..fx.policy()
        };
        fx.run(policy.clone());
        assert!(!src_file.exists());

        // Restore the source with identical content and mtime
        fs_ops::copy_file_with_metadata(&fx.target().join("big.bin"), &src_file).unwrap();

        let (job, summary, _) = fx.run(policy);
        assert_eq!(summary.deleted_source, 1);
        assert_eq!(summary.moved, 0);
        assert!(!src_file.exists());
        assert!(fx.target().join("big.bin").exists());
        let index = manifest::load_manifest(&job.manifest_path());
        assert_eq!(index.get("big.bin").unwrap().action, ManifestAction::DeleteSource);
    }

    #[test]
    fn test_truncated_destination_keeps_source() {
        let fx = Fixture::new();
        let src_file = fx.write("a.bin", b"the full content of the file");
        fs::create_dir_all(fx.target()).unwrap();
        fs::write(fx.target().join("a.bin"), b"the full").unwrap();

        let policy = StagePolicy {
            move_exts: normalize_exts([".bin"]),
            ..fx.policy()
        };
        let (_, summary, progress) = fx.run(policy);

        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(summary.deleted_source, 0);
        assert_eq!(summary.errors, 0);
        assert_eq!(fs::read(&src_file).unwrap(), b"the full content of the file");
        assert_eq!(progress.outcomes()[0].action, TransferAction::SkipMismatch);
        assert!(progress.lines().iter().any(|l| l.contains("Integrity mismatch")));
    }

    #[test]
    fn test_existing_copy_destination_is_never_overwritten_implicitly() {
        let fx = Fixture::new();
        fx.write("a.txt", b"source");
        fs::create_dir_all(fx.target()).unwrap();
        fs::write(fx.target().join("a.txt"), b"x").unwrap();

        let (_, summary, progress) = fx.run(fx.policy());
        assert_eq!(summary.skipped_existing, 1);
        assert_eq!(fs::read(fx.target().join("a.txt")).unwrap(), b"x");
        assert!(progress.lines().iter().any(|l| l.contains("use --overwrite")));

        // With overwrite, the destination is replaced
        let policy = StagePolicy {
            overwrite: true,
            bypass_manifest: true,
            ..fx.policy()
        };
        let (_, summary, progress) = fx.run(policy);
        assert_eq!(summary.copied, 1);
        assert_eq!(fs::read(fx.target().join("a.txt")).unwrap(), b"source");
        assert!(progress.lines().iter().any(|l| l.starts_with("[DEL ]")));
    }

    #[test]
    fn test_include_filter_skips_other_extensions() {
        let fx = Fixture::new();
        fx.write("keep.tif", b"1");
        fx.write("drop.txt", b"2");
        let policy = StagePolicy {
            include_exts: normalize_exts(["TIF"]),
            ..fx.policy()
        };

        let (_, summary, _) = fx.run(policy);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.skipped_filtered, 1);
        assert!(fx.target().join("keep.tif").exists());
        assert!(!fx.target().join("drop.txt").exists());
    }

    #[test]
    fn test_path_too_long_is_an_error() {
        let fx = Fixture::new();
        fx.write("a.txt", b"1");
        let policy = StagePolicy {
            max_path_len: 5,
            ..fx.policy()
        };

        let (_, summary, _) = fx.run(policy);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.exit_status(), crate::model::ExitStatus::FileErrors);
        assert!(!fx.target().join("a.txt").exists());
    }

    #[test]
    fn test_simulation_mutates_nothing() {
        let fx = Fixture::new();
        let moved = fx.write("a.bin", b"payload");
        fx.write("sub/b.txt", b"text");
        let policy = StagePolicy {
            simulate: true,
            move_exts: normalize_exts([".bin"]),
            ..fx.policy()
        };

        let (job, summary, progress) = fx.run(policy);
        assert_eq!(summary.mode, RunMode::Simulation);
        assert_eq!(summary.moved, 1);
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.bytes_copied + summary.bytes_moved, 0);
        assert!(moved.exists());
        assert!(!fx.staging().exists());
        assert!(!job.manifest_path().exists());

        let lines = progress.lines();
        assert!(lines.iter().any(|l| l.starts_with("[SIM] [MOVE]")));
        assert!(lines.iter().any(|l| l.starts_with("[SIM] manifest <= ")));
        assert!(progress.outcomes().iter().all(|o| o.simulated));
    }

    #[test]
    fn test_lock_forces_simulation_with_same_counts() {
        let fx = Fixture::new();
        fx.write("a.bin", b"payload");
        fx.write("sub/b.txt", b"text");
        let base = StagePolicy {
            move_exts: normalize_exts([".bin"]),
            ..fx.policy()
        };
        let (_, simulated, _) = fx.run(StagePolicy {
            simulate: true,
            ..base.clone()
        });

        fs::create_dir_all(fx.staging()).unwrap();
        fs::write(fx.staging().join(LOCK_MARKER_NAME), b"").unwrap();

        let (job, locked, progress) = fx.run(base);
        assert_eq!(job.mode(), RunMode::LockedSimulation);
        assert_eq!(locked.exit_status(), crate::model::ExitStatus::Locked);
        assert_eq!(locked.moved, simulated.moved);
        assert_eq!(locked.copied, simulated.copied);
        assert_eq!(locked.deleted_source, simulated.deleted_source);
        assert_eq!(locked.skipped_manifest, simulated.skipped_manifest);

        assert!(fx.src.join("a.bin").exists());
        assert!(!fx.target().exists());
        assert!(!job.manifest_path().exists());
        let entries: Vec<_> = fs::read_dir(fx.staging()).unwrap().collect();
        assert_eq!(entries.len(), 1, "only the lock marker may exist");
        assert!(progress.lines().iter().any(|l| l.starts_with("[LOCK]")));
    }

    #[test]
    fn test_bypass_manifest_falls_through_to_destination_check() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.run(fx.policy());

        let policy = StagePolicy {
            bypass_manifest: true,
            ..fx.policy()
        };
        let (_, summary, _) = fx.run(policy);
        assert_eq!(summary.skipped_manifest, 0);
        assert_eq!(summary.skipped_existing, 1);
    }

    #[test]
    fn test_malformed_manifest_lines_are_counted() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let manifest = manifest::manifest_path(&fx.src);
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(&manifest, b"garbage\n").unwrap();

        let (_, summary, progress) = fx.run(fx.policy());
        assert_eq!(summary.manifest_malformed, 1);
        assert_eq!(summary.copied, 1);
        assert!(progress.lines().iter().any(|l| l.starts_with("[WARN] Manifest")));
    }

    #[test]
    fn test_cancelled_run_stops_before_next_file() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let mut job = create_job(&fx.src, fx.policy()).expect("Failed to create job");
        let flag = Arc::new(AtomicBool::new(true));
        job.cancel_flag = Some(flag);

        let summary = run_job(&mut job, &ctx(), None).expect("Failed to run job");
        assert!(summary.cancelled);
        assert_eq!(summary.actions(), 0);
        assert_eq!(job.state, JobState::Cancelled);
        assert!(!job.manifest_path().exists());
    }

    #[test]
    fn test_run_job_requires_pending_state() {
        let fx = Fixture::new();
        let mut job = create_job(&fx.src, fx.policy()).expect("Failed to create job");
        run_job(&mut job, &ctx(), None).expect("First run should succeed");

        let result = run_job(&mut job, &ctx(), None);
        assert!(matches!(result, Err(EngineError::JobState { .. })));
    }

    #[test]
    fn test_run_job_invokes_callbacks_in_order() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");

        let (_, _, progress) = fx.run(fx.policy());
        let calls = progress.calls();
        assert_eq!(
            calls,
            vec![
                "on_job_started".to_string(),
                "on_file_completed:a.txt".to_string(),
                "on_job_completed".to_string(),
            ]
        );
    }

    #[test]
    fn test_engine_artifacts_are_not_staged() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        fx.run(fx.policy());

        // The manifest directory now exists in the source; a rerun must not stage it
        let (_, summary, _) = fx.run(fx.policy());
        assert_eq!(summary.files_seen, 1);
        assert!(!fx.target().join(manifest::META_DIR_NAME).exists());
    }

    #[test]
    fn test_rerun_on_special_root_source_does_not_stage_into_itself() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let vol = temp_dir.path().join("vol");
        fs::create_dir(&vol).unwrap();
        fs::write(vol.join("a.txt"), b"alpha").unwrap();
        let policy = StagePolicy {
            mapper: PathMapper::default().with_special_roots([vol.to_string_lossy().to_string()]),
            ..StagePolicy::default()
        };
        let staging = vol.join("TAPE_TRANSFER");

        let mut summaries = Vec::new();
        for _ in 0..3 {
            let mut job = create_job(&vol, policy.clone()).expect("Failed to create job");
            assert_eq!(job.layout.target_root, staging);
            summaries.push(run_job(&mut job, &ctx(), None).expect("Failed to run job"));
        }

        assert_eq!(summaries[0].copied, 1);
        for summary in &summaries[1..] {
            assert_eq!(summary.files_seen, 1);
            assert_eq!(summary.actions(), 0);
            assert_eq!(summary.skipped_manifest, 1);
        }
        assert_eq!(fs::read(staging.join("a.txt")).unwrap(), b"alpha");
        assert!(!staging.join("TAPE_TRANSFER").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_linked_directory_is_mirrored_without_error() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        let elsewhere = fx.temp_dir.path().join("elsewhere");
        fs::create_dir(&elsewhere).unwrap();
        fs::write(elsewhere.join("b.txt"), b"bravo").unwrap();
        std::os::unix::fs::symlink(&elsewhere, fx.src.join("linkdir")).unwrap();

        let (_, summary, _) = fx.run(fx.policy());
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(summary.exit_status(), crate::model::ExitStatus::Success);
        assert!(fx.target().join("linkdir").is_dir());
        assert!(!fx.target().join("linkdir").join("b.txt").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_non_utf8_name_is_staged_under_its_own_name() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        let name = OsStr::from_bytes(b"data\xff.bin");
        fs::write(fx.src.join(name), b"payload").unwrap();

        let (_, summary, _) = fx.run(fx.policy());
        assert_eq!(summary.copied, 1);
        assert_eq!(fs::read(fx.target().join(name)).unwrap(), b"payload");
        assert!(!fx.target().join("data\u{FFFD}.bin").exists());
    }

    #[test]
    fn test_manifest_append_failure_is_a_warning() {
        let fx = Fixture::new();
        fx.write("a.txt", b"alpha");
        // A plain file where the metadata directory belongs blocks every append
        fs::write(fx.src.join(manifest::META_DIR_NAME), b"in the way").unwrap();

        let (_, summary, progress) = fx.run(fx.policy());
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.manifest_write_failures, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(fs::read(fx.target().join("a.txt")).unwrap(), b"alpha");
        assert!(progress
            .lines()
            .iter()
            .any(|l| l == "[WARN] 1 manifest record(s) could not be written"));
    }

    #[test]
    fn test_stale_partial_files_are_swept_in_live_runs_only() {
        let fx = Fixture::new();
        fx.write("sub/a.txt", b"alpha");
        let stale = fx
            .target()
            .join("sub")
            .join(format!("b.bin{}", fs_ops::PARTIAL_SUFFIX));
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"half").unwrap();

        let simulated = StagePolicy {
            simulate: true,
            ..fx.policy()
        };
        fx.run(simulated);
        assert!(stale.exists());

        let (_, summary, progress) = fx.run(fx.policy());
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.errors, 0);
        assert!(!stale.exists());
        assert!(progress.lines().iter().any(|l| l.starts_with("[CLEAN]")));
    }
}
