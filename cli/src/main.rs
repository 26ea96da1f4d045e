//! tapestage - Command-line interface for the staging engine.
//!
//! Stages a source directory into its derived TAPE_TRANSFER mirror, printing
//! the tagged run log to stdout and appending it to the run log files.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tapestage_engine::{
    create_job, normalize_exts, normalize_keywords, run_job, EngineError, ExitStatus,
    FileOutcome, FingerprintAlgorithm, PathMapper, ProgressCallback, RunContext, RunLog,
    RunSummary, SampleParams, StageJob, StagePolicy, TransferAction, DEFAULT_BLOCK_COUNT,
    DEFAULT_MAX_PATH_LEN,
};
use tracing_subscriber::EnvFilter;

/// tapestage - stage data into a derived TAPE_TRANSFER folder
#[derive(Parser, Debug)]
#[command(name = "tapestage")]
#[command(version)]
#[command(about = "Copy or move a directory tree into its TAPE_TRANSFER staging mirror")]
struct Args {
    /// Source directory (drive, UNC or absolute path)
    #[arg(value_name = "SOURCE")]
    source: PathBuf,

    /// Move files larger than this size (GB)
    #[arg(long = "max-size", value_name = "GB", default_value_t = 10.0)]
    max_size: f64,

    /// Extensions to always move (repeatable or comma-separated, e.g. .bin,.dat)
    #[arg(long = "move-ext", value_name = "EXT", value_delimiter = ',')]
    move_ext: Vec<String>,

    /// Move files whose name contains any of these keywords (case-insensitive)
    #[arg(long = "move-keyword", value_name = "WORD", value_delimiter = ',')]
    move_keyword: Vec<String>,

    /// Only process these extensions; others are skipped
    #[arg(long = "include-ext", value_name = "EXT", value_delimiter = ',')]
    include_ext: Vec<String>,

    /// Replace existing target files (default: skip)
    #[arg(long)]
    overwrite: bool,

    /// Report actions without modifying anything
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Ignore the manifest when deciding (records are still written)
    #[arg(long = "no-manifest")]
    no_manifest: bool,

    /// Allow source paths that already contain TAPE_TRANSFER (not recommended)
    #[arg(long = "allow-source-in-tape-transfer")]
    allow_source_in_tape_transfer: bool,

    /// Number of sampled blocks for the integrity check
    #[arg(long = "sample-blocks", value_name = "N", default_value_t = DEFAULT_BLOCK_COUNT)]
    sample_blocks: usize,

    /// Size of each sampled block in KiB
    #[arg(long = "sample-block-kb", value_name = "KIB", default_value_t = 64)]
    sample_block_kb: u64,

    /// Fingerprint algorithm: sha256 or blake3
    #[arg(long, value_name = "ALGORITHM", default_value = "sha256")]
    hash: String,

    /// Longest destination path accepted, in characters
    #[arg(long = "max-path-len", value_name = "CHARS", default_value_t = DEFAULT_MAX_PATH_LEN)]
    max_path_len: usize,

    /// Roots whose marker goes below them instead of below the drive (repeatable)
    #[arg(long = "special-root", value_name = "PATH")]
    special_root: Vec<String>,

    /// Allowed mtime difference in seconds when comparing files
    #[arg(long = "mtime-tolerance", value_name = "SECS", default_value_t = 2.0)]
    mtime_tolerance: f64,

    /// Do not write the run logs beside the source and target roots
    #[arg(long = "no-run-log")]
    no_run_log: bool,

    /// Additional log file to append to
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Increase diagnostic output (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// CLI implementation of ProgressCallback: stdout plus the run log files
struct CliProgress {
    verbose: bool,
    run_log: RunLog,
    start_time: Instant,
    files_done: AtomicU64,
}

impl CliProgress {
    fn new(verbose: bool, run_log: RunLog) -> Self {
        CliProgress {
            verbose,
            run_log,
            start_time: Instant::now(),
            files_done: AtomicU64::new(0),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_job_started(&self, job: &StageJob) {
        if self.verbose {
            eprintln!("Job {} ({})", job.id, job.mode());
            for path in self.run_log.paths() {
                eprintln!("  Run log: {}", path.display());
            }
        }
    }

    fn on_log_line(&self, line: &str) {
        println!("{}", line);
        self.run_log.write_line(line);
    }

    fn on_file_completed(&self, _job: &StageJob, outcome: &FileOutcome) {
        let n = self.files_done.fetch_add(1, Ordering::Relaxed) + 1;
        if self.verbose && outcome.action != TransferAction::SkipFiltered {
            eprintln!("[{:5}] {}: {}", n, outcome.action, outcome.rel_path);
        }
    }

    fn on_job_completed(&self, _job: &StageJob, summary: &RunSummary) {
        eprintln!();
        eprintln!("Bytes copied: {}", Self::format_bytes(summary.bytes_copied));
        eprintln!("Bytes moved: {}", Self::format_bytes(summary.bytes_moved));
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        if summary.errors > 0 {
            eprintln!("{} file(s) failed; see [ERROR] lines above", summary.errors);
        }
    }
}

/// Operator name recorded in the manifest
fn operator_name() -> String {
    std::env::var("USERNAME")
        .or_else(|_| std::env::var("USER"))
        .ok()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse and validate command-line arguments, then run the job
fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let status = run_cli(&args);
    std::process::exit(status.code());
}

/// Translate flags into a policy
fn build_policy(args: &Args) -> Result<StagePolicy, EngineError> {
    let algorithm = FingerprintAlgorithm::from_str(&args.hash).ok_or_else(|| {
        EngineError::InvalidPolicy(format!(
            "Invalid hash algorithm '{}'. Must be 'sha256' or 'blake3'",
            args.hash
        ))
    })?;

    let mapper = if args.special_root.is_empty() {
        PathMapper::default()
    } else {
        PathMapper::default().with_special_roots(args.special_root.iter().cloned())
    };

    Ok(StagePolicy {
        include_exts: normalize_exts(&args.include_ext),
        move_exts: normalize_exts(&args.move_ext),
        move_keywords: normalize_keywords(&args.move_keyword),
        move_threshold_bytes: StagePolicy::threshold_from_gb(args.max_size)?,
        overwrite: args.overwrite,
        simulate: args.dry_run,
        bypass_manifest: args.no_manifest,
        allow_source_in_staging: args.allow_source_in_tape_transfer,
        sample: SampleParams {
            block_count: args.sample_blocks,
            block_size: args.sample_block_kb.saturating_mul(1024),
            algorithm,
        },
        mtime_tolerance_secs: args.mtime_tolerance,
        max_path_len: args.max_path_len,
        mapper,
    })
}

fn report_error(e: &EngineError) {
    eprintln!("[ERROR] {}", e.detail());
    if let EngineError::SourceInStagingRoot { .. } = e {
        eprintln!("        Refusing by default to avoid modifying staged data.");
        eprintln!("        If you really need to run anyway, pass --allow-source-in-tape-transfer.");
    }
}

/// Main CLI logic - separated for testability
fn run_cli(args: &Args) -> ExitStatus {
    let policy = match build_policy(args) {
        Ok(policy) => policy,
        Err(e) => {
            report_error(&e);
            return e.exit_status();
        }
    };

    let mut job = match create_job(&args.source, policy) {
        Ok(job) => job,
        Err(e) => {
            report_error(&e);
            return e.exit_status();
        }
    };

    let run_log = if args.no_run_log {
        RunLog::open(args.log.clone())
    } else {
        RunLog::for_job(&job, args.log.as_deref())
    };
    let progress = CliProgress::new(args.verbose > 0, run_log);
    let ctx = RunContext::new(operator_name());
    tracing::debug!(run_id = %ctx.run_id, operator = %ctx.operator, job_id = %job.id, "run context ready");

    match run_job(&mut job, &ctx, Some(&progress)) {
        Ok(summary) => summary.exit_status(),
        Err(e) => {
            report_error(&e);
            e.exit_status()
        }
    }
}
