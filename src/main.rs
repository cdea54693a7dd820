//! objpool - Write-through Local Disk Cache for Remote Object Stores
//!
//! Entry point for the CLI application.

use anyhow::{bail, Context, Result};
use clap::Parser;
use objpool::cache::Layout;
use objpool::config::{CliArgs, Command, PoolConfig};
use objpool::error::KeyOutcome;
use objpool::progress::{print_header, print_summary, ProgressReporter, PullProgress};
use objpool::{dispatch, Pool};
use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    let config = PoolConfig::from_args(&args).context("Invalid configuration")?;
    let layout = Layout::create(&config.home).context("Cannot prepare home directory")?;
    setup_logging(args.verbose, &layout.log_file())?;

    let pool = Pool::new(config).context("Failed to initialize pool")?;

    if pool.config().check_tools {
        pool.check_tools().context("Required tool unavailable")?;
    }

    match args.command {
        Command::Refresh { bucket } => {
            let count = pool.refresh(&bucket).context("Refresh failed")?;
            info!(bucket = %bucket, objects = count, "Catalog updated");
        }
        Command::List { bucket, prefix } => {
            let mut out = io::stdout().lock();
            for (key, etag) in pool.list(&bucket, &prefix).context("List failed")? {
                writeln!(out, "{} {}", etag, key)?;
            }
        }
        Command::Glob { bucket, pattern } => {
            let mut out = io::stdout().lock();
            for key in pool.glob(&bucket, &pattern).context("Glob failed")? {
                writeln!(out, "{}", key)?;
            }
        }
        Command::Pull {
            format,
            schema,
            detailed,
            bucket,
            keys,
        } => run_pull(&pool, &format, &schema, &bucket, &keys, detailed)?,
        Command::Exec => run_exec(&pool)?,
    }

    Ok(())
}

/// Refresh, pull and report; a fresh process has an empty catalog
fn run_pull(
    pool: &Pool,
    format: &str,
    schema: &Path,
    bucket: &str,
    keys: &[String],
    detailed: bool,
) -> Result<()> {
    let show_progress = pool.config().show_progress;
    if show_progress {
        print_header(
            &pool.config().backend.to_string(),
            bucket,
            keys.len(),
            pool.config().concurrency,
        );
    }

    let progress = show_progress.then(ProgressReporter::new);
    if let Some(ref p) = progress {
        p.set_status("Refreshing catalog...");
    }
    pool.refresh(bucket).context("Refresh failed")?;

    let started = Instant::now();
    let baseline = PullProgress::counters(pool);
    let finished = AtomicBool::new(false);

    let outcomes = thread::scope(|s| {
        if let Some(p) = progress.as_ref() {
            let finished = &finished;
            let baseline = &baseline;
            s.spawn(move || {
                while !finished.load(Ordering::Relaxed) {
                    p.update(&PullProgress::sample(pool, baseline, keys.len() as u64));
                    thread::sleep(Duration::from_millis(200));
                }
            });
        }
        let result = pool.pull_detailed(format, schema, bucket, keys);
        finished.store(true, Ordering::Relaxed);
        result
    })
    .context("Pull failed")?;

    if let Some(ref p) = progress {
        p.finish_and_clear();
    }
    if show_progress {
        let sample = PullProgress::sample(pool, &baseline, keys.len() as u64);
        print_summary(&outcomes, sample.bytes_fetched, started);
    }

    let mut out = io::stdout().lock();
    if detailed {
        for outcome in &outcomes {
            match outcome {
                KeyOutcome::Hit { key, zonemap } => {
                    writeln!(out, "HIT {} {}", key, zonemap.display())?
                }
                KeyOutcome::Converted { key, zonemap } => {
                    writeln!(out, "CONVERTED {} {}", key, zonemap.display())?
                }
                KeyOutcome::Failed { key, error } => writeln!(out, "FAILED {} {}", key, error)?,
            }
        }
        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        if failed > 0 {
            bail!("{} of {} keys failed", failed, outcomes.len());
        }
        return Ok(());
    }

    for outcome in outcomes {
        match outcome {
            KeyOutcome::Failed { key, error } => bail!("{}: {}", key, error),
            KeyOutcome::Hit { zonemap, .. } | KeyOutcome::Converted { zonemap, .. } => {
                writeln!(out, "{}", zonemap.display())?
            }
        }
    }
    Ok(())
}

/// Answer one request line at a time until stdin closes
fn run_exec(pool: &Pool) -> Result<()> {
    let stdin = io::stdin();
    let mut out = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line.context("Cannot read request")?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = dispatch(pool, line).to_string();
        out.write_all(reply.as_bytes())?;
        if !reply.ends_with('\n') {
            writeln!(out)?;
        }
        out.flush()?;
    }
    Ok(())
}

/// Log to stderr and append the same events to `log_file`
fn setup_logging(verbose: bool, log_file: &Path) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("objpool=debug,warn")
    } else {
        EnvFilter::new("objpool=info,warn")
    };

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Cannot open log file {}", log_file.display()))?;

    // stdout carries replies
    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let file_layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false);

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}
