//! Progress reporting for CLI pulls
//!
//! Provides a spinner fed from [`PullProgress`] snapshots and the
//! end-of-run summary.

use crate::error::KeyOutcome;
use crate::pool::Pool;
use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

/// Point-in-time view of a running pull
#[derive(Debug, Clone, Default)]
pub struct PullProgress {
    pub total_keys: u64,
    pub hits: u64,
    pub conversions: u64,
    pub failures: u64,
    pub bytes_fetched: u64,
    pub active_workers: usize,
    pub total_workers: usize,
}

impl PullProgress {
    /// Sample `pool` counters relative to `baseline`, taken before the pull
    pub fn sample(pool: &Pool, baseline: &PullProgress, total_keys: u64) -> Self {
        let scheduler = pool.scheduler_stats();
        let current = Self::counters(pool);
        Self {
            total_keys,
            hits: current.hits.saturating_sub(baseline.hits),
            conversions: current.conversions.saturating_sub(baseline.conversions),
            failures: current.failures.saturating_sub(baseline.failures),
            bytes_fetched: current.bytes_fetched.saturating_sub(baseline.bytes_fetched),
            active_workers: scheduler.active(),
            total_workers: pool.config().concurrency,
        }
    }

    /// Raw counter values, used as the baseline for [`PullProgress::sample`]
    pub fn counters(pool: &Pool) -> Self {
        let stats = pool.stats();
        Self {
            hits: stats.hits.load(Ordering::Relaxed),
            conversions: stats.conversions.load(Ordering::Relaxed),
            failures: stats.key_failures.load(Ordering::Relaxed),
            bytes_fetched: stats.bytes_fetched.load(Ordering::Relaxed),
            ..Self::default()
        }
    }

    pub fn done(&self) -> u64 {
        self.hits + self.conversions + self.failures
    }
}

/// Spinner showing pull status
pub struct ProgressReporter {
    bar: ProgressBar,
}

impl ProgressReporter {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();

        if let Ok(spinner) = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
        {
            bar.set_style(spinner.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Update the progress display
    pub fn update(&self, progress: &PullProgress) {
        let msg = format!(
            "Keys: {}/{} | Hits: {} | Converted: {} | Failed: {} | Fetched: {} | Workers: {}/{}",
            format_number(progress.done()),
            format_number(progress.total_keys),
            format_number(progress.hits),
            format_number(progress.conversions),
            format_number(progress.failures),
            format_size(progress.bytes_fetched, BINARY),
            progress.active_workers,
            progress.total_workers,
        );
        self.bar.set_message(msg);
    }

    pub fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print the outcome of a pull
pub fn print_summary(outcomes: &[KeyOutcome], bytes_fetched: u64, started: Instant) {
    let hits = outcomes
        .iter()
        .filter(|o| matches!(o, KeyOutcome::Hit { .. }))
        .count() as u64;
    let converted = outcomes
        .iter()
        .filter(|o| matches!(o, KeyOutcome::Converted { .. }))
        .count() as u64;
    let failed = outcomes.len() as u64 - hits - converted;
    let duration_secs = started.elapsed().as_secs_f64();

    eprintln!();
    eprintln!("{}", style("Pull Complete").green().bold());
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}", style("Keys:").bold(), format_number(outcomes.len() as u64));
    eprintln!("  {} {}", style("Cache hits:").bold(), format_number(hits));
    eprintln!("  {} {}", style("Converted:").bold(), format_number(converted));
    eprintln!(
        "  {} {}",
        style("Fetched:").bold(),
        format_size(bytes_fetched, BINARY)
    );
    eprintln!("  {} {:.1}s", style("Duration:").bold(), duration_secs);
    if failed > 0 {
        eprintln!(
            "  {} {}",
            style("Failed:").yellow().bold(),
            format_number(failed)
        );
    }
    eprintln!();
}

/// Print a header before a pull starts
pub fn print_header(backend: &str, bucket: &str, keys: usize, workers: usize) {
    eprintln!();
    eprintln!(
        "{} {}",
        style("objpool").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("{}", style("─".repeat(50)).dim());
    eprintln!("  {} {}://{}", style("Source:").bold(), backend, bucket);
    eprintln!("  {} {}", style("Keys:").bold(), keys);
    eprintln!("  {} {}", style("Workers:").bold(), workers);
    eprintln!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234567), "1,234,567");
    }

    #[test]
    fn test_progress_done() {
        let progress = PullProgress {
            total_keys: 10,
            hits: 2,
            conversions: 3,
            failures: 1,
            ..PullProgress::default()
        };
        assert_eq!(progress.done(), 6);
    }
}
