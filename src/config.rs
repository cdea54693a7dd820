//! Configuration types for objpool
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation

use crate::backend::BackendKind;
use crate::error::ConfigError;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Maximum reasonable pull concurrency
const MAX_CONCURRENCY: usize = 512;

/// Default pull concurrency
const DEFAULT_CONCURRENCY: usize = 20;

/// Default converter program
const DEFAULT_CONVERTER: &str = "xrgdiv";

/// Write-through local disk cache for remote object stores
#[derive(Parser, Debug, Clone)]
#[command(
    name = "objpool",
    version,
    about = "Write-through local disk cache for remote object stores",
    long_about = "Caches objects from S3, HDFS or a local mirror on local disk and converts \
                  them into a partitioned columnar format with a zonemap index.\n\n\
                  Cached objects live under HOME/data with a sidecar recording the remote etag; \
                  conversion output is striped across the configured devices.",
    after_help = "EXAMPLES:\n    \
        objpool -D /var/pool -d /mnt/d1 -d /mnt/d2 --backend s3 refresh mybucket\n    \
        objpool -D /var/pool -d /mnt/d1 --backend s3 glob mybucket 'logs/**.csv'\n    \
        objpool -D /var/pool -d /mnt/d1 --backend hdfs pull --format '{\"fmt\":\"parquet\"}' \\\n        \
            --schema schema.json mybucket a.parquet b.parquet\n    \
        objpool -D /var/pool -d /mnt/d1 --backend local --src-prefix /data exec < requests.jsonl"
)]
pub struct CliArgs {
    /// Operation to perform
    #[command(subcommand)]
    pub command: Command,

    /// Home directory; data/, tmp/ and log/ are created beneath it
    #[arg(short = 'D', long, value_name = "DIR")]
    pub home: PathBuf,

    /// Conversion output device directory (can be repeated)
    #[arg(short = 'd', long = "device", value_name = "DIR", action = clap::ArgAction::Append)]
    pub devices: Vec<PathBuf>,

    /// Maximum number of keys pulled concurrently
    #[arg(short = 'c', long, default_value_t = DEFAULT_CONCURRENCY, value_name = "NUM")]
    pub concurrency: usize,

    /// Remote store to front
    #[arg(long, value_enum)]
    pub backend: BackendKind,

    /// Source prefix for the local mirror backend
    #[arg(long, default_value = "/", value_name = "DIR")]
    pub src_prefix: PathBuf,

    /// Rows per row group passed to the converter (0 = converter default)
    #[arg(short = 'N', long, default_value_t = 0, value_name = "NUM")]
    pub rows_per_group: usize,

    /// Converter program
    #[arg(long, default_value = DEFAULT_CONVERTER, value_name = "PROG")]
    pub converter: PathBuf,

    /// Kill backend tools running longer than this (0 = no limit)
    #[arg(long, default_value_t = 0, value_name = "SECS")]
    pub tool_timeout: u64,

    /// Kill conversions running longer than this (0 = no limit)
    #[arg(long, default_value_t = 0, value_name = "SECS")]
    pub convert_timeout: u64,

    /// Do not check that the converter and backend tools can be launched
    #[arg(long)]
    pub skip_tool_check: bool,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Enumerate a bucket and replace its catalog entries
    Refresh {
        #[arg(value_name = "BUCKET")]
        bucket: String,
    },

    /// List objects under a prefix with their etags
    List {
        #[arg(value_name = "BUCKET")]
        bucket: String,

        #[arg(value_name = "PREFIX", default_value = "")]
        prefix: String,
    },

    /// Match the keys of the last refresh against a glob pattern
    Glob {
        #[arg(value_name = "BUCKET")]
        bucket: String,

        #[arg(value_name = "PATTERN")]
        pattern: String,
    },

    /// Refresh a bucket, then fetch and convert keys
    Pull {
        /// Format spec JSON, e.g. '{"fmt":"csv","csvspec":{"delim":","}}'
        #[arg(long, value_name = "JSON")]
        format: String,

        /// Schema file passed to the converter
        #[arg(long, value_name = "FILE")]
        schema: PathBuf,

        /// Report every key instead of stopping at the first failure
        #[arg(long)]
        detailed: bool,

        #[arg(value_name = "BUCKET")]
        bucket: String,

        #[arg(value_name = "KEY", required = true, num_args = 1..)]
        keys: Vec<String>,
    },

    /// Answer JSON request lines read from stdin
    Exec,
}

/// Validated runtime configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Home directory
    pub home: PathBuf,

    /// Conversion output devices, scanned in order
    pub devices: Vec<PathBuf>,

    /// Pull concurrency
    pub concurrency: usize,

    /// Active backend
    pub backend: BackendKind,

    /// Local mirror root
    pub src_prefix: PathBuf,

    /// Rows per row group (0 = converter default)
    pub rows_per_group: usize,

    /// Converter program
    pub converter: PathBuf,

    /// Backend tool time budget
    pub tool_timeout: Option<Duration>,

    /// Converter time budget
    pub convert_timeout: Option<Duration>,

    /// Probe tools at start-up
    pub check_tools: bool,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl PoolConfig {
    /// Configuration with defaults for everything but the essentials
    pub fn new(home: impl Into<PathBuf>, devices: Vec<PathBuf>, backend: BackendKind) -> Self {
        Self {
            home: home.into(),
            devices,
            concurrency: DEFAULT_CONCURRENCY,
            backend,
            src_prefix: PathBuf::from("/"),
            rows_per_group: 0,
            converter: PathBuf::from(DEFAULT_CONVERTER),
            tool_timeout: None,
            convert_timeout: None,
            check_tools: true,
            show_progress: false,
            verbose: false,
        }
    }

    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        let config = Self {
            home: args.home.clone(),
            devices: args.devices.clone(),
            concurrency: args.concurrency,
            backend: args.backend,
            src_prefix: args.src_prefix.clone(),
            rows_per_group: args.rows_per_group,
            converter: args.converter.clone(),
            tool_timeout: secs(args.tool_timeout),
            convert_timeout: secs(args.convert_timeout),
            check_tools: !args.skip_tool_check,
            show_progress: !args.quiet,
            verbose: args.verbose,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and that the home directory is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigError::InvalidConcurrency {
                count: self.concurrency,
                max: MAX_CONCURRENCY,
            });
        }

        if self.devices.is_empty() || self.devices.iter().any(|d| d.as_os_str().is_empty()) {
            return Err(ConfigError::NoDevices);
        }

        if !self.home.is_dir() {
            return Err(ConfigError::InvalidHome {
                path: self.home.clone(),
                reason: "not an existing directory".to_string(),
            });
        }

        Ok(())
    }
}

/// Zero means "no limit"
fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
