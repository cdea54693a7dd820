//! Error types for objpool
//!
//! This module defines the error hierarchy that covers:
//! - Backend transport and listing errors
//! - Cache placement and sidecar errors
//! - Columnar conversion errors
//! - Configuration and CLI errors
//! - Scheduler/worker errors
//!
//! Per-key failures during a pull are carried as [`KeyOutcome`] values so a
//! failing key never aborts its siblings.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for objpool
#[derive(Error, Debug)]
pub enum PoolError {
    /// Backend errors
    #[error("{0}")]
    Backend(#[from] BackendError),

    /// Local cache errors
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// Conversion errors
    #[error("{0}")]
    Convert(#[from] ConvertError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Pull issued against a bucket whose catalog was never populated
    #[error("bucket '{bucket}' not refreshed")]
    BucketNotRefreshed { bucket: String },

    /// Request line could not be understood
    #[error("{0}")]
    InvalidRequest(String),

    /// Malformed request arguments
    #[error("{reason} for {command}")]
    InvalidArguments { command: String, reason: String },

    /// Raw object is cached but its conversion artifact is gone
    #[error("cache hit but conversion artifact missing")]
    CacheHitArtifactMissing,

    /// Cached artifact was built for a different schema
    #[error("schema not match")]
    SchemaMismatch,

    /// A key failed during a batch; wraps the underlying error
    #[error("{key}: {source}")]
    Key {
        key: String,
        #[source]
        source: Box<PoolError>,
    },
}

impl PoolError {
    /// Attach the failing key to an error
    pub fn for_key(key: impl Into<String>, source: PoolError) -> Self {
        PoolError::Key {
            key: key.into(),
            source: Box::new(source),
        }
    }
}

/// Remote store errors, returned verbatim and never retried at this layer
#[derive(Error, Debug, Clone)]
pub enum BackendError {
    /// Object does not exist remotely
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// Transport or authentication failure
    #[error("{tool} failed -- {stderr}")]
    ToolFailed { tool: String, stderr: String },

    /// Tool could not be launched at all
    #[error("cannot launch '{tool}': {reason}")]
    Launch { tool: String, reason: String },

    /// Tool exceeded its time budget and was killed
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// Tool output could not be understood
    #[error("cannot parse {tool} output: {reason}")]
    Parse { tool: String, reason: String },

    /// Local I/O failure while transferring
    #[error("transfer of {path} failed: {reason}")]
    Transfer { path: PathBuf, reason: String },
}

/// Local cache placement errors
#[derive(Error, Debug)]
pub enum CacheError {
    /// Temp file could not be created
    #[error("Cannot create temp file -- {0}")]
    TempFile(std::io::Error),

    /// Directory creation failed
    #[error("Cannot mkdir {path} -- {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Final rename into place failed
    #[error("Cannot mv file to {path} -- {source}")]
    Rename {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sidecar or key list write failed
    #[error("Cannot write {path} -- {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Cached object or sidecar could not be removed
    #[error("Cannot remove {path} -- {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Sidecar written but reads back without an etag
    #[error("sidecar {path} has no etag after write")]
    SidecarUnreadable { path: PathBuf },

    /// Bucket/key cannot be mapped to a local path
    #[error("Cannot map bucket+key to path -- {0}")]
    InvalidKey(String),
}

/// Columnar conversion errors
#[derive(Error, Debug)]
pub enum ConvertError {
    /// Format spec names a format the converter does not handle
    #[error("file type {0} not supported")]
    UnsupportedFormat(String),

    /// Format spec is not valid JSON
    #[error("invalid format spec: {0}")]
    InvalidFormatSpec(String),

    /// Converter exited non-zero
    #[error("{tool} failed -- {stderr}")]
    ToolFailed { tool: String, stderr: String },

    /// Converter could not be launched
    #[error("cannot launch '{tool}': {reason}")]
    Launch { tool: String, reason: String },

    /// Converter exceeded its time budget and was killed
    #[error("{tool} timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    /// Converter reported success but produced no zonemap
    #[error("conversion succeeded but artifact missing for {bucket}/{key}")]
    ArtifactMissing { bucket: String, key: String },

    /// Schema document could not be read or parsed
    #[error("{which} schema invalid: {reason}")]
    Schema { which: &'static str, reason: String },

    /// Part-file manifest beside a zonemap is not a JSON list of names
    #[error("invalid manifest {path}: {reason}")]
    InvalidManifest { path: PathBuf, reason: String },

    /// Artifact file removal failed
    #[error("cannot remove {path} -- {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Output directory creation failed
    #[error("cannot mkdir {path} -- {source}")]
    Mkdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid pull concurrency
    #[error("Invalid concurrency {count}: must be between 1 and {max}")]
    InvalidConcurrency { count: usize, max: usize },

    /// No output devices configured
    #[error("Missing or invalid device directory path")]
    NoDevices,

    /// Home directory unusable
    #[error("Invalid home directory '{path}': {reason}")]
    InvalidHome { path: PathBuf, reason: String },

    /// Required external tool is not runnable
    #[error("Cannot launch '{tool}' command. Please install {tool} or set PATH to include it.")]
    MissingTool { tool: String },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Task panicked
    #[error("Task panicked: {message}")]
    Panicked { message: String },

    /// Scheduler no longer accepts work
    #[error("Failed to submit task: scheduler closed")]
    QueueSendFailed,

    /// Worker initialization failed
    #[error("Failed to initialize worker {id}: {reason}")]
    InitFailed { id: usize, reason: String },

    /// Task finished without recording a result
    #[error("Task {index} finished without a result")]
    MissingResult { index: usize },
}

/// Result type alias for PoolError
pub type Result<T> = std::result::Result<T, PoolError>;

/// Result type alias for BackendError
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Result type alias for ConvertError
pub type ConvertResult<T> = std::result::Result<T, ConvertError>;

/// Result type alias for CacheError
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Represents the outcome of pulling a single key
#[derive(Debug)]
pub enum KeyOutcome {
    /// Cached artifact was valid for the requested schema
    Hit { key: String, zonemap: PathBuf },

    /// Object was fetched and converted
    Converted { key: String, zonemap: PathBuf },

    /// Failed with error
    Failed { key: String, error: PoolError },
}

impl KeyOutcome {
    /// Returns true if this outcome represents success
    pub fn is_success(&self) -> bool {
        !matches!(self, KeyOutcome::Failed { .. })
    }

    /// Returns the key associated with this outcome
    pub fn key(&self) -> &str {
        match self {
            KeyOutcome::Hit { key, .. } => key,
            KeyOutcome::Converted { key, .. } => key,
            KeyOutcome::Failed { key, .. } => key,
        }
    }

    /// Returns the zonemap path for successful outcomes
    pub fn zonemap(&self) -> Option<&PathBuf> {
        match self {
            KeyOutcome::Hit { zonemap, .. } | KeyOutcome::Converted { zonemap, .. } => {
                Some(zonemap)
            }
            KeyOutcome::Failed { .. } => None,
        }
    }
}
