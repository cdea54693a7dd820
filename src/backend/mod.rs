//! Remote store backends
//!
//! Every remote store sits behind the [`Backend`] trait. A backend only
//! knows how to transfer one object and how to enumerate a bucket; the
//! hit/miss decision, atomic placement and sidecar bookkeeping live in
//! [`crate::cache::ObjectCache`] and are shared by all variants.
//!
//! | Variant | Tooling | Change detection |
//! |---------|---------|------------------|
//! | [`S3Backend`] | `aws s3api` | real etags |
//! | [`HdfsBackend`] | `gohdfs checksum/get` | real checksums |
//! | [`Hdfs2xBackend`] | `hadoop fs -ls`, `hdfs dfs -get` | sentinel |
//! | [`LocalMirrorBackend`] | local filesystem | sentinel |

mod hdfs;
mod hdfs2x;
mod local;
mod s3;

pub use hdfs::HdfsBackend;
pub use hdfs2x::Hdfs2xBackend;
pub use local::LocalMirrorBackend;
pub use s3::S3Backend;

use crate::config::PoolConfig;
use crate::error::BackendResult;
use crate::tool::Tool;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Etag recorded by backends that cannot detect remote changes
pub const SENTINEL_ETAG: &str = "0";

/// Which remote store the process fronts
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Object storage via the aws cli
    S3,
    /// Distributed filesystem via gohdfs
    Hdfs,
    /// Distributed filesystem via the hadoop 2.x cli
    Hdfs2x,
    /// Local directory tree mirrored in place
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::S3 => "s3",
            BackendKind::Hdfs => "hdfs",
            BackendKind::Hdfs2x => "hdfs2x",
            BackendKind::Local => "local",
        };
        f.write_str(name)
    }
}

/// Whether a backend's etags reflect remote content
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDetection {
    /// Etag changes whenever the remote object changes
    Etag,
    /// Etag is always [`SENTINEL_ETAG`]; any local copy counts as current
    Sentinel,
}

/// Contract every remote store implements
pub trait Backend: Send + Sync {
    /// Variant of this backend
    fn kind(&self) -> BackendKind;

    /// Whether remote etags can be trusted to detect changes
    fn change_detection(&self) -> ChangeDetection {
        ChangeDetection::Etag
    }

    /// URI recorded in the sidecar for `(bucket, key)`
    fn source_uri(&self, bucket: &str, key: &str) -> String;

    /// For backends whose objects are already local, the path serving
    /// `(bucket, key)` in place; content is then never copied
    fn mirror_path(&self, _bucket: &str, _key: &str) -> Option<PathBuf> {
        None
    }

    /// Transfer `(bucket, key)` into `dest` and return its current etag
    ///
    /// `dest` does not exist on entry. Backends with a [`mirror_path`]
    /// leave it untouched and only confirm the object exists. Errors are
    /// returned verbatim and never retried here.
    ///
    /// [`mirror_path`]: Backend::mirror_path
    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> BackendResult<String>;

    /// Enumerate every object whose key starts with `prefix`
    ///
    /// `notify(key, etag)` is called once per object. Directory markers
    /// (keys ending in `/`) may be reported; callers filter them.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()>;

    /// Command-line tools this backend depends on, with arguments that check availability
    fn required_tools(&self) -> Vec<(Tool, &'static [&'static str])> {
        Vec::new()
    }
}

/// True for keys that name a directory rather than an object
pub fn is_dir_marker(key: &str) -> bool {
    key.is_empty() || key.ends_with('/')
}

/// Build the backend selected in the configuration
pub fn from_config(config: &PoolConfig) -> Arc<dyn Backend> {
    let timeout = config.tool_timeout;
    match config.backend {
        BackendKind::S3 => Arc::new(S3Backend::new(timeout)),
        BackendKind::Hdfs => Arc::new(HdfsBackend::new(timeout)),
        BackendKind::Hdfs2x => Arc::new(Hdfs2xBackend::new(timeout)),
        BackendKind::Local => Arc::new(LocalMirrorBackend::new(config.src_prefix.clone())),
    }
}

/// Classify a tool's stderr as "object does not exist"
pub(crate) fn looks_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    ["nosuchkey", "not found", "does not exist", "no such file", "(404)"]
        .iter()
        .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_marker() {
        assert!(is_dir_marker("logs/"));
        assert!(is_dir_marker(""));
        assert!(!is_dir_marker("logs/a.csv"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(looks_not_found(
            "An error occurred (NoSuchKey) when calling the GetObject operation"
        ));
        assert!(looks_not_found("open /b/x.csv: file does not exist"));
        assert!(looks_not_found("get: `/b/x.csv': No such file or directory"));
        assert!(!looks_not_found("connection refused"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(BackendKind::Hdfs2x.to_string(), "hdfs2x");
        assert_eq!(BackendKind::S3.to_string(), "s3");
    }
}
