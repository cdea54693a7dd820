//! Distributed filesystem backend driven by `gohdfs`
//!
//! `gohdfs checksum PATH` prints one `CHECKSUM PATH` line per file, which
//! doubles as the listing format and as the etag source for a fetch.

use super::{looks_not_found, Backend, BackendKind};
use crate::error::{BackendError, BackendResult};
use crate::tool::{Tool, ToolFailure};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

/// HDFS via `gohdfs`
#[derive(Debug, Clone)]
pub struct HdfsBackend {
    gohdfs: Tool,
}

impl HdfsBackend {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            gohdfs: Tool::new("gohdfs").with_timeout(timeout),
        }
    }

    fn classify(&self, bucket: &str, key: &str, failure: ToolFailure) -> BackendError {
        match &failure {
            ToolFailure::Exit { stderr, .. } if looks_not_found(stderr) => BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => failure.into(),
        }
    }
}

/// Absolute filesystem path of an object
fn dfs_path(bucket: &str, key: &str) -> String {
    format!("/{}/{}", bucket, key)
}

impl Backend for HdfsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hdfs
    }

    fn source_uri(&self, bucket: &str, key: &str) -> String {
        format!("hdfs://{}/{}", bucket, key)
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> BackendResult<String> {
        let path = dfs_path(bucket, key);

        // Checksum is taken before the transfer
        let output = self
            .gohdfs
            .run(["checksum", path.as_str()])
            .map_err(|failure| self.classify(bucket, key, failure))?;
        let stdout = output.stdout_str();
        let etag = stdout
            .lines()
            .find_map(parse_checksum_line)
            .map(|(etag, _)| etag.to_string())
            .ok_or_else(|| BackendError::Parse {
                tool: "gohdfs checksum".into(),
                reason: format!("no checksum line for {}", path),
            })?;

        let args: [&OsStr; 3] = [OsStr::new("get"), OsStr::new(&path), dest.as_os_str()];
        self.gohdfs
            .run(args)
            .map_err(|failure| self.classify(bucket, key, failure))?;

        Ok(etag)
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()> {
        let root = if prefix.is_empty() {
            format!("hdfs://{}", bucket)
        } else {
            format!("hdfs://{}/{}", bucket, prefix)
        };
        let output = self.gohdfs.run(["checksum", root.as_str()])?;

        for (etag, key) in output.stdout_str().lines().filter_map(parse_checksum_line) {
            notify(key.trim_start_matches('/'), etag);
        }
        Ok(())
    }

    fn required_tools(&self) -> Vec<(Tool, &'static [&'static str])> {
        vec![(self.gohdfs.clone(), &["--help"][..])]
    }
}

/// Parse an `ETAG KEY` line; lines without both parts are skipped
fn parse_checksum_line(line: &str) -> Option<(&str, &str)> {
    let (etag, key) = line.split_once(' ')?;
    let etag = etag.trim();
    let key = key.trim();
    if etag.is_empty() || key.is_empty() {
        return None;
    }
    Some((etag, key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_checksum_line() {
        assert_eq!(
            parse_checksum_line("0000020000000000000000003b4a /b/dir/a.csv"),
            Some(("0000020000000000000000003b4a", "/b/dir/a.csv"))
        );
        assert_eq!(parse_checksum_line("garbage"), None);
        assert_eq!(parse_checksum_line(" "), None);
    }

    #[test]
    fn test_paths() {
        let backend = HdfsBackend::new(None);
        assert_eq!(dfs_path("b", "dir/a.csv"), "/b/dir/a.csv");
        assert_eq!(backend.source_uri("b", "a.csv"), "hdfs://b/a.csv");
    }
}
