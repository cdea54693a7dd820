//! Hadoop 2.x backend
//!
//! The 2.x cli exposes no usable checksum, so every object carries the
//! sentinel etag and a local copy, once present, is never refetched unless
//! forced.

use super::{looks_not_found, Backend, BackendKind, ChangeDetection, SENTINEL_ETAG};
use crate::error::{BackendError, BackendResult};
use crate::tool::{Tool, ToolFailure};
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;

/// HDFS via `hadoop fs -ls` and `hdfs dfs -get`
#[derive(Debug, Clone)]
pub struct Hdfs2xBackend {
    hadoop: Tool,
    hdfs: Tool,
}

impl Hdfs2xBackend {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            hadoop: Tool::new("hadoop").with_timeout(timeout),
            hdfs: Tool::new("hdfs").with_timeout(timeout),
        }
    }
}

impl Backend for Hdfs2xBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hdfs2x
    }

    fn change_detection(&self) -> ChangeDetection {
        ChangeDetection::Sentinel
    }

    fn source_uri(&self, bucket: &str, key: &str) -> String {
        format!("/{}/{}", bucket, key)
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> BackendResult<String> {
        let path = self.source_uri(bucket, key);
        let args: [&OsStr; 4] = [
            OsStr::new("dfs"),
            OsStr::new("-get"),
            OsStr::new(&path),
            dest.as_os_str(),
        ];
        self.hdfs.run(args).map_err(|failure| match &failure {
            ToolFailure::Exit { stderr, .. } if looks_not_found(stderr) => BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
            _ => failure.into(),
        })?;

        Ok(SENTINEL_ETAG.to_string())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()> {
        let root = if prefix.is_empty() {
            format!("/{}", bucket)
        } else {
            format!("/{}/{}", bucket, prefix)
        };
        let output = self.hadoop.run(["fs", "-ls", root.as_str()])?;

        for line in output.stdout_str().lines() {
            if let Some(key) = parse_ls_line(line, bucket) {
                notify(&key, SENTINEL_ETAG);
            }
        }
        Ok(())
    }

    fn required_tools(&self) -> Vec<(Tool, &'static [&'static str])> {
        vec![
            (self.hadoop.clone(), &["--help"][..]),
            (self.hdfs.clone(), &["version"][..]),
        ]
    }
}

/// Extract the key from one `hadoop fs -ls` line
///
/// Directories are reported with a trailing `/` so the caller drops them.
fn parse_ls_line(line: &str, bucket: &str) -> Option<String> {
    if line.starts_with("Found") {
        return None;
    }
    let (_, path) = line.trim_end().rsplit_once(' ')?;
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let bucket_root = format!("/{}/", bucket);
    let key = path.strip_prefix(&bucket_root).unwrap_or(path);

    if line.starts_with('d') {
        Some(format!("{}/", key))
    } else {
        Some(key.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ls_output() {
        let listing = "Found 3 items\n\
            -rw-r--r--   3 hdfs supergroup       1366 2019-04-01 10:00 /b/a.csv\n\
            drwxr-xr-x   - hdfs supergroup          0 2019-04-01 10:00 /b/logs\n\
            -rw-r--r--   3 hdfs supergroup        912 2019-04-01 10:00 /b/logs/x.csv\n";

        let keys: Vec<String> = listing
            .lines()
            .filter_map(|line| parse_ls_line(line, "b"))
            .collect();
        assert_eq!(keys, vec!["a.csv", "logs/", "logs/x.csv"]);
    }

    #[test]
    fn test_sentinel_change_detection() {
        let backend = Hdfs2xBackend::new(None);
        assert_eq!(backend.change_detection(), ChangeDetection::Sentinel);
        assert_eq!(backend.source_uri("b", "a.csv"), "/b/a.csv");
    }
}
