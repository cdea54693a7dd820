//! Local mirror backend
//!
//! Objects live under `SRC_PREFIX/BUCKET/KEY` on a locally mounted tree and
//! are served in place. Only the sidecar is written into the cache, so a
//! pull never copies content.

use super::{Backend, BackendKind, ChangeDetection, SENTINEL_ETAG};
use crate::error::{BackendError, BackendResult};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Directory tree mirrored in place
#[derive(Debug, Clone)]
pub struct LocalMirrorBackend {
    src_prefix: PathBuf,
}

impl LocalMirrorBackend {
    pub fn new(src_prefix: impl Into<PathBuf>) -> Self {
        Self {
            src_prefix: src_prefix.into(),
        }
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.src_prefix.join(bucket).join(key)
    }
}

impl Backend for LocalMirrorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn change_detection(&self) -> ChangeDetection {
        ChangeDetection::Sentinel
    }

    fn source_uri(&self, bucket: &str, key: &str) -> String {
        self.object_path(bucket, key).display().to_string()
    }

    fn mirror_path(&self, bucket: &str, key: &str) -> Option<PathBuf> {
        Some(self.object_path(bucket, key))
    }

    /// Confirms the mirrored object exists; `dest` is left untouched
    fn fetch(&self, bucket: &str, key: &str, _dest: &Path) -> BackendResult<String> {
        let path = self.object_path(bucket, key);
        if !path.is_file() {
            return Err(BackendError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        Ok(SENTINEL_ETAG.to_string())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()> {
        let root = self.src_prefix.join(bucket);
        if !root.is_dir() {
            return Err(BackendError::Transfer {
                path: root,
                reason: "bucket directory does not exist".into(),
            });
        }

        for entry in WalkDir::new(&root).min_depth(1).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "Skipping unreadable mirror entry");
                    continue;
                }
            };
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let mut key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().is_dir() {
                key.push('/');
            }
            if key.starts_with(prefix) {
                notify(&key, SENTINEL_ETAG);
            }
        }
        Ok(())
    }
}
