//! Local cache placement and the hit/miss protocol
//!
//! Cached objects live at `HOME/data/BUCKET/KEY`, each with a sidecar at
//! `HOME/data/BUCKET/KEY__meta__` holding `<etag> <source-uri>`. Transfers
//! land in `HOME/tmp/` first and are renamed into place, so a reader never
//! sees a half-written object.
//!
//! ```text
//!   sidecar etag ──┐
//!                  ├── equal, non-empty, !force ──► Hit (no I/O)
//!   catalog etag ──┘
//!                  └── otherwise ──► fetch to tmp/ ──► rename ──► sidecar ──► upsert
//! ```
//!
//! Callers hold the `bucket:key` named lock around [`ObjectCache::get_object`].

use crate::backend::{Backend, ChangeDetection, SENTINEL_ETAG};
use crate::catalog::Catalog;
use crate::error::{CacheError, CacheResult, Result};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

/// Suffix appended to a cached object's path to name its sidecar
pub const SIDECAR_SUFFIX: &str = "__meta__";

/// Name of the per-bucket key list written by a refresh
pub const LIST_FILE: &str = "__list__";

/// Name of the append-only log under `log/`
pub const LOG_FILE: &str = "objpool.log";

/// Directory layout under the home directory
#[derive(Debug, Clone)]
pub struct Layout {
    data: PathBuf,
    tmp: PathBuf,
    log: PathBuf,
}

impl Layout {
    /// Compute the layout for `home` without touching the filesystem
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            data: home.join("data"),
            tmp: home.join("tmp"),
            log: home.join("log"),
        }
    }

    /// Compute the layout and create `data/`, `tmp/` and `log/`
    pub fn create(home: impl Into<PathBuf>) -> CacheResult<Self> {
        let layout = Self::new(home);
        for dir in [&layout.data, &layout.tmp, &layout.log] {
            fs::create_dir_all(dir).map_err(|source| CacheError::Mkdir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(layout)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp
    }

    /// File that receives the process log
    pub fn log_file(&self) -> PathBuf {
        self.log.join(LOG_FILE)
    }

    /// Canonical local path of `(bucket, key)`
    pub fn object_path(&self, bucket: &str, key: &str) -> CacheResult<PathBuf> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.data.join(bucket).join(key))
    }

    /// Path of the key list persisted by the last refresh of `bucket`
    pub fn list_path(&self, bucket: &str) -> CacheResult<PathBuf> {
        validate_bucket(bucket)?;
        Ok(self.data.join(bucket).join(LIST_FILE))
    }
}

fn validate_bucket(bucket: &str) -> CacheResult<()> {
    if bucket.is_empty() || bucket.contains('/') || bucket == "." || bucket == ".." {
        return Err(CacheError::InvalidKey(format!("bad bucket name '{}'", bucket)));
    }
    Ok(())
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey("empty key".into()));
    }
    let escapes = Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(CacheError::InvalidKey(format!("key '{}' escapes the cache", key)));
    }
    Ok(())
}

/// Sidecar path for a cached object
pub fn sidecar_path(object: &Path) -> PathBuf {
    let mut name = OsString::from(object.as_os_str());
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Parsed sidecar contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub etag: String,
    pub uri: String,
}

impl Sidecar {
    pub fn new(etag: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            etag: etag.into(),
            uri: uri.into(),
        }
    }

    /// Parse `<etag> <uri>`; anything else is unreadable
    pub fn parse(content: &str) -> Option<Self> {
        let (etag, uri) = content.split_once(' ')?;
        if etag.is_empty() {
            return None;
        }
        Some(Self::new(etag, uri.trim_end()))
    }

    /// Read a sidecar; missing or malformed files yield `None`
    pub fn read(path: &Path) -> Option<Self> {
        fs::read_to_string(path).ok().and_then(|s| Self::parse(&s))
    }

    pub fn render(&self) -> String {
        format!("{} {}", self.etag, self.uri)
    }
}

/// Result of [`ObjectCache::get_object`]
#[derive(Debug, Clone)]
pub struct CachedObject {
    /// Path serving the object's content
    pub path: PathBuf,

    /// Sidecar path
    pub sidecar: PathBuf,

    /// True when the existing local copy was used without a transfer
    pub hit: bool,

    /// Etag now recorded for the object
    pub etag: String,

    /// Bytes transferred (0 on a hit or for in-place mirrors)
    pub bytes: u64,
}

/// Fetch-or-hit logic shared by every backend
pub struct ObjectCache {
    layout: Layout,
    catalog: Arc<Catalog>,
    backend: Arc<dyn Backend>,
}

impl ObjectCache {
    pub fn new(layout: Layout, catalog: Arc<Catalog>, backend: Arc<dyn Backend>) -> Self {
        Self {
            layout,
            catalog,
            backend,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Return a current local copy of `(bucket, key)`, fetching if stale
    pub fn get_object(&self, bucket: &str, key: &str, force: bool) -> Result<CachedObject> {
        let object_path = self.layout.object_path(bucket, key)?;
        let sidecar = sidecar_path(&object_path);
        let mirror = self.backend.mirror_path(bucket, key);
        let serve_path = mirror.clone().unwrap_or_else(|| object_path.clone());

        let mut etag = Sidecar::read(&sidecar).map(|s| s.etag).unwrap_or_default();
        if !serve_path.is_file() {
            debug!(bucket, key, "Local copy missing");
            etag.clear();
        }
        let catetag = self.catalog.find(bucket, key);

        if !force && !etag.is_empty() {
            let sentinel_hit = self.backend.change_detection() == ChangeDetection::Sentinel
                && etag == SENTINEL_ETAG;
            if etag == catetag || sentinel_hit {
                if etag != catetag {
                    self.catalog.upsert(bucket, key, &etag);
                }
                debug!(bucket, key, etag = %etag, "Cache hit");
                return Ok(CachedObject {
                    path: serve_path,
                    sidecar,
                    hit: true,
                    etag,
                    bytes: 0,
                });
            }
        }

        debug!(
            bucket,
            key,
            local = %etag,
            catalog = %catetag,
            force,
            "Cache miss"
        );

        let (new_etag, bytes) = match &mirror {
            Some(path) => (self.backend.fetch(bucket, key, path)?, 0),
            None => self.transfer(bucket, key, &object_path)?,
        };

        let record = Sidecar::new(new_etag, self.backend.source_uri(bucket, key));
        self.write_sidecar(&record, &sidecar)?;

        // The catalog takes whatever the sidecar now says
        let stored = Sidecar::read(&sidecar).ok_or_else(|| CacheError::SidecarUnreadable {
            path: sidecar.clone(),
        })?;
        self.catalog.upsert(bucket, key, &stored.etag);

        Ok(CachedObject {
            path: serve_path,
            sidecar,
            hit: false,
            etag: stored.etag,
            bytes,
        })
    }

    /// Remove a cached copy and its sidecar so the next pull refetches
    ///
    /// In-place mirrors keep their content; only the sidecar is removed.
    pub fn evict(&self, bucket: &str, key: &str) -> CacheResult<()> {
        let object_path = self.layout.object_path(bucket, key)?;
        if self.backend.mirror_path(bucket, key).is_none() {
            remove_if_present(&object_path)?;
        }
        remove_if_present(&sidecar_path(&object_path))
    }

    /// Fetch into a temp file under `tmp/` and rename it into place
    fn transfer(&self, bucket: &str, key: &str, dest: &Path) -> Result<(String, u64)> {
        let temp = NamedTempFile::new_in(self.layout.tmp_dir())
            .map_err(CacheError::TempFile)?
            .into_temp_path();
        // Fetch tools refuse to overwrite an existing file
        let _ = fs::remove_file(&temp);

        let etag = self.backend.fetch(bucket, key, &temp)?;
        let bytes = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        place(temp, dest)?;

        Ok((etag, bytes))
    }

    fn write_sidecar(&self, record: &Sidecar, dest: &Path) -> CacheResult<()> {
        write_atomic(self.layout.tmp_dir(), dest, record.render().as_bytes())
    }
}

/// Write `content` to a temp file in `tmp_dir`, then rename it to `dest`
pub fn write_atomic(tmp_dir: &Path, dest: &Path, content: &[u8]) -> CacheResult<()> {
    let mut file = NamedTempFile::new_in(tmp_dir).map_err(CacheError::TempFile)?;
    file.write_all(content).map_err(|source| CacheError::Write {
        path: dest.to_path_buf(),
        source,
    })?;
    place(file.into_temp_path(), dest)
}

/// Rename `temp` to `dest`, creating the parent tree and retrying once
/// when the destination directory is missing
fn place(temp: TempPath, dest: &Path) -> CacheResult<()> {
    let err = match temp.persist(dest) {
        Ok(()) => return Ok(()),
        Err(err) => err,
    };
    if err.error.kind() != io::ErrorKind::NotFound {
        return Err(CacheError::Rename {
            path: dest.to_path_buf(),
            source: err.error,
        });
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| CacheError::Mkdir {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    err.path.persist(dest).map_err(|e| CacheError::Rename {
        path: dest.to_path_buf(),
        source: e.error,
    })
}

fn remove_if_present(path: &Path) -> CacheResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(CacheError::Remove {
            path: path.to_path_buf(),
            source,
        }),
    }
}
