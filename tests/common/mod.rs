//! Shared fixtures for integration tests
#![allow(dead_code)]

use dashmap::DashMap;
use objpool::backend::{Backend, BackendKind};
use objpool::error::{BackendError, BackendResult};
use objpool::{Pool, PoolConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tempfile::TempDir;

pub const CSV_SPEC: &str = r#"{"fmt":"csv","csvspec":{"delim":",","quote":"\"","escape":"\\","nullstr":"","header_line":false}}"#;
pub const PARQUET_SPEC: &str = r#"{"fmt":"parquet"}"#;
pub const SCHEMA: &str = r#"[{"name":"id","type":"int64"},{"name":"price","type":"decimal","precision":10,"scale":2}]"#;

/// In-memory object store keyed by `(bucket, key)`
#[derive(Default)]
pub struct MemoryBackend {
    objects: DashMap<(String, String), (String, Vec<u8>)>,
    fetches: AtomicUsize,
}

impl MemoryBackend {
    pub fn put(&self, bucket: &str, key: &str, etag: &str, body: &[u8]) {
        self.objects.insert(
            (bucket.to_string(), key.to_string()),
            (etag.to_string(), body.to_vec()),
        );
    }

    /// Number of transfers performed so far
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn source_uri(&self, bucket: &str, key: &str) -> String {
        format!("mem://{}/{}", bucket, key)
    }

    fn fetch(&self, bucket: &str, key: &str, dest: &Path) -> BackendResult<String> {
        let entry = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| BackendError::NotFound {
                bucket: bucket.into(),
                key: key.into(),
            })?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (etag, body) = entry.value();
        fs::write(dest, body).map_err(|e| BackendError::Transfer {
            path: dest.to_path_buf(),
            reason: e.to_string(),
        })?;
        Ok(etag.clone())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        notify: &mut dyn FnMut(&str, &str),
    ) -> BackendResult<()> {
        let mut entries: Vec<(String, String)> = self
            .objects
            .iter()
            .filter(|e| e.key().0 == bucket && e.key().1.starts_with(prefix))
            .map(|e| (e.key().1.clone(), e.value().0.clone()))
            .collect();
        entries.sort();
        for (key, etag) in &entries {
            notify(key, etag);
        }
        Ok(())
    }
}

/// Stand-in converter
///
/// Writes STEM.zmp and a copy of the schema into the first -D directory,
/// appends the source to SCHEMA.calls, fails for sources containing FAIL.
const CONVERTER: &str = r#"#!/bin/sh
schema=""; out=""; src=""
while [ $# -gt 0 ]; do
  case "$1" in
    -s) schema="$2"; shift 2 ;;
    -D) [ -z "$out" ] && out="$2"; shift 2 ;;
    -d|-q|-x|-N|-i|-n) shift 2 ;;
    -H|-l) shift ;;
    *) src="$1"; shift ;;
  esac
done
echo "$src" >> "$schema.calls"
case "$src" in
  *FAIL*) echo "cannot parse $src" >&2; exit 1 ;;
esac
base=$(basename "$src"); base=${base%.gz}; stem=${base%.*}
echo zonemap > "$out/$stem.zmp"
cp "$schema" "$out/$stem.schema"
"#;

/// Path of the fake converter, written once per test binary
pub fn converter() -> &'static Path {
    static SCRIPT: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    &SCRIPT
        .get_or_init(|| {
            use std::os::unix::fs::PermissionsExt;
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("fake-xrgdiv");
            fs::write(&path, CONVERTER).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            (dir, path)
        })
        .1
}

/// A pool under a fresh temp directory
pub struct Fixture {
    pub dir: TempDir,
    pub pool: Pool,
    pub schema: PathBuf,
}

impl Fixture {
    pub fn new(backend: Arc<dyn Backend>, kind: BackendKind) -> Self {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        fs::create_dir_all(&home).unwrap();
        let schema = dir.path().join("schema.json");
        fs::write(&schema, SCHEMA).unwrap();

        let mut config = PoolConfig::new(
            &home,
            vec![dir.path().join("d1"), dir.path().join("d2")],
            kind,
        );
        config.converter = converter().to_path_buf();
        config.concurrency = 4;

        let pool = Pool::with_backend(config, backend).unwrap();
        Self { dir, pool, schema }
    }

    /// Converter invocations recorded for this fixture's schema file
    pub fn conversions(&self) -> usize {
        fs::read_to_string(format!("{}.calls", self.schema.display()))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    pub fn device(&self, n: usize) -> PathBuf {
        self.dir.path().join(format!("d{}", n))
    }

    pub fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }
}
