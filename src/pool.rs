//! The pool service
//!
//! [`Pool`] owns every shared service (catalog, lock registry, scheduler,
//! backend, cache, converter) and exposes the request-level operations.
//!
//! ```text
//!   pull(spec, schema, bucket, keys)
//!     │  catalog.exists(bucket)?          else "bucket not refreshed"
//!     ▼
//!   scheduler.map(keys) ──► per key, under lock "bucket:key":
//!                             get_object ─┬─ hit  ─► find zonemap ─► check_schema
//!                                         └─ miss ─► remove stale ─► convert
//!                                                         (failure: evict raw copy)
//!     ▼
//!   one KeyOutcome per key, in input order
//! ```

use crate::backend::{self, is_dir_marker, Backend};
use crate::cache::{write_atomic, Layout, ObjectCache};
use crate::catalog::Catalog;
use crate::config::PoolConfig;
use crate::convert::{self, Converter, FormatSpec};
use crate::error::{ConfigError, KeyOutcome, PoolError, Result};
use crate::glob::KeyPattern;
use crate::lock::NamedLock;
use crate::scheduler::{JobScheduler, SchedulerStats};
use crate::tool::Tool;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Counters reported by the STATUS request
#[derive(Debug, Default)]
pub struct PoolStats {
    pub pulls: AtomicU64,
    pub keys: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub conversions: AtomicU64,
    pub conversion_failures: AtomicU64,
    pub key_failures: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub refreshes: AtomicU64,
    pub lists: AtomicU64,
    pub globs: AtomicU64,
}

impl PoolStats {
    /// `(name, value)` pairs in a stable order
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        vec![
            ("pulls", get(&self.pulls)),
            ("keys", get(&self.keys)),
            ("hits", get(&self.hits)),
            ("misses", get(&self.misses)),
            ("conversions", get(&self.conversions)),
            ("conversion_failures", get(&self.conversion_failures)),
            ("key_failures", get(&self.key_failures)),
            ("bytes_fetched", get(&self.bytes_fetched)),
            ("refreshes", get(&self.refreshes)),
            ("lists", get(&self.lists)),
            ("globs", get(&self.globs)),
        ]
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a per-key pull job needs, shared across workers
struct PullJob {
    bucket: String,
    spec: FormatSpec,
    schema_path: PathBuf,
    schema: Vec<u8>,
    locks: Arc<NamedLock>,
    cache: Arc<ObjectCache>,
    converter: Arc<Converter>,
    stats: Arc<PoolStats>,
}

impl PullJob {
    fn run(&self, key: String) -> KeyOutcome {
        match self.pull_key(&key) {
            Ok((zonemap, true)) => KeyOutcome::Hit { key, zonemap },
            Ok((zonemap, false)) => KeyOutcome::Converted { key, zonemap },
            Err(error) => {
                PoolStats::bump(&self.stats.key_failures);
                warn!(bucket = %self.bucket, key = %key, error = %error, "Pull failed");
                KeyOutcome::Failed { key, error }
            }
        }
    }

    /// Returns the zonemap path and whether the cache was hit
    fn pull_key(&self, key: &str) -> Result<(PathBuf, bool)> {
        let bucket = self.bucket.as_str();
        let _guard = self.locks.acquire(&NamedLock::object_name(bucket, key));

        let cached = self.cache.get_object(bucket, key, false)?;
        self.stats
            .bytes_fetched
            .fetch_add(cached.bytes, Ordering::Relaxed);

        if cached.hit {
            PoolStats::bump(&self.stats.hits);
            let zonemap = self
                .converter
                .find_zonemap(bucket, key)
                .ok_or(PoolError::CacheHitArtifactMissing)?;

            return match convert::check_schema(&self.schema, &zonemap, &self.spec) {
                Ok(true) => Ok((zonemap, true)),
                Ok(false) => Err(PoolError::SchemaMismatch),
                Err(e) => {
                    debug!(bucket, key, error = %e, "Schema check failed");
                    Err(PoolError::SchemaMismatch)
                }
            };
        }

        PoolStats::bump(&self.stats.misses);
        if let Some(stale) = self.converter.find_zonemap(bucket, key) {
            convert::remove_artifact(&stale)?;
        }

        match self
            .converter
            .convert(bucket, key, &cached.path, &self.schema_path, &self.spec)
        {
            Ok(zonemap) => {
                PoolStats::bump(&self.stats.conversions);
                Ok((zonemap, false))
            }
            Err(e) => {
                PoolStats::bump(&self.stats.conversion_failures);
                // Force a clean refetch next time
                if let Err(evict) = self.cache.evict(bucket, key) {
                    warn!(bucket, key, error = %evict, "Cannot remove raw copy after failed conversion");
                }
                Err(e.into())
            }
        }
    }
}

/// Cache service: one per process, or one per test
pub struct Pool {
    config: PoolConfig,
    catalog: Arc<Catalog>,
    locks: Arc<NamedLock>,
    scheduler: JobScheduler,
    backend: Arc<dyn Backend>,
    cache: Arc<ObjectCache>,
    converter: Arc<Converter>,
    stats: Arc<PoolStats>,
}

impl Pool {
    /// Build a pool with the backend named in the configuration
    pub fn new(config: PoolConfig) -> Result<Self> {
        let backend = backend::from_config(&config);
        Self::with_backend(config, backend)
    }

    /// Build a pool around an explicit backend
    pub fn with_backend(config: PoolConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let layout = Layout::create(&config.home)?;
        let catalog = Arc::new(Catalog::new());
        let cache = Arc::new(ObjectCache::new(
            layout,
            Arc::clone(&catalog),
            Arc::clone(&backend),
        ));
        let converter = Arc::new(Converter::new(
            Tool::new(config.converter.as_os_str()).with_timeout(config.convert_timeout),
            config.devices.clone(),
            config.rows_per_group,
        ));
        let scheduler = JobScheduler::new(config.concurrency)?;

        info!(
            backend = %backend.kind(),
            home = %config.home.display(),
            devices = config.devices.len(),
            concurrency = config.concurrency,
            "Pool ready"
        );

        Ok(Self {
            config,
            catalog,
            locks: Arc::new(NamedLock::new()),
            scheduler,
            backend,
            cache,
            converter,
            stats: Arc::new(PoolStats::default()),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn layout(&self) -> &Layout {
        self.cache.layout()
    }

    pub fn converter(&self) -> &Converter {
        &self.converter
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    pub fn scheduler_stats(&self) -> Arc<SchedulerStats> {
        self.scheduler.stats()
    }

    /// Verify the converter and the backend's tools can be launched
    pub fn check_tools(&self) -> std::result::Result<(), ConfigError> {
        let mut required = vec![(self.converter.tool().clone(), &["--help"][..])];
        required.extend(self.backend.required_tools());

        for (tool, args) in required {
            if !tool.is_available(args) {
                return Err(ConfigError::MissingTool { tool: tool.name() });
            }
            debug!(tool = %tool.name(), "Tool available");
        }
        Ok(())
    }

    /// Enumerate `bucket` and atomically replace its catalog entries
    ///
    /// The key list is also persisted at `data/BUCKET/__list__` for GLOB.
    pub fn refresh(&self, bucket: &str) -> Result<usize> {
        let _guard = self.locks.acquire(&NamedLock::refresh_name(bucket));
        let started = Instant::now();

        let mut entries = Vec::new();
        self.backend.list_objects(bucket, "", &mut |key, etag| {
            if !is_dir_marker(key) {
                entries.push((key.to_string(), etag.to_string()));
            }
        })?;

        let mut listing = String::new();
        for (key, _) in &entries {
            listing.push_str(key);
            listing.push('\n');
        }
        let layout = self.layout();
        write_atomic(layout.tmp_dir(), &layout.list_path(bucket)?, listing.as_bytes())?;

        let count = entries.len();
        self.catalog.store(bucket, entries);
        PoolStats::bump(&self.stats.refreshes);

        info!(
            bucket,
            objects = count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Refreshed"
        );
        Ok(count)
    }

    /// `(key, etag)` for every object under `prefix`, directories dropped
    pub fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        self.backend.list_objects(bucket, prefix, &mut |key, etag| {
            if !is_dir_marker(key) {
                entries.push((key.to_string(), etag.to_string()));
            }
        })?;
        PoolStats::bump(&self.stats.lists);
        Ok(entries)
    }

    /// Keys from the last refresh of `bucket` matching `pattern`
    pub fn glob(&self, bucket: &str, pattern: &str) -> Result<Vec<String>> {
        let matcher = KeyPattern::new(pattern).map_err(|reason| PoolError::InvalidArguments {
            command: "GLOB".into(),
            reason,
        })?;

        let list_path = self.layout().list_path(bucket)?;
        let listing = match fs::read_to_string(&list_path) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(PoolError::BucketNotRefreshed {
                    bucket: bucket.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        PoolStats::bump(&self.stats.globs);
        Ok(listing
            .lines()
            .filter(|key| !key.is_empty() && matcher.matches(key))
            .map(str::to_string)
            .collect())
    }

    /// Fetch-or-hit and convert-or-validate every key, one outcome per key
    ///
    /// Fails as a whole only on preconditions: an unrefreshed bucket, an
    /// unreadable schema file or an unparseable format spec.
    pub fn pull_detailed(
        &self,
        format_spec: &str,
        schema_path: &Path,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<KeyOutcome>> {
        PoolStats::bump(&self.stats.pulls);
        if !self.catalog.exists(bucket) {
            return Err(PoolError::BucketNotRefreshed {
                bucket: bucket.to_string(),
            });
        }
        let schema = fs::read(schema_path)?;
        let spec = FormatSpec::from_json(format_spec)?;

        self.stats
            .keys
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        let started = Instant::now();

        let job = Arc::new(PullJob {
            bucket: bucket.to_string(),
            spec,
            schema_path: schema_path.to_path_buf(),
            schema,
            locks: Arc::clone(&self.locks),
            cache: Arc::clone(&self.cache),
            converter: Arc::clone(&self.converter),
            stats: Arc::clone(&self.stats),
        });

        let results = self
            .scheduler
            .map(keys.to_vec(), move |_, key| job.run(key))?;

        let outcomes: Vec<KeyOutcome> = results
            .into_iter()
            .zip(keys)
            .map(|(result, key)| {
                result.unwrap_or_else(|e| KeyOutcome::Failed {
                    key: key.clone(),
                    error: e.into(),
                })
            })
            .collect();

        let failed = outcomes.iter().filter(|o| !o.is_success()).count();
        info!(
            bucket,
            keys = keys.len(),
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pull complete"
        );
        Ok(outcomes)
    }

    /// Zonemap paths in input order, or the first failed key's error
    ///
    /// Successful keys keep their side effects even when another key fails.
    pub fn pull(
        &self,
        format_spec: &str,
        schema_path: &Path,
        bucket: &str,
        keys: &[String],
    ) -> Result<Vec<PathBuf>> {
        let mut zonemaps = Vec::with_capacity(keys.len());
        for outcome in self.pull_detailed(format_spec, schema_path, bucket, keys)? {
            match outcome {
                KeyOutcome::Hit { zonemap, .. } | KeyOutcome::Converted { zonemap, .. } => {
                    zonemaps.push(zonemap)
                }
                KeyOutcome::Failed { key, error } => return Err(PoolError::for_key(key, error)),
            }
        }
        Ok(zonemaps)
    }

    /// Counters from [`PoolStats`] plus scheduler activity
    pub fn status(&self) -> Vec<(&'static str, u64)> {
        let mut status = self.stats.snapshot();
        let scheduler = self.scheduler.stats();
        status.push(("workers", self.scheduler.max_concurrency() as u64));
        status.push(("active", scheduler.active() as u64));
        status.push(("peak_active", scheduler.peak() as u64));
        status
    }
}
