//! Catalog of remote version markers
//!
//! Maps `(bucket, key)` to the last-seen remote etag. A bucket's view is
//! only trustworthy after a full enumeration has been stored with
//! [`Catalog::store`]; single keys are then kept current by
//! [`Catalog::upsert`] after each successful fetch.
//!
//! Each bucket lives behind its own `Arc`, so a bulk replace swaps the whole
//! bucket in one step: readers see either the old set or the new set, never
//! a mix. Keys within a bucket sit in a sharded map so upserts on different
//! keys do not contend.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Entries for a single bucket
#[derive(Debug, Default)]
struct BucketEntries {
    /// key -> etag
    etags: DashMap<String, String>,

    /// Set when a full enumeration populated this bucket
    refreshed_at: Option<DateTime<Utc>>,
}

/// Process-wide `(bucket, key) -> etag` index
#[derive(Debug, Default)]
pub struct Catalog {
    buckets: RwLock<HashMap<String, Arc<BucketEntries>>>,
}

impl Catalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the etag for `(bucket, key)`
    ///
    /// Returns an empty string when the bucket or key is unknown.
    pub fn find(&self, bucket: &str, key: &str) -> String {
        let buckets = self.buckets.read();
        buckets
            .get(bucket)
            .and_then(|entries| entries.etags.get(key).map(|etag| etag.value().clone()))
            .unwrap_or_default()
    }

    /// Record the etag of a single key, last writer wins
    ///
    /// Upserting into a bucket that was never stored creates its entry map
    /// but does not mark the bucket as refreshed.
    pub fn upsert(&self, bucket: &str, key: &str, etag: &str) {
        {
            // The shared guard is held across the insert so a concurrent
            // store cannot swap the bucket out from under this write.
            let buckets = self.buckets.read();
            if let Some(entries) = buckets.get(bucket) {
                entries.etags.insert(key.to_string(), etag.to_string());
                return;
            }
        }

        let mut buckets = self.buckets.write();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .etags
            .insert(key.to_string(), etag.to_string());
    }

    /// Replace every entry of `bucket` with the given `(key, etag)` pairs
    pub fn store<I>(&self, bucket: &str, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let replacement = BucketEntries {
            etags: entries.into_iter().collect(),
            refreshed_at: Some(Utc::now()),
        };

        let mut buckets = self.buckets.write();
        buckets.insert(bucket.to_string(), Arc::new(replacement));
    }

    /// True once `bucket` has been populated by [`Catalog::store`]
    ///
    /// A bucket that was refreshed but is genuinely empty still exists.
    pub fn exists(&self, bucket: &str) -> bool {
        self.bucket(bucket)
            .is_some_and(|entries| entries.refreshed_at.is_some())
    }

    /// Number of keys known for `bucket`
    pub fn len(&self, bucket: &str) -> usize {
        self.bucket(bucket)
            .map(|entries| entries.etags.len())
            .unwrap_or(0)
    }

    /// Sorted keys of `bucket`, or `None` if it was never refreshed
    pub fn keys(&self, bucket: &str) -> Option<Vec<String>> {
        let entries = self.bucket(bucket)?;
        entries.refreshed_at?;
        let mut keys: Vec<String> = entries.etags.iter().map(|e| e.key().clone()).collect();
        keys.sort_unstable();
        Some(keys)
    }

    fn bucket(&self, bucket: &str) -> Option<Arc<BucketEntries>> {
        self.buckets.read().get(bucket).cloned()
    }
}
