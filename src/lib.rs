//! objpool - Write-through Local Disk Cache for Remote Object Stores
//!
//! Keeps local copies of objects from S3, HDFS or a local mirror, and turns
//! CSV and parquet objects into a partitioned columnar format (with a
//! zonemap index) through an external converter.
//!
//! # Features
//!
//! - **Etag-validated caching**: every cached object carries a sidecar
//!   recording the remote etag it was fetched at; a pull only transfers
//!   when the catalog reports a different etag.
//!
//! - **Atomic placement**: downloads land in `tmp/` and are renamed into
//!   place, so readers never observe a partial object.
//!
//! - **Bounded parallelism**: keys of one pull run on a fixed worker pool,
//!   serialized per object by named locks.
//!
//! - **Failure isolation**: one key's failure never aborts its siblings.
//!
//! # Architecture
//!
//! ```text
//!        request line / CLI subcommand
//!                    │
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            Pool                                  │
//! │   ┌──────────┐   ┌──────────────┐   ┌──────────────────────┐    │
//! │   │ Catalog  │   │  NamedLock   │   │    JobScheduler      │    │
//! │   │ (etags)  │   │ "bucket:key" │   │ (crossbeam workers)  │    │
//! │   └────┬─────┘   └──────┬───────┘   └──────────┬───────────┘    │
//! │        │                │                      │                │
//! │        ▼                ▼                      ▼                │
//! │   ┌──────────────────────────┐      ┌──────────────────────┐    │
//! │   │       ObjectCache        │      │      Converter       │    │
//! │   │ data/BUCKET/KEY          │─────►│ xrgdiv → DEV/BUCKET/ │    │
//! │   │ data/BUCKET/KEY__meta__  │      │   DIR/STEM.zmp ...   │    │
//! │   └────────────┬─────────────┘      └──────────────────────┘    │
//! └────────────────┼────────────────────────────────────────────────┘
//!                  │ fetch / list
//!                  ▼
//!     ┌────────────────────────────────────────┐
//!     │  Backend: S3 | HDFS | HDFS 2.x | local │
//!     └────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Enumerate a bucket
//! objpool -D /var/pool -d /mnt/d1 --backend s3 refresh mybucket
//!
//! # Fetch and convert two objects
//! objpool -D /var/pool -d /mnt/d1 -d /mnt/d2 --backend s3 \
//!     pull --format '{"fmt":"csv"}' --schema schema.json mybucket a.csv b.csv
//!
//! # Serve JSON request lines on stdin
//! echo '["GLOB", "mybucket", "logs/*.csv"]' | objpool -D /var/pool -d /mnt/d1 --backend s3 exec
//! ```

pub mod backend;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod glob;
pub mod lock;
pub mod pool;
pub mod progress;
pub mod scheduler;
pub mod tool;

pub use backend::{Backend, BackendKind};
pub use config::{CliArgs, Command, PoolConfig};
pub use dispatch::{dispatch, Reply, Request};
pub use error::{KeyOutcome, PoolError, Result};
pub use pool::Pool;
