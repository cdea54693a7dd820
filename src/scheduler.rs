//! Bounded-concurrency job scheduler
//!
//! A fixed pool of worker threads drains a shared job channel, so at most
//! `max_concurrency` jobs run at any instant and excess submissions queue
//! until a worker frees up.
//!
//! ```text
//!   submit() ──► ┌──────────────────┐ ──► Worker 1 ─┐
//!   submit() ──► │   Job channel    │ ──► Worker 2 ─┼──► Batch::wait()
//!   submit() ──► │ (crossbeam, FIFO)│ ──► Worker N ─┘
//!                └──────────────────┘
//! ```
//!
//! Jobs are grouped into a [`Batch`]; [`Batch::wait`] blocks until every
//! job submitted through that batch has finished. The scheduler does not
//! interpret job outcomes: a job that fails or panics only affects itself.

use crate::error::WorkerError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Unit of work
type Job = Box<dyn FnOnce() + Send + 'static>;

/// Statistics for the scheduler
#[derive(Debug, Default)]
pub struct SchedulerStats {
    /// Total jobs submitted
    pub submitted: AtomicU64,

    /// Total jobs finished (including panicked)
    pub completed: AtomicU64,

    /// Jobs that panicked
    pub panicked: AtomicU64,

    /// Jobs running right now
    pub active: AtomicUsize,

    /// Highest number of simultaneously running jobs
    pub peak_active: AtomicUsize,
}

impl SchedulerStats {
    /// Jobs running right now
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest observed concurrency
    pub fn peak(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    /// Jobs finished so far
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    fn begin(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(now, Ordering::SeqCst);
    }

    fn end(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fixed-size worker pool
pub struct JobScheduler {
    /// Job channel; `None` once shutdown has begun
    sender: Option<Sender<Job>>,

    /// Worker threads
    workers: Vec<JoinHandle<()>>,

    /// Shared statistics
    stats: Arc<SchedulerStats>,
}

impl JobScheduler {
    /// Spawn `max_concurrency` worker threads
    pub fn new(max_concurrency: usize) -> Result<Self, WorkerError> {
        let max_concurrency = max_concurrency.max(1);
        let (sender, receiver) = unbounded::<Job>();
        let stats = Arc::new(SchedulerStats::default());

        let mut workers = Vec::with_capacity(max_concurrency);
        for id in 0..max_concurrency {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pull-{}", id))
                .spawn(move || worker_loop(id, receiver))
                .map_err(|e| WorkerError::InitFailed {
                    id,
                    reason: e.to_string(),
                })?;
            workers.push(handle);
        }

        debug!(workers = workers.len(), "Scheduler started");

        Ok(Self {
            sender: Some(sender),
            workers,
            stats,
        })
    }

    /// Number of worker threads
    pub fn max_concurrency(&self) -> usize {
        self.workers.len()
    }

    /// Shared statistics
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Start a new batch of jobs
    pub fn batch(&self) -> Batch<'_> {
        Batch {
            scheduler: self,
            pending: Arc::new(Pending::default()),
        }
    }

    /// Run `f` over every input and return the results in input order
    ///
    /// Each job owns the result cell for its index; the cells are only read
    /// after every job has finished. A panicking job yields
    /// [`WorkerError::MissingResult`] for its own index.
    pub fn map<T, R, F>(&self, inputs: Vec<T>, f: F) -> Result<Vec<Result<R, WorkerError>>, WorkerError>
    where
        T: Send + 'static,
        R: Send + Sync + 'static,
        F: Fn(usize, T) -> R + Send + Sync + 'static,
    {
        let cells: Arc<Vec<OnceLock<R>>> =
            Arc::new((0..inputs.len()).map(|_| OnceLock::new()).collect());
        let f = Arc::new(f);

        let batch = self.batch();
        for (index, input) in inputs.into_iter().enumerate() {
            let cells = Arc::clone(&cells);
            let f = Arc::clone(&f);
            batch.submit(move || {
                let _ = cells[index].set(f(index, input));
            })?;
        }
        batch.wait();

        // All jobs are done; the clones held by closures have been dropped
        let cells = Arc::try_unwrap(cells).map_err(|_| WorkerError::Panicked {
            message: "result cells still shared after batch".into(),
        })?;
        Ok(cells
            .into_iter()
            .enumerate()
            .map(|(index, cell)| cell.into_inner().ok_or(WorkerError::MissingResult { index }))
            .collect())
    }

    fn submit_job(&self, job: Job) -> Result<(), WorkerError> {
        let sender = self.sender.as_ref().ok_or(WorkerError::QueueSendFailed)?;
        sender.send(job).map_err(|_| WorkerError::QueueSendFailed)?;
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        // Closing the channel lets workers drain remaining jobs and exit
        drop(self.sender.take());
        for worker in std::mem::take(&mut self.workers) {
            if worker.join().is_err() {
                warn!("Scheduler worker failed to join cleanly");
            }
        }
    }
}

/// Outstanding-job counter for one batch
#[derive(Default)]
struct Pending {
    count: Mutex<usize>,
    done: Condvar,
}

impl Pending {
    fn add(&self) {
        *self.count.lock() += 1;
    }

    fn finish(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.done.notify_all();
        }
    }

    fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.done.wait(&mut count);
        }
    }
}

/// Decrements the batch counter even if the job panics
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// A group of jobs that can be waited on together
pub struct Batch<'a> {
    scheduler: &'a JobScheduler,
    pending: Arc<Pending>,
}

impl Batch<'_> {
    /// Queue a job; it runs as soon as a worker is free
    pub fn submit<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.add();
        let guard = PendingGuard(Arc::clone(&self.pending));
        let stats = Arc::clone(&self.scheduler.stats);
        self.scheduler.submit_job(Box::new(move || {
            // Declared first so the batch count drops only after the stats settle
            let _guard = guard;
            run_tracked(&stats, job);
        }))
        // On failure the job was dropped along with its guard
    }

    /// Block until every job submitted through this batch has finished
    pub fn wait(self) {
        self.pending.wait();
    }
}

/// Main worker loop
fn worker_loop(id: usize, receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        job();
    }
    debug!(worker = id, "Worker shutting down");
}

/// Run one job with its panic contained and counted
fn run_tracked<F: FnOnce()>(stats: &SchedulerStats, job: F) {
    stats.begin();
    let result = panic::catch_unwind(AssertUnwindSafe(job));
    if let Err(payload) = result {
        stats.panicked.fetch_add(1, Ordering::Relaxed);
        let worker = thread::current().name().unwrap_or("pull").to_string();
        warn!(worker = %worker, message = %panic_message(&payload), "Job panicked");
    }
    stats.end();
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
