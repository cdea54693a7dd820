//! Named lock registry
//!
//! Serializes work on the same logical resource (a `bucket:key` pair, or a
//! bucket refresh) while letting distinct names proceed in parallel.
//!
//! Entries are reference counted and dropped from the registry as soon as
//! nobody holds or waits on them, so the registry does not grow with the
//! number of names ever seen. Waiters park on a `parking_lot` mutex, whose
//! eventual fairness keeps a contended name free of starvation.

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Registry slot: the per-name mutex and the number of holders + waiters
struct Slot {
    mutex: Arc<Mutex<()>>,
    refs: usize,
}

/// Registry of mutexes keyed by an arbitrary string
#[derive(Default)]
pub struct NamedLock {
    slots: Mutex<HashMap<String, Slot>>,
}

impl NamedLock {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock name for the fetch+convert critical section of one object
    pub fn object_name(bucket: &str, key: &str) -> String {
        format!("{}:{}", bucket, key)
    }

    /// Lock name for a full bucket enumeration
    pub fn refresh_name(bucket: &str) -> String {
        format!("refresh:{}", bucket)
    }

    /// Block until `name` is free, then hold it until the guard is dropped
    pub fn acquire(&self, name: &str) -> NamedLockGuard<'_> {
        let mutex = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
                mutex: Arc::new(Mutex::new(())),
                refs: 0,
            });
            slot.refs += 1;
            Arc::clone(&slot.mutex)
        };

        // Registry lock is released before parking on the name
        let guard = mutex.lock_arc();

        NamedLockGuard {
            registry: self,
            name: name.to_string(),
            guard: Some(guard),
        }
    }

    /// Try to take `name` without blocking
    pub fn try_acquire(&self, name: &str) -> Option<NamedLockGuard<'_>> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(name.to_string()).or_insert_with(|| Slot {
            mutex: Arc::new(Mutex::new(())),
            refs: 0,
        });
        let guard = slot.mutex.try_lock_arc()?;
        slot.refs += 1;

        Some(NamedLockGuard {
            registry: self,
            name: name.to_string(),
            guard: Some(guard),
        })
    }

    /// Number of names currently held or waited on
    pub fn active(&self) -> usize {
        self.slots.lock().len()
    }

    fn release_slot(&self, name: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get_mut(name) {
            slot.refs -= 1;
            if slot.refs == 0 {
                slots.remove(name);
            }
        }
    }
}

impl fmt::Debug for NamedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLock")
            .field("active", &self.active())
            .finish()
    }
}

/// Token for a held name; released exactly once, on drop or [`release`]
///
/// [`release`]: NamedLockGuard::release
#[must_use = "the name is released as soon as the guard is dropped"]
pub struct NamedLockGuard<'a> {
    registry: &'a NamedLock,
    name: String,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl NamedLockGuard<'_> {
    /// The locked name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the name explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for NamedLockGuard<'_> {
    fn drop(&mut self) {
        // Unlock first so a waiter can proceed, then drop our registry ref
        drop(self.guard.take());
        self.registry.release_slot(&self.name);
    }
}

impl fmt::Debug for NamedLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLockGuard")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_names() {
        assert_eq!(NamedLock::object_name("b", "dir/a.csv"), "b:dir/a.csv");
        assert_eq!(NamedLock::refresh_name("b"), "refresh:b");
    }

    #[test]
    fn test_mutual_exclusion() {
        let locks = Arc::new(NamedLock::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                let entered = Arc::clone(&entered);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = locks.acquire("b:k");
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);
                        entered.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(entered.load(Ordering::SeqCst), 16 * 20);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_distinct_names_do_not_contend() {
        let locks = NamedLock::new();
        let a = locks.acquire("b:a");
        let b = locks.try_acquire("b:b");
        assert!(b.is_some());
        assert!(locks.try_acquire("b:a").is_none());
        assert_eq!(locks.active(), 2);
        drop(a);
        drop(b);
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_release_wakes_waiter() {
        let locks = Arc::new(NamedLock::new());
        let guard = locks.acquire("refresh:b");

        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let g = locks.acquire("refresh:b");
                g.name().to_string()
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        guard.release();

        assert_eq!(waiter.join().unwrap(), "refresh:b");
        assert_eq!(locks.active(), 0);
    }

    #[test]
    fn test_released_on_panic() {
        let locks = Arc::new(NamedLock::new());
        let panicking = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let _g = locks.acquire("b:k");
                panic!("task failed");
            })
        };
        assert!(panicking.join().is_err());

        assert!(locks.try_acquire("b:k").is_some());
    }
}
