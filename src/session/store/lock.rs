use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::SessionError;

/// A lock that is held across calls rather than by a guard.
#[derive(Debug, Default)]
struct SessionLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl SessionLock {
    fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut held = self.held.lock();
        while *held {
            match deadline {
                None => self.released.wait(&mut held),
                Some(deadline) => {
                    if self.released.wait_until(&mut held, deadline).timed_out() && *held {
                        return false;
                    }
                }
            }
        }
        *held = true;
        true
    }

    fn try_acquire(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_one();
    }

    fn is_held(&self) -> bool {
        *self.held.lock()
    }
}

/// Per-id locks, created on first use.
///
/// The table mutex only guards insertion and removal of entries; waiting for
/// a session lock happens outside it, so distinct ids never contend.
#[derive(Debug, Default)]
pub struct LockTable {
    table: Mutex<HashMap<String, Arc<SessionLock>>>,
}

impl LockTable {
    /// Empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<SessionLock> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(id.to_string()).or_default())
    }

    /// Block until the lock for `id` is held
    ///
    /// # Errors
    ///
    /// [`SessionError::LockTimeout`] when `timeout` elapses first.
    pub fn acquire(&self, id: &str, timeout: Option<Duration>) -> Result<(), SessionError> {
        let lock = self.entry(id);
        if lock.acquire(timeout) {
            Ok(())
        } else {
            Err(SessionError::LockTimeout { id: id.to_string() })
        }
    }

    /// Take the lock for `id` only if it is free
    pub fn try_acquire(&self, id: &str) -> bool {
        self.entry(id).try_acquire()
    }

    /// Release the lock for `id`
    pub fn release(&self, id: &str) {
        let lock = self.table.lock().get(id).map(Arc::clone);
        if let Some(lock) = lock {
            lock.release();
        }
    }

    /// Release the lock for `id` and drop its entry unless `keep` wants it.
    ///
    /// The entry survives while another thread holds or waits on it.
    pub fn release_and_prune(&self, id: &str, keep: impl FnOnce(&str) -> bool) {
        self.release(id);
        let mut table = self.table.lock();
        let idle = table
            .get(id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1 && !lock.is_held());
        if idle && !keep(id) {
            table.remove(id);
        }
    }

    /// Whether the lock for `id` is currently held
    #[must_use]
    pub fn is_locked(&self, id: &str) -> bool {
        self.table.lock().get(id).is_some_and(|l| l.is_held())
    }

    /// Drop entries that are free, unreferenced and not wanted by `keep`.
    /// Returns how many entries were removed.
    pub fn prune(&self, keep: impl Fn(&str) -> bool) -> usize {
        let mut table = self.table.lock();
        let before = table.len();
        // Under the table lock nobody can clone an entry, so a strong count
        // of one means no thread is waiting on or holding it.
        table.retain(|id, lock| keep(id) || Arc::strong_count(lock) > 1 || lock.is_held());
        before - table.len()
    }

    /// Number of lock entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    /// Whether the table has no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
