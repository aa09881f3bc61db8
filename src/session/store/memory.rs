use chrono::Utc;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use super::{LockTable, SessionRecord, SessionStore};
use crate::error::SessionError;

/// In-process session store.
///
/// Records live in a sharded map; each id gets its own lock on first use.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, SessionRecord>,
    locks: LockTable,
}

impl MemoryStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of per-id lock objects still allocated
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

impl SessionStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "ram"
    }

    fn exists(&self, id: &str) -> Result<bool, SessionError> {
        let now = Utc::now();
        Ok(self
            .records
            .get(id)
            .is_some_and(|r| !r.is_expired_at(now)))
    }

    fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionError> {
        self.records.insert(id.to_string(), record.clone());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), SessionError> {
        self.records.remove(id);
        Ok(())
    }

    fn acquire_lock(&self, id: &str, timeout: Option<Duration>) -> Result<(), SessionError> {
        self.locks.acquire(id, timeout)
    }

    fn release_lock(&self, id: &str) -> Result<(), SessionError> {
        self.locks.release_and_prune(id, |id| self.records.contains_key(id));
        Ok(())
    }

    fn clean_up(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.value().is_expired_at(now))
            .map(|r| r.key().clone())
            .collect();

        let mut removed = 0;
        for id in expired {
            // A request holding the lock will save a fresh expiration
            if !self.locks.try_acquire(&id) {
                continue;
            }
            if self
                .records
                .remove_if(&id, |_, r| r.is_expired_at(now))
                .is_some()
            {
                removed += 1;
            }
            self.locks.release(&id);
        }

        let pruned = self.locks.prune(|id| self.records.contains_key(id));
        debug!(removed, pruned_locks = pruned, "Memory session cleanup");
        Ok(removed)
    }

    fn count(&self) -> Result<usize, SessionError> {
        Ok(self.records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn record(offset_secs: i64) -> SessionRecord {
        let mut data = super::super::SessionData::new();
        data.insert("k".to_string(), json!(1));
        SessionRecord {
            data,
            expiration: Utc::now() + ChronoDuration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_exists_respects_expiration() {
        let store = MemoryStore::new();
        store.save("live", &record(60)).unwrap();
        store.save("dead", &record(-1)).unwrap();
        assert!(store.exists("live").unwrap());
        assert!(!store.exists("dead").unwrap());
        assert!(!store.exists("never").unwrap());
        // load still returns expired records; the session decides
        assert!(store.load("dead").unwrap().is_some());
    }

    #[test]
    fn test_clean_up_removes_expired_and_obsolete_locks() {
        let store = MemoryStore::new();
        store.save("live", &record(60)).unwrap();
        store.save("dead", &record(-1)).unwrap();
        store.acquire_lock("dead", None).unwrap();
        store.release_lock("dead").unwrap();
        store.acquire_lock("gone", None).unwrap();
        store.release_lock("gone").unwrap();

        assert_eq!(store.clean_up().unwrap(), 1);
        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(store.lock_count(), 0);
    }

    #[test]
    fn test_lock_for_unsaved_id_is_dropped_on_release() {
        let store = MemoryStore::new();
        store.acquire_lock("never-saved", None).unwrap();
        assert_eq!(store.lock_count(), 1);
        store.release_lock("never-saved").unwrap();
        assert_eq!(store.lock_count(), 0);

        store.save("saved", &record(60)).unwrap();
        store.acquire_lock("saved", None).unwrap();
        store.release_lock("saved").unwrap();
        assert_eq!(store.lock_count(), 1);
    }

    #[test]
    fn test_clean_up_skips_locked_sessions() {
        let store = MemoryStore::new();
        store.save("busy", &record(-1)).unwrap();
        store.acquire_lock("busy", None).unwrap();
        assert_eq!(store.clean_up().unwrap(), 0);
        assert_eq!(store.count().unwrap(), 1);
        store.release_lock("busy").unwrap();
        assert_eq!(store.clean_up().unwrap(), 1);
    }
}
