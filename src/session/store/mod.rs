//! # Session Store Module
//!
//! Durable session state behind one trait with three backends:
//!
//! - [`MemoryStore`]: process-local map, lost on restart
//! - [`FileStore`]: one JSON file per session plus a `.lock` companion file
//! - [`CacheStore`]: a memcached-style cache reached through a [`CacheClient`]
//!
//! Every backend provides per-id mutual exclusion through
//! [`SessionStore::acquire_lock`] / [`SessionStore::release_lock`]. Locks are
//! advisory: the [`Session`](crate::session::Session) façade takes them
//! according to the configured locking policy.

mod cache;
mod file;
mod lock;
mod memory;

pub use cache::{CacheClient, CacheStore, InMemoryCache, MemcachedClient, MAX_KEY_LEN};
pub use file::{FileStore, LOCK_SUFFIX, SESSION_PREFIX};
pub use lock::LockTable;
pub use memory::MemoryStore;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::SessionError;

/// Session payload: string keys to arbitrary JSON values.
pub type SessionData = Map<String, Value>;

/// What a store keeps per session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Application data
    pub data: SessionData,
    /// Absolute expiry instant
    pub expiration: DateTime<Utc>,
}

impl SessionRecord {
    /// Whether the record has expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }
}

/// Pluggable session persistence.
pub trait SessionStore: Send + Sync + fmt::Debug {
    /// Short backend name for logs (`ram`, `file`, `memcached`)
    fn kind(&self) -> &'static str;

    /// Whether a live (unexpired) record exists for `id`
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidId`] if the backend cannot represent `id`,
    /// otherwise backend I/O failures.
    fn exists(&self, id: &str) -> Result<bool, SessionError>;

    /// Load the record for `id`, expired or not
    ///
    /// # Errors
    ///
    /// Backend I/O failures. A missing or unreadable record is `Ok(None)`.
    fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionError>;

    /// Persist `record` under `id`
    ///
    /// # Errors
    ///
    /// Backend I/O failures or a record the backend refused.
    fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionError>;

    /// Remove the record for `id` (absent records are not an error)
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    fn delete(&self, id: &str) -> Result<(), SessionError>;

    /// Block until this caller holds the lock for `id`
    ///
    /// # Errors
    ///
    /// [`SessionError::LockTimeout`] when `timeout` elapses first.
    fn acquire_lock(&self, id: &str, timeout: Option<Duration>) -> Result<(), SessionError>;

    /// Release a lock taken with [`SessionStore::acquire_lock`]
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    fn release_lock(&self, id: &str) -> Result<(), SessionError>;

    /// Delete expired records; returns how many were removed
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    fn clean_up(&self) -> Result<usize, SessionError>;

    /// Number of records currently stored
    ///
    /// # Errors
    ///
    /// Backend I/O failures.
    fn count(&self) -> Result<usize, SessionError>;
}

/// Build the store selected by `tools.sessions.storage_type` in `root`.
///
/// # Errors
///
/// Fails for an unknown storage type, a file store without
/// `tools.sessions.storage_path`, or a memcached store without servers.
pub fn from_config(root: &Config) -> Result<Arc<dyn SessionStore>> {
    let storage: String = root.get_or("tools.sessions.storage_type", "ram".to_string());
    match storage.trim().to_lowercase().as_str() {
        "ram" | "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => {
            let path: String = root
                .get_opt("tools.sessions.storage_path")
                .ok_or_else(|| anyhow!("tools.sessions.storage_path is required for file sessions"))?;
            Ok(Arc::new(FileStore::new(path)?))
        }
        "memcached" => {
            let servers: Vec<String> = root.get_or(
                "tools.sessions.servers",
                vec!["127.0.0.1:11211".to_string()],
            );
            if servers.is_empty() {
                return Err(anyhow!("tools.sessions.servers must name at least one server"));
            }
            Ok(Arc::new(CacheStore::new(MemcachedClient::new(servers))))
        }
        other => Err(anyhow!(
            "unknown tools.sessions.storage_type '{other}' (expected ram, file or memcached)"
        )),
    }
}
