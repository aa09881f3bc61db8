//! # Session Module
//!
//! Per-request session façade over a [`SessionStore`].
//!
//! ## Lifecycle
//!
//! 1. **Resolve id**: a cookie-supplied id is kept only if the store still
//!    holds a live record for it. Unknown, expired or malformed ids are
//!    silently replaced with a fresh one. Fresh ids are 20 random bytes,
//!    base64url-encoded, regenerated until they do not collide with a stored
//!    session. 160 bits of randomness make the loop terminate in practice, so
//!    it has no retry cap.
//! 2. **Load**: data is read from the store on first access, at most once.
//! 3. **Lock**: depending on [`LockingPolicy`], the per-id lock is taken before
//!    the body is read (`early`), before the handler (`implicit`), or only when
//!    application code asks (`explicit`).
//! 4. **Save**: if the data was loaded, it is written back with
//!    `expiration = now + timeout`, which makes expiry sliding. The lock is
//!    released whether or not the save succeeded.
//!
//! A [`Session`] that still holds its lock when dropped releases it, so a
//! panic between lock and save cannot leave the id locked.

mod cookie;
pub mod store;
mod tool;

pub use cookie::{expired_cookie_header, http_date, set_cookie_header, CookieSettings};
pub use store::{SessionData, SessionRecord, SessionStore};
pub use tool::{expire, install, SessionManager, DEFAULT_CLEAN_FREQ};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::SessionError;

/// Random bytes per session id
pub const ID_BYTES: usize = 20;

/// Generate a fresh session id (base64url, no padding)
#[must_use]
pub fn generate_id() -> String {
    let mut bytes = [0_u8; ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Shortened id for log fields
fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

/// When the per-session lock is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockingPolicy {
    /// Just before the handler runs
    #[default]
    Implicit,
    /// Before the request body is read
    Early,
    /// Only via [`Session::acquire_lock`]
    Explicit,
}

impl LockingPolicy {
    /// Parse `implicit` / `early` / `explicit`
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "implicit" => Some(Self::Implicit),
            "early" => Some(Self::Early),
            "explicit" => Some(Self::Explicit),
            _ => None,
        }
    }
}

/// Session behaviour for one request, read from `tools.sessions.*`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Inactivity window before expiry
    pub timeout: chrono::Duration,
    /// Locking policy
    pub locking: LockingPolicy,
    /// Bound on waiting for the lock (`None` waits forever)
    pub lock_timeout: Option<Duration>,
    /// Cookie attributes
    pub cookie: CookieSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: chrono::Duration::minutes(60),
            locking: LockingPolicy::Implicit,
            lock_timeout: None,
            cookie: CookieSettings::default(),
        }
    }
}

impl SessionSettings {
    /// Read `tools.sessions.*` from the effective request config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let defaults = Self::default();
        let timeout_minutes: f64 = config.get_or("tools.sessions.timeout", 60.0);
        let locking = match config.get_opt::<String>("tools.sessions.locking") {
            Some(raw) => LockingPolicy::parse(&raw).unwrap_or_else(|| {
                warn!(locking = %raw, "Unknown tools.sessions.locking - using implicit");
                LockingPolicy::Implicit
            }),
            None => defaults.locking,
        };
        let lock_timeout = config
            .get_opt::<f64>("tools.sessions.lock_timeout")
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64);
        Self {
            timeout: minutes(timeout_minutes),
            locking,
            lock_timeout,
            cookie: CookieSettings::from_config(config),
        }
    }
}

/// Fractional minutes to a chrono duration
pub(crate) fn minutes(value: f64) -> chrono::Duration {
    let millis = (value.max(0.0) * 60_000.0).round();
    chrono::Duration::milliseconds(millis as i64)
}

/// One request's view of a client's durable session.
pub struct Session {
    id: String,
    original_id: Option<String>,
    missing: bool,
    regenerated: bool,
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
    data: SessionData,
    expiration: Option<DateTime<Utc>>,
    timestamp: DateTime<Utc>,
    loaded: bool,
    locked: bool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &short(&self.id))
            .field("store", &self.store.kind())
            .field("loaded", &self.loaded)
            .field("locked", &self.locked)
            .field("missing", &self.missing)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Resolve the session for a request.
    ///
    /// # Errors
    ///
    /// Store failures while checking ids. An unknown, expired or malformed
    /// `requested` id is not an error: a fresh id is issued instead.
    pub fn new(
        store: Arc<dyn SessionStore>,
        requested: Option<&str>,
        settings: SessionSettings,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            id: String::new(),
            original_id: requested.map(str::to_string),
            missing: false,
            regenerated: false,
            store,
            settings,
            data: SessionData::new(),
            expiration: None,
            timestamp: Utc::now(),
            loaded: false,
            locked: false,
        };

        let keep = match requested.filter(|id| !id.is_empty()) {
            Some(id) => match session.store.exists(id) {
                Ok(live) => live,
                Err(SessionError::InvalidId { .. }) => false,
                Err(e) => return Err(e),
            },
            None => false,
        };
        match requested {
            Some(id) if keep => session.id = id.to_string(),
            Some(id) => {
                debug!(session_id = %short(id), "Expired or unknown session id - issuing a new one");
                session.missing = true;
                session.regenerate_id()?;
            }
            None => session.regenerate_id()?,
        }
        Ok(session)
    }

    fn regenerate_id(&mut self) -> Result<(), SessionError> {
        loop {
            let candidate = generate_id();
            if !self.store.exists(&candidate)? {
                self.id = candidate;
                return Ok(());
            }
        }
    }

    /// Current session id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id the client presented, if any
    #[must_use]
    pub fn original_id(&self) -> Option<&str> {
        self.original_id.as_deref()
    }

    /// The client presented an id that was not (or no longer) valid
    #[must_use]
    pub fn missing(&self) -> bool {
        self.missing
    }

    /// [`Session::regenerate`] was called during this request
    #[must_use]
    pub fn regenerated(&self) -> bool {
        self.regenerated
    }

    /// Data has been read from the store
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// The per-id lock is held by this request
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Settings in force for this request
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// When this session object was created
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Expiration of the loaded record, if one was loaded
    #[must_use]
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Last time the record was saved (its expiration minus the timeout)
    #[must_use]
    pub fn last_access(&self) -> Option<DateTime<Utc>> {
        self.expiration.map(|e| e - self.settings.timeout)
    }

    /// Read the record from the store; no-op after the first call.
    ///
    /// # Errors
    ///
    /// Store I/O failures. Expired or missing records load as empty data.
    pub fn load(&mut self) -> Result<(), SessionError> {
        if self.loaded {
            return Ok(());
        }
        match self.store.load(&self.id)? {
            Some(record) if !record.is_expired_at(Utc::now()) => {
                self.data = record.data;
                self.expiration = Some(record.expiration);
            }
            Some(_) => {
                debug!(session_id = %short(&self.id), "Expired session - flushing data");
                self.data.clear();
            }
            None => self.data.clear(),
        }
        self.loaded = true;
        Ok(())
    }

    /// Mutable access to the whole data map (loads first)
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn data(&mut self) -> Result<&mut SessionData, SessionError> {
        self.load()?;
        Ok(&mut self.data)
    }

    /// Run `f` against the data map (loads first)
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn with_data<R>(&mut self, f: impl FnOnce(&mut SessionData) -> R) -> Result<R, SessionError> {
        Ok(f(self.data()?))
    }

    /// Value under `key`
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn get(&mut self, key: &str) -> Result<Option<&Value>, SessionError> {
        self.load()?;
        Ok(self.data.get(key))
    }

    /// Value under `key`, deserialized
    ///
    /// # Errors
    ///
    /// Load failures, or a stored value that is not a `T`.
    pub fn get_as<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, SessionError> {
        self.load()?;
        match self.data.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Store `value` under `key`, returning the previous value
    ///
    /// # Errors
    ///
    /// Load failures, or a value that cannot be represented as JSON.
    pub fn insert(&mut self, key: &str, value: impl Serialize) -> Result<Option<Value>, SessionError> {
        let value = serde_json::to_value(value)?;
        self.load()?;
        Ok(self.data.insert(key.to_string(), value))
    }

    /// Remove `key`
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, SessionError> {
        self.load()?;
        Ok(self.data.remove(key))
    }

    /// Whether `key` is set
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn contains_key(&mut self, key: &str) -> Result<bool, SessionError> {
        self.load()?;
        Ok(self.data.contains_key(key))
    }

    /// All keys
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn keys(&mut self) -> Result<Vec<String>, SessionError> {
        self.load()?;
        Ok(self.data.keys().cloned().collect())
    }

    /// Number of keys
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn len(&mut self) -> Result<usize, SessionError> {
        self.load()?;
        Ok(self.data.len())
    }

    /// Whether no keys are set
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn is_empty(&mut self) -> Result<bool, SessionError> {
        Ok(self.len()? == 0)
    }

    /// Remove every key (the record itself survives until saved)
    ///
    /// # Errors
    ///
    /// See [`Session::load`].
    pub fn clear(&mut self) -> Result<(), SessionError> {
        self.load()?;
        self.data.clear();
        Ok(())
    }

    /// Take the per-id lock (no-op if already held)
    ///
    /// # Errors
    ///
    /// [`SessionError::LockTimeout`] if `lock_timeout` elapses.
    pub fn acquire_lock(&mut self) -> Result<(), SessionError> {
        if self.locked {
            return Ok(());
        }
        let started = Instant::now();
        self.store.acquire_lock(&self.id, self.settings.lock_timeout)?;
        self.locked = true;
        debug!(
            session_id = %short(&self.id),
            wait_ms = started.elapsed().as_millis() as u64,
            "Session lock acquired"
        );
        Ok(())
    }

    /// Release the per-id lock (no-op if not held)
    ///
    /// # Errors
    ///
    /// Store failures releasing the lock.
    pub fn release_lock(&mut self) -> Result<(), SessionError> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        self.store.release_lock(&self.id)?;
        debug!(session_id = %short(&self.id), "Session lock released");
        Ok(())
    }

    /// Persist loaded data with a refreshed expiration, then release the lock.
    ///
    /// # Errors
    ///
    /// Store write failures (reported after the lock has been released).
    pub fn save(&mut self) -> Result<(), SessionError> {
        let saved = if self.loaded {
            let expiration = Utc::now() + self.settings.timeout;
            let record = SessionRecord {
                data: self.data.clone(),
                expiration,
            };
            let result = self.store.save(&self.id, &record);
            if result.is_ok() {
                self.expiration = Some(expiration);
            }
            result
        } else {
            Ok(())
        };
        let released = self.release_lock();
        saved.and(released)
    }

    /// Remove the durable record. The data is dropped too, so the end-of-request
    /// save does not bring it back.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn delete(&mut self) -> Result<(), SessionError> {
        self.store.delete(&self.id)?;
        self.data.clear();
        self.loaded = false;
        Ok(())
    }

    /// Move the data to a fresh id and delete the old record.
    ///
    /// Call after a privilege change (login) so an id planted before the
    /// change is worthless afterwards.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn regenerate(&mut self) -> Result<(), SessionError> {
        self.load()?;
        self.store.delete(&self.id)?;
        let was_locked = self.locked;
        self.release_lock()?;
        let old = std::mem::take(&mut self.id);
        self.regenerate_id()?;
        self.regenerated = true;
        debug!(old = %short(&old), new = %short(&self.id), "Session id regenerated");
        if was_locked {
            self.acquire_lock()?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.release_lock() {
                warn!(session_id = %short(&self.id), error = %e, "Failed to release session lock on drop");
            }
        }
    }
}
