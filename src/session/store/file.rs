use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{SessionRecord, SessionStore};
use crate::error::SessionError;

/// File name prefix for session records
pub const SESSION_PREFIX: &str = "session-";
/// File name suffix for lock files
pub const LOCK_SUFFIX: &str = ".lock";
const TEMP_SUFFIX: &str = ".tmp";
const LOCK_POLL: Duration = Duration::from_millis(100);

/// One JSON file per session under a storage directory.
///
/// Mutual exclusion uses a companion `<record>.lock` file created with
/// create-exclusive semantics, so it also holds across processes sharing the
/// directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Use (and create if needed) `dir` as the storage directory
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or resolved.
    pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.canonicalize()?,
        })
    }

    /// The resolved storage directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the record file for `id`, refusing anything that would land
    /// outside the storage directory.
    fn record_path(&self, id: &str) -> Result<PathBuf, SessionError> {
        let invalid = || SessionError::InvalidId { id: id.to_string() };
        if id.is_empty() || id.contains(['/', '\\', '\0']) {
            return Err(invalid());
        }
        let path = self.dir.join(format!("{SESSION_PREFIX}{id}"));
        let mut components = path.components();
        let inside = components.next_back().is_some_and(|c| matches!(c, Component::Normal(_)))
            && path.parent() == Some(self.dir.as_path())
            && path.starts_with(&self.dir)
            && path != self.dir;
        if inside {
            Ok(path)
        } else {
            Err(invalid())
        }
    }

    fn lock_path(&self, id: &str) -> Result<PathBuf, SessionError> {
        let mut path = self.record_path(id)?.into_os_string();
        path.push(LOCK_SUFFIX);
        Ok(PathBuf::from(path))
    }

    /// Caller holds the lock for `id`.
    fn remove_if_expired(&self, id: &str, now: DateTime<Utc>) -> Result<bool, SessionError> {
        match self.load(id)? {
            Some(record) if !record.is_expired_at(now) => Ok(false),
            // Unreadable leftovers count as expired
            _ => {
                self.delete(id)?;
                Ok(true)
            }
        }
    }

    fn session_ids(&self) -> Result<Vec<String>, SessionError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(LOCK_SUFFIX) || name.ends_with(TEMP_SUFFIX) {
                continue;
            }
            if let Some(id) = name.strip_prefix(SESSION_PREFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

impl SessionStore for FileStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn exists(&self, id: &str) -> Result<bool, SessionError> {
        let now = Utc::now();
        Ok(self.load(id)?.is_some_and(|r| !r.is_expired_at(now)))
    }

    fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.record_path(id)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable session file - treating as absent");
                Ok(None)
            }
        }
    }

    fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let path = self.record_path(id)?;
        let mut tmp = path.clone().into_os_string();
        tmp.push(TEMP_SUFFIX);
        let tmp = PathBuf::from(tmp);
        let payload = serde_json::to_vec(record)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<(), SessionError> {
        match fs::remove_file(self.record_path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn acquire_lock(&self, id: &str, timeout: Option<Duration>) -> Result<(), SessionError> {
        let path = self.lock_path(id)?;
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if timeout.is_some_and(|t| started.elapsed() >= t) {
                        return Err(SessionError::LockTimeout { id: id.to_string() });
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release_lock(&self, id: &str) -> Result<(), SessionError> {
        match fs::remove_file(self.lock_path(id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn clean_up(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut removed = 0;
        for id in self.session_ids()? {
            if self.record_path(&id).is_err() {
                continue;
            }
            self.acquire_lock(&id, None)?;
            let outcome = self.remove_if_expired(&id, now);
            let released = self.release_lock(&id);
            if outcome? {
                removed += 1;
            }
            released?;
        }
        debug!(dir = %self.dir.display(), removed, "File session cleanup");
        Ok(removed)
    }

    fn count(&self) -> Result<usize, SessionError> {
        Ok(self.session_ids()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn record(offset_secs: i64) -> SessionRecord {
        let mut data = super::super::SessionData::new();
        data.insert("n".to_string(), json!(3));
        SessionRecord {
            data,
            expiration: Utc::now() + ChronoDuration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_round_trip_and_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.save("abc", &record(60)).unwrap();
        assert!(store.dir().join("session-abc").exists());
        assert_eq!(store.load("abc").unwrap().unwrap().data["n"], json!(3));
        assert!(store.exists("abc").unwrap());
        store.delete("abc").unwrap();
        assert!(store.load("abc").unwrap().is_none());
        store.delete("abc").unwrap();
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        for id in ["../etc/passwd", "a/b", "..\\x", "", "x\0y"] {
            assert!(
                matches!(store.load(id), Err(SessionError::InvalidId { .. })),
                "{id:?} should be rejected"
            );
        }
        // dots alone stay inside the directory as part of the prefixed name
        assert!(store.load("..").unwrap().is_none());
    }

    #[test]
    fn test_lock_file_exclusion_and_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        store.acquire_lock("s", None).unwrap();
        assert!(store.dir().join("session-s.lock").exists());
        let err = store
            .acquire_lock("s", Some(Duration::from_millis(150)))
            .unwrap_err();
        assert!(matches!(err, SessionError::LockTimeout { .. }));
        store.release_lock("s").unwrap();
        store.acquire_lock("s", Some(Duration::ZERO)).unwrap();
        store.release_lock("s").unwrap();
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_corrupt_file_is_absent_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();
        fs::write(store.dir().join("session-bad"), b"not json").unwrap();
        assert!(store.load("bad").unwrap().is_none());
        store.save("live", &record(60)).unwrap();
        store.save("dead", &record(-5)).unwrap();
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.clean_up().unwrap(), 2);
        assert_eq!(store.count().unwrap(), 1);
        assert!(!store.dir().join("session-dead.lock").exists());
    }
}
