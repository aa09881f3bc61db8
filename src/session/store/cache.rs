use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{LockTable, SessionRecord, SessionStore};
use crate::error::SessionError;

/// Longest key a memcached server accepts
pub const MAX_KEY_LEN: usize = 250;

/// Largest value the client will buffer; memcached's default item limit
pub const MAX_VALUE_LEN: usize = 1024 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Minimal byte-keyed cache protocol.
///
/// Implementations need not be thread-safe: [`CacheStore`] serializes every
/// call through one mutex.
pub trait CacheClient: Send {
    /// Fetch the value under `key`
    ///
    /// # Errors
    ///
    /// Transport or protocol failures.
    fn get(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;

    /// Store `value` until the absolute Unix time `expires_at`.
    /// Returns `false` if the server declined to store it.
    ///
    /// # Errors
    ///
    /// Transport or protocol failures.
    fn set(&mut self, key: &[u8], value: &[u8], expires_at: i64) -> io::Result<bool>;

    /// Remove `key`; returns whether it existed
    ///
    /// # Errors
    ///
    /// Transport or protocol failures.
    fn delete(&mut self, key: &[u8]) -> io::Result<bool>;
}

/// Session store on top of a memcached-style cache.
///
/// The cache expires entries itself, so [`SessionStore::clean_up`] is a no-op.
/// Per-session locks are process-local.
pub struct CacheStore {
    client: Mutex<Box<dyn CacheClient>>,
    locks: LockTable,
}

impl fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl CacheStore {
    /// Wrap a cache client
    pub fn new(client: impl CacheClient + 'static) -> Self {
        Self {
            client: Mutex::new(Box::new(client)),
            locks: LockTable::new(),
        }
    }

    /// Validate `id` as a cache key
    fn key(id: &str) -> Result<&[u8], SessionError> {
        let bytes = id.as_bytes();
        if bytes.is_empty()
            || bytes.len() > MAX_KEY_LEN
            || bytes.iter().any(|b| b.is_ascii_whitespace() || b.is_ascii_control())
        {
            return Err(SessionError::InvalidId { id: id.to_string() });
        }
        Ok(bytes)
    }
}

impl SessionStore for CacheStore {
    fn kind(&self) -> &'static str {
        "memcached"
    }

    fn exists(&self, id: &str) -> Result<bool, SessionError> {
        let now = Utc::now();
        Ok(self.load(id)?.is_some_and(|r| !r.is_expired_at(now)))
    }

    fn load(&self, id: &str) -> Result<Option<SessionRecord>, SessionError> {
        let key = Self::key(id)?;
        let Some(bytes) = self.client.lock().get(key)? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(error = %e, "Unreadable cached session - treating as absent");
                Ok(None)
            }
        }
    }

    fn save(&self, id: &str, record: &SessionRecord) -> Result<(), SessionError> {
        let key = Self::key(id)?;
        let payload = serde_json::to_vec(record)?;
        let stored = self
            .client
            .lock()
            .set(key, &payload, record.expiration.timestamp())?;
        if stored {
            Ok(())
        } else {
            Err(SessionError::NotStored { id: id.to_string() })
        }
    }

    fn delete(&self, id: &str) -> Result<(), SessionError> {
        let key = Self::key(id)?;
        self.client.lock().delete(key)?;
        Ok(())
    }

    fn acquire_lock(&self, id: &str, timeout: Option<Duration>) -> Result<(), SessionError> {
        self.locks.acquire(id, timeout)
    }

    fn release_lock(&self, id: &str) -> Result<(), SessionError> {
        self.locks.release(id);
        Ok(())
    }

    fn clean_up(&self) -> Result<usize, SessionError> {
        let pruned = self.locks.prune(|_| false);
        debug!(pruned_locks = pruned, "Cache session cleanup (entries expire server-side)");
        Ok(0)
    }

    fn count(&self) -> Result<usize, SessionError> {
        Err(SessionError::Storage(io::Error::new(
            io::ErrorKind::Unsupported,
            "memcached cannot enumerate keys",
        )))
    }
}

/// Process-local [`CacheClient`] with the same absolute-expiry semantics as
/// memcached. Useful for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: HashMap<Vec<u8>, (Vec<u8>, i64)>,
}

impl InMemoryCache {
    /// Empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheClient for InMemoryCache {
    fn get(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let now = Utc::now().timestamp();
        match self.entries.get(key) {
            Some((_, expires_at)) if *expires_at <= now => {
                self.entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8], expires_at: i64) -> io::Result<bool> {
        self.entries
            .insert(key.to_vec(), (value.to_vec(), expires_at));
        Ok(true)
    }

    fn delete(&mut self, key: &[u8]) -> io::Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }
}

/// memcached text-protocol client (`get`, `set`, `delete`).
///
/// Keys are spread over the configured servers by hash. Connections open on
/// first use and are dropped after any I/O error so the next call reconnects.
pub struct MemcachedClient {
    servers: Vec<String>,
    conns: Vec<Option<BufReader<TcpStream>>>,
}

impl fmt::Debug for MemcachedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemcachedClient")
            .field("servers", &self.servers)
            .finish_non_exhaustive()
    }
}

impl MemcachedClient {
    /// Client for `host:port` servers; nothing connects until first use
    #[must_use]
    pub fn new(servers: Vec<String>) -> Self {
        let conns = servers.iter().map(|_| None).collect();
        Self { servers, conns }
    }

    fn server_for(&self, key: &[u8]) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.servers.len().max(1) as u64) as usize
    }

    fn conn(&mut self, idx: usize) -> io::Result<&mut BufReader<TcpStream>> {
        if self.conns[idx].is_none() {
            let stream = TcpStream::connect(&self.servers[idx])?;
            stream.set_read_timeout(Some(IO_TIMEOUT))?;
            stream.set_write_timeout(Some(IO_TIMEOUT))?;
            stream.set_nodelay(true)?;
            debug!(server = %self.servers[idx], "Connected to memcached");
            self.conns[idx] = Some(BufReader::new(stream));
        }
        self.conns[idx]
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "memcached connection lost"))
    }

    /// Run `op` on the connection for `key`, dropping the connection on error
    fn with_conn<T>(
        &mut self,
        key: &[u8],
        op: impl FnOnce(&mut BufReader<TcpStream>) -> io::Result<T>,
    ) -> io::Result<T> {
        if self.servers.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no memcached servers"));
        }
        let idx = self.server_for(key);
        let result = self.conn(idx).and_then(op);
        if result.is_err() {
            self.conns[idx] = None;
        }
        result
    }
}

fn read_line(conn: &mut BufReader<TcpStream>) -> io::Result<String> {
    let mut line = String::new();
    if conn.read_line(&mut line)? == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "memcached closed the connection"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn protocol_error(line: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected memcached reply: {line}"))
}

impl CacheClient for MemcachedClient {
    fn get(&mut self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        self.with_conn(key, |conn| {
            let stream = conn.get_mut();
            stream.write_all(b"get ")?;
            stream.write_all(key)?;
            stream.write_all(b"\r\n")?;

            let header = read_line(conn)?;
            if header == "END" {
                return Ok(None);
            }
            // VALUE <key> <flags> <bytes>
            let len: usize = header
                .strip_prefix("VALUE ")
                .and_then(|rest| rest.split_whitespace().nth(2))
                .and_then(|n| n.parse().ok())
                .filter(|&n| n <= MAX_VALUE_LEN)
                .ok_or_else(|| protocol_error(&header))?;
            let mut data = vec![0_u8; len + 2];
            conn.read_exact(&mut data)?;
            data.truncate(len);
            let end = read_line(conn)?;
            if end != "END" {
                return Err(protocol_error(&end));
            }
            Ok(Some(data))
        })
    }

    fn set(&mut self, key: &[u8], value: &[u8], expires_at: i64) -> io::Result<bool> {
        self.with_conn(key, |conn| {
            let stream = conn.get_mut();
            stream.write_all(b"set ")?;
            stream.write_all(key)?;
            stream.write_all(format!(" 0 {} {}\r\n", expires_at.max(0), value.len()).as_bytes())?;
            stream.write_all(value)?;
            stream.write_all(b"\r\n")?;
            match read_line(conn)?.as_str() {
                "STORED" => Ok(true),
                "NOT_STORED" => Ok(false),
                other => Err(protocol_error(other)),
            }
        })
    }

    fn delete(&mut self, key: &[u8]) -> io::Result<bool> {
        self.with_conn(key, |conn| {
            let stream = conn.get_mut();
            stream.write_all(b"delete ")?;
            stream.write_all(key)?;
            stream.write_all(b"\r\n")?;
            match read_line(conn)?.as_str() {
                "DELETED" => Ok(true),
                "NOT_FOUND" => Ok(false),
                other => Err(protocol_error(other)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::net::TcpListener;
    use std::thread;

    fn record(offset_secs: i64) -> SessionRecord {
        let mut data = super::super::SessionData::new();
        data.insert("n".to_string(), json!(1));
        SessionRecord {
            data,
            expiration: Utc::now() + ChronoDuration::seconds(offset_secs),
        }
    }

    #[test]
    fn test_key_validation() {
        let store = CacheStore::new(InMemoryCache::new());
        assert!(matches!(store.load("has space"), Err(SessionError::InvalidId { .. })));
        assert!(matches!(store.load("ctl\u{7}"), Err(SessionError::InvalidId { .. })));
        let long = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(store.load(&long), Err(SessionError::InvalidId { .. })));
        assert!(store.load(&"x".repeat(MAX_KEY_LEN)).unwrap().is_none());
    }

    #[test]
    fn test_absolute_expiry_in_memory_cache() {
        let store = CacheStore::new(InMemoryCache::new());
        store.save("live", &record(60)).unwrap();
        store.save("dead", &record(-1)).unwrap();
        assert!(store.exists("live").unwrap());
        assert!(!store.exists("dead").unwrap());
        assert!(store.load("dead").unwrap().is_none());
        assert_eq!(store.clean_up().unwrap(), 0);
    }

    /// Serve one scripted memcached conversation and record what the client sent
    fn fake_server(replies: Vec<&'static [u8]>) -> (String, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            let mut received = Vec::new();
            for reply in replies {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line.starts_with("set ") {
                    reader.read_line(&mut line).unwrap();
                }
                received.extend_from_slice(line.as_bytes());
                writer.write_all(reply).unwrap();
            }
            received
        });
        (addr, handle)
    }

    #[test]
    fn test_memcached_text_protocol() {
        let (addr, server) = fake_server(vec![
            b"STORED\r\n",
            b"VALUE abc 0 5\r\nhello\r\nEND\r\n",
            b"DELETED\r\n",
            b"END\r\n",
        ]);
        let mut client = MemcachedClient::new(vec![addr]);
        assert!(client.set(b"abc", b"hello", 1_900_000_000).unwrap());
        assert_eq!(client.get(b"abc").unwrap(), Some(b"hello".to_vec()));
        assert!(client.delete(b"abc").unwrap());
        assert_eq!(client.get(b"abc").unwrap(), None);
        let sent = String::from_utf8(server.join().unwrap()).unwrap();
        assert!(sent.starts_with("set abc 0 1900000000 5\r\nhello\r\n"));
        assert!(sent.contains("get abc\r\n"));
        assert!(sent.contains("delete abc\r\n"));
    }

    #[test]
    fn test_not_stored_is_an_error() {
        let (addr, _server) = fake_server(vec![b"NOT_STORED\r\n"]);
        let store = CacheStore::new(MemcachedClient::new(vec![addr]));
        let err = store.save("abc", &record(60)).unwrap_err();
        assert!(matches!(err, SessionError::NotStored { .. }));
    }

    #[test]
    fn test_oversized_value_header_is_rejected() {
        let (addr, server) = fake_server(vec![b"VALUE abc 0 99999999999\r\n"]);
        let mut client = MemcachedClient::new(vec![addr]);
        let err = client.get(b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(client.conns[0].is_none());
        server.join().unwrap();
    }
}
