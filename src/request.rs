//! # Request Module
//!
//! The transport contract and the per-request context.
//!
//! ## Transport contract
//!
//! A transport (see [`crate::server`]) hands the application a [`RawRequest`]:
//! method, raw path, query string, ordered headers and a readable body. It gets
//! back a [`RawResponse`]: a status line, ordered headers and a lazy [`Body`].
//!
//! ## Request context
//!
//! [`RequestContext`] is the explicit per-request state threaded through
//! dispatch, hooks and the handler: merged config, parsed params, cookies, the
//! session (when enabled) and the response being assembled. Nothing about the
//! current request lives in thread-local or global state.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io::{self, Read};

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::Config;
use crate::error::HttpError;
use crate::ids::RequestId;
use crate::session::Session;

/// Default cap on request bodies (100 MiB)
pub const DEFAULT_MAX_BODY_SIZE: u64 = 100 * 1024 * 1024;

/// Inbound request as supplied by the transport.
pub struct RawRequest {
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Raw request path, still percent-encoded, without the query string
    pub path: String,
    /// Raw query string (no leading `?`)
    pub query_string: String,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Request entity
    pub body: Box<dyn Read + Send>,
}

impl fmt::Debug for RawRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl RawRequest {
    /// Build a request from a method and a `path?query` target with no body
    #[must_use]
    pub fn new(method: &str, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, q),
            None => (target, ""),
        };
        Self {
            method: method.to_string(),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query_string: query.to_string(),
            headers: Vec::new(),
            body: Box::new(io::empty()),
        }
    }

    /// Append a header
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Attach an in-memory body
    #[must_use]
    pub fn with_body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Box::new(io::Cursor::new(bytes.into()));
        self
    }
}

/// Lazily produced response chunks. Finite and not restartable.
pub struct BodyStream(Box<dyn Iterator<Item = Vec<u8>> + Send>);

impl fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyStream(..)")
    }
}

impl Iterator for BodyStream {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

/// Response entity.
#[derive(Debug, Default)]
pub enum Body {
    /// No content
    #[default]
    Empty,
    /// Raw bytes
    Bytes(Vec<u8>),
    /// UTF-8 text (served as HTML unless a content type is set)
    Text(String),
    /// JSON document
    Json(Value),
    /// Chunks produced on demand while the transport writes
    Stream(BodyStream),
}

impl Body {
    /// Wrap an iterator of chunks as a streaming body
    pub fn stream<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
        I::IntoIter: Send + 'static,
    {
        Body::Stream(BodyStream(Box::new(chunks.into_iter())))
    }

    /// Drain the body into a single buffer.
    ///
    /// For [`Body::Stream`] this consumes every remaining chunk.
    #[must_use]
    pub fn collapse(self) -> Vec<u8> {
        match self {
            Body::Empty => Vec::new(),
            Body::Bytes(b) => b,
            Body::Text(s) => s.into_bytes(),
            Body::Json(v) => v.to_string().into_bytes(),
            Body::Stream(chunks) => chunks.flatten().collect(),
        }
    }

    /// Whether this body is produced lazily
    #[must_use]
    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// Content type implied by the variant, if any
    #[must_use]
    pub fn default_content_type(&self) -> Option<&'static str> {
        match self {
            Body::Text(_) => Some("text/html;charset=utf-8"),
            Body::Json(_) => Some("application/json"),
            _ => None,
        }
    }

    /// Turn the body into a chunk iterator for the transport
    #[must_use]
    pub fn into_chunks(self) -> Box<dyn Iterator<Item = Vec<u8>> + Send> {
        match self {
            Body::Stream(chunks) => chunks.0,
            other => {
                let bytes = other.collapse();
                if bytes.is_empty() {
                    Box::new(std::iter::empty())
                } else {
                    Box::new(std::iter::once(bytes))
                }
            }
        }
    }

    /// Adapt the body to [`Read`], pulling chunks as the reader is drained
    #[must_use]
    pub fn into_reader(self) -> ChunkReader {
        ChunkReader {
            chunks: self.into_chunks(),
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::Bytes(b)
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Body::Json(v)
    }
}

/// [`Read`] adapter over a chunk iterator.
pub struct ChunkReader {
    chunks: Box<dyn Iterator<Item = Vec<u8>> + Send>,
    current: Vec<u8>,
    offset: usize,
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            match self.chunks.next() {
                Some(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}

/// Anything that turns a [`RawRequest`] into a [`RawResponse`].
///
/// Implemented by [`crate::app::Application`] and by the engine's mounted
/// application tree; transports only ever see this trait.
pub trait RequestSource: Send + Sync {
    /// Produce the complete response; never fails (errors become 4xx/5xx)
    fn handle(&self, raw: RawRequest) -> RawResponse;
}

impl<F> RequestSource for F
where
    F: Fn(RawRequest) -> RawResponse + Send + Sync,
{
    fn handle(&self, raw: RawRequest) -> RawResponse {
        self(raw)
    }
}

/// Outbound response handed back to the transport.
#[derive(Debug)]
pub struct RawResponse {
    /// Status code
    pub status: u16,
    /// Headers in emission order (`Set-Cookie` may repeat)
    pub headers: Vec<(String, String)>,
    /// Entity
    pub body: Body,
}

impl RawResponse {
    /// Plain-text response with `Content-Type` and `Content-Length` set
    #[must_use]
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            status,
            headers: vec![
                ("Content-Type".to_string(), "text/plain;charset=utf-8".to_string()),
                ("Content-Length".to_string(), body.len().to_string()),
            ],
            body: Body::Text(body),
        }
    }

    /// `"200 OK"` style status line
    #[must_use]
    pub fn status_line(&self) -> String {
        let reason = http::StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown");
        format!("{} {}", self.status, reason)
    }

    /// First header value with this name (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All header values with this name (case-insensitive)
    #[must_use]
    pub fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

/// Handler keyword arguments with their origin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    values: Map<String, Value>,
    body_keys: BTreeSet<String>,
}

impl Params {
    /// Params parsed from a query string
    #[must_use]
    pub fn from_query(query: &str) -> Self {
        let mut params = Params::default();
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            params.add(k.into_owned(), Value::String(v.into_owned()), false);
        }
        params
    }

    /// Add one value; repeated names accumulate into an array. A name that
    /// appears in the body at least once counts as body-sourced.
    pub fn add(&mut self, key: String, value: Value, from_body: bool) {
        if from_body {
            self.body_keys.insert(key.clone());
        }
        match self.values.get_mut(&key) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.values.insert(key, value);
            }
        }
    }

    /// Look up a value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// All keyword values
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Names that came (at least partly) from the request body
    #[must_use]
    pub fn body_keys(&self) -> &BTreeSet<String> {
        &self.body_keys
    }

    /// Whether `key` came from the request body
    #[must_use]
    pub fn is_from_body(&self, key: &str) -> bool {
        self.body_keys.contains(key)
    }
}

/// Parse the `Cookie` header into name/value pairs.
#[must_use]
pub fn parse_cookies(headers: &[(String, String)]) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, v)| v.split(';'))
        .filter_map(|pair| {
            let mut parts = pair.trim().splitn(2, '=');
            let name = parts.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let value = parts.next().unwrap_or("").trim().trim_matches('"');
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

/// Response under construction.
#[derive(Debug, Default)]
pub struct ResponseParts {
    /// Status override (handlers set this for e.g. 201)
    pub status: Option<u16>,
    /// Extra headers, emitted in order
    pub headers: Vec<(String, String)>,
}

impl ResponseParts {
    /// Replace any header with this name
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
    }

    /// Append a header without replacing (for `Set-Cookie`)
    pub fn add_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), value.into()));
    }

    /// First header with this name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Explicit per-request state passed through dispatch, hooks and handlers.
pub struct RequestContext {
    /// Correlation id for logs
    pub request_id: RequestId,
    /// HTTP method
    pub method: http::Method,
    /// Path below the application mount point; percent-decoded except `%2F`
    pub path: String,
    /// Mount point of the application (`""` for the root app)
    pub script_name: String,
    /// Raw query string
    pub query_string: String,
    /// Request headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Cookies sent by the client
    pub cookies: HashMap<String, String>,
    /// Effective configuration merged along the dispatch trail
    pub config: Config,
    /// Query and body keyword arguments
    pub params: Params,
    /// Whether dispatch matched an index handler
    pub is_index: bool,
    /// Name of the matched handler, `None` when dispatch found nothing
    pub handler: Option<String>,
    /// Session façade (present when `tools.sessions.on`)
    pub session: Option<Session>,
    /// Response being assembled
    pub response: ResponseParts,
    body: Option<Box<dyn Read + Send>>,
    body_bytes: Option<Vec<u8>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("script_name", &self.script_name)
            .field("query_string", &self.query_string)
            .field("is_index", &self.is_index)
            .field("handler", &self.handler)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Build the context for a raw request whose path has already been decoded
    #[must_use]
    pub fn new(
        method: http::Method,
        path: String,
        script_name: String,
        raw: RawRequest,
    ) -> Self {
        let cookies = parse_cookies(&raw.headers);
        let params = Params::from_query(&raw.query_string);
        let request_id = RequestId::from_header_or_new(
            raw.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("x-request-id"))
                .map(|(_, v)| v.as_str()),
        );
        Self {
            request_id,
            method,
            path,
            script_name,
            query_string: raw.query_string,
            headers: raw.headers,
            cookies,
            config: Config::default(),
            params,
            is_index: false,
            handler: None,
            session: None,
            response: ResponseParts::default(),
            body: Some(raw.body),
            body_bytes: None,
        }
    }

    /// Header lookup (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Cookie lookup
    #[must_use]
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Raw entity bytes, once [`RequestContext::process_body`] has run
    #[must_use]
    pub fn body_bytes(&self) -> Option<&[u8]> {
        self.body_bytes.as_deref()
    }

    /// Full URL path including the mount point
    #[must_use]
    pub fn full_path(&self) -> String {
        format!("{}{}", self.script_name, self.path)
    }

    /// The session, or a 500 if sessions are not enabled for this path
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Internal`] when `tools.sessions.on` is false here.
    pub fn session(&mut self) -> Result<&mut Session, HttpError> {
        self.session.as_mut().ok_or_else(|| {
            HttpError::Internal(anyhow::anyhow!(
                "sessions are not enabled for this path (tools.sessions.on)"
            ))
        })
    }

    /// Read the entity and merge form/JSON fields into [`RequestContext::params`].
    ///
    /// Runs at most once; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// 413 when the body exceeds `request.max_body_size`, 400 for malformed
    /// JSON, 500 for transport read failures.
    pub fn process_body(&mut self) -> Result<(), HttpError> {
        let Some(reader) = self.body.take() else {
            return Ok(());
        };
        let limit: u64 = self
            .config
            .get_or("request.max_body_size", DEFAULT_MAX_BODY_SIZE);
        let mut bytes = Vec::new();
        reader
            .take(limit.saturating_add(1))
            .read_to_end(&mut bytes)
            .map_err(|e| HttpError::Internal(anyhow::Error::new(e).context("reading request body")))?;
        if bytes.len() as u64 > limit {
            return Err(HttpError::Status(
                413,
                Some(format!("Request entity exceeds {limit} bytes")),
            ));
        }
        let content_type = self
            .header("content-type")
            .map(|ct| ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
            .unwrap_or_default();

        if !bytes.is_empty() {
            match content_type.as_str() {
                "application/x-www-form-urlencoded" => {
                    for (k, v) in url::form_urlencoded::parse(&bytes) {
                        self.params
                            .add(k.into_owned(), Value::String(v.into_owned()), true);
                    }
                }
                "application/json" => {
                    let json: Value = serde_json::from_slice(&bytes).map_err(|e| {
                        HttpError::BadRequest(Some(format!("Invalid JSON document: {e}")))
                    })?;
                    if let Value::Object(fields) = json {
                        for (k, v) in fields {
                            self.params.add(k, v, true);
                        }
                    }
                }
                _ => {}
            }
        }
        debug!(
            request_id = %self.request_id,
            body_size_bytes = bytes.len(),
            content_type = %content_type,
            body_params = self.params.body_keys().len(),
            "Request body read"
        );
        self.body_bytes = Some(bytes);
        Ok(())
    }
}
