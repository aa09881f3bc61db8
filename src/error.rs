//! # Error Module
//!
//! Typed failure conditions for the request pipeline.
//!
//! - [`HttpError`] is what handlers and hooks return. The per-request error
//!   boundary in [`crate::app`] maps it to a status code.
//! - [`DispatchError`] is a programming error raised while walking the handler
//!   tree (a dispatch override that added path segments). It always surfaces as
//!   a 500, never as a 404.
//! - [`SessionError`] covers lock timeouts and storage failures.
//! - [`DispatchOutcome`] is the tagged result of running one request through the
//!   handler: redirects are values, not unwinding control flow.

use std::fmt;
use std::io;

use crate::request::Body;

/// Client-facing error classes produced by argument validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    /// The URL or route the client asked for does not exist (404)
    NotFound,
    /// The submitted entity is malformed (400)
    BadRequest,
}

impl ClientErrorKind {
    /// HTTP status code for this class
    #[must_use]
    pub fn status(self) -> u16 {
        match self {
            ClientErrorKind::NotFound => 404,
            ClientErrorKind::BadRequest => 400,
        }
    }
}

/// Error returned by page handlers and request hooks.
#[derive(Debug)]
pub enum HttpError {
    /// 404 with an optional diagnostic message
    NotFound(Option<String>),
    /// 400 with an optional diagnostic message
    BadRequest(Option<String>),
    /// Redirect to `url` with a 3xx status
    Redirect {
        /// Absolute or server-relative target
        url: String,
        /// 301, 302, 303, 307 or 308
        status: u16,
    },
    /// Arbitrary status with an optional message
    Status(u16, Option<String>),
    /// Unexpected failure; always a 500
    Internal(anyhow::Error),
}

impl HttpError {
    /// Build a client error of the given class
    #[must_use]
    pub fn client(kind: ClientErrorKind, message: Option<String>) -> Self {
        match kind {
            ClientErrorKind::NotFound => HttpError::NotFound(message),
            ClientErrorKind::BadRequest => HttpError::BadRequest(message),
        }
    }

    /// Shorthand for a 303 See Other redirect
    #[must_use]
    pub fn see_other(url: impl Into<String>) -> Self {
        HttpError::Redirect {
            url: url.into(),
            status: 303,
        }
    }

    /// Status code this error maps to
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            HttpError::NotFound(_) => 404,
            HttpError::BadRequest(_) => 400,
            HttpError::Redirect { status, .. } => *status,
            HttpError::Status(code, _) => *code,
            HttpError::Internal(_) => 500,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::NotFound(Some(msg)) => write!(f, "404 Not Found: {msg}"),
            HttpError::NotFound(None) => write!(f, "404 Not Found"),
            HttpError::BadRequest(Some(msg)) => write!(f, "400 Bad Request: {msg}"),
            HttpError::BadRequest(None) => write!(f, "400 Bad Request"),
            HttpError::Redirect { url, status } => write!(f, "{status} redirect to {url}"),
            HttpError::Status(code, Some(msg)) => write!(f, "{code}: {msg}"),
            HttpError::Status(code, None) => write!(f, "HTTP {code}"),
            HttpError::Internal(err) => write!(f, "500 Internal Server Error: {err:#}"),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<anyhow::Error> for HttpError {
    fn from(err: anyhow::Error) -> Self {
        HttpError::Internal(err)
    }
}

impl From<SessionError> for HttpError {
    fn from(err: SessionError) -> Self {
        match err {
            // The generic error boundary reports lock contention as "busy"
            SessionError::LockTimeout { .. } => HttpError::Status(503, Some(err.to_string())),
            other => HttpError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl From<DispatchError> for HttpError {
    fn from(err: DispatchError) -> Self {
        HttpError::Internal(anyhow::Error::new(err))
    }
}

/// Contract violation detected while walking the handler tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// A dispatch override returned more segments than it was given
    SegmentAdded {
        /// Segment being resolved when the override ran
        segment: String,
        /// The full segment list of the request
        path: Vec<String>,
        /// Segments remaining before the override ran
        before: usize,
        /// Segments remaining after the override ran
        after: usize,
    },
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::SegmentAdded {
                segment,
                path,
                before,
                after,
            } => write!(
                f,
                "A vpath segment was added. Custom dispatchers may only remove elements \
                 ({before} -> {after}) while processing '{segment}' in {path:?}"
            ),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Session storage and locking failures.
#[derive(Debug)]
pub enum SessionError {
    /// Waiting for the per-session lock exceeded `lock_timeout`
    LockTimeout {
        /// Session whose lock could not be acquired
        id: String,
    },
    /// The identifier cannot be represented by the backend (path traversal,
    /// illegal cache key characters, ...)
    InvalidId {
        /// The rejected identifier
        id: String,
    },
    /// Backend I/O failure
    Storage(io::Error),
    /// Stored payload could not be (de)serialized
    Serialization(serde_json::Error),
    /// The backend acknowledged the request but did not store the record
    NotStored {
        /// Session whose data was rejected
        id: String,
    },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::LockTimeout { id } => {
                write!(f, "Timed out waiting for the lock on session {id}")
            }
            SessionError::InvalidId { id } => write!(f, "Invalid session id '{id}'"),
            SessionError::Storage(err) => write!(f, "Session storage error: {err}"),
            SessionError::Serialization(err) => write!(f, "Session serialization error: {err}"),
            SessionError::NotStored { id } => write!(f, "Session data for id {id} not set"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Storage(err) => Some(err),
            SessionError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Storage(err)
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::Serialization(err)
    }
}

/// Result of running a resolved request through its handler.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handler produced a body
    Handled(Body),
    /// Handler (or a hook) asked for a redirect
    Redirect {
        /// Target location
        url: String,
        /// 3xx status
        status: u16,
    },
    /// Routing or entity error attributable to the client
    ClientError {
        /// Status code to send
        status: u16,
        /// Optional diagnostic message
        message: Option<String>,
    },
    /// Anything else; reported as 5xx
    ServerError {
        /// Status code to send (500 unless the error carried a specific 5xx)
        status: u16,
        /// Underlying cause
        cause: anyhow::Error,
    },
}

impl From<Result<Body, HttpError>> for DispatchOutcome {
    fn from(result: Result<Body, HttpError>) -> Self {
        match result {
            Ok(body) => DispatchOutcome::Handled(body),
            Err(err) => err.into(),
        }
    }
}

impl From<HttpError> for DispatchOutcome {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Redirect { url, status } => DispatchOutcome::Redirect { url, status },
            HttpError::NotFound(message) => DispatchOutcome::ClientError {
                status: 404,
                message,
            },
            HttpError::BadRequest(message) => DispatchOutcome::ClientError {
                status: 400,
                message,
            },
            HttpError::Status(code, message) if code < 500 => DispatchOutcome::ClientError {
                status: code,
                message,
            },
            HttpError::Status(code, message) => DispatchOutcome::ServerError {
                status: code,
                cause: anyhow::anyhow!(message.unwrap_or_else(|| format!("HTTP {code}"))),
            },
            HttpError::Internal(cause) => DispatchOutcome::ServerError { status: 500, cause },
        }
    }
}
