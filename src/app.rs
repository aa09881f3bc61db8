//! # Application Module
//!
//! An [`Application`] is a handler tree plus its configuration, hooks and
//! session manager, mounted on the engine at a script name.
//!
//! ## Request Pipeline
//!
//! 1. Decode the path (keeping `%2F`) and build the [`RequestContext`]
//! 2. Resolve the handler and merge the config trail
//! 3. `before_request_body` hooks (session creation, early locking)
//! 4. Read and parse the body (`request.process_request_body`)
//! 5. `before_handler` hooks (trailing-slash redirects, implicit locking)
//! 6. Call the handler; panics become 500s
//! 7. `before_finalize` hooks (session save) unless the request failed with a 5xx
//! 8. Assemble the response
//! 9. `on_end_request` hooks (always; releases a session lock still held)
//!
//! Every failure, whether raised by dispatch, a hook, the body reader or the
//! handler, is turned into a response here; the transport always gets a
//! [`RawResponse`].

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, Config};
use crate::dispatcher::{decode_path, Dispatcher, ResolvedRequest, VPath};
use crate::engine::Plugin;
use crate::error::{DispatchError, DispatchOutcome, HttpError};
use crate::hooks::{Hook, HookMap, HookPoint};
use crate::request::{Body, RawRequest, RawResponse, RequestContext, RequestSource};
use crate::session::{self, SessionManager, SessionStore};
use crate::tree::HandlerNode;

/// Priority of the trailing-slash hook (before the implicit session lock)
pub const TRAILING_SLASH_PRIORITY: u8 = 40;

/// A mountable application.
pub struct Application {
    root: Arc<HandlerNode>,
    config: AppConfig,
    base: Config,
    dispatcher: Dispatcher,
    hooks: HookMap,
    sessions: Arc<SessionManager>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("config", &self.config)
            .field("hooks", &self.hooks)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Build an application; the session store comes from the root config.
    ///
    /// # Errors
    ///
    /// Fails when the configured session store cannot be opened.
    pub fn new(root: HandlerNode, config: AppConfig) -> anyhow::Result<Self> {
        let sessions = Arc::new(SessionManager::from_config(&config.root())?);
        Ok(Self::with_sessions(root, config, sessions))
    }

    /// Build an application around an existing session store
    #[must_use]
    pub fn with_session_store(
        root: HandlerNode,
        config: AppConfig,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let freq: f64 = config
            .root()
            .get_or("tools.sessions.clean_freq", session::DEFAULT_CLEAN_FREQ);
        let clean_freq = session::minutes(freq).to_std().unwrap_or_default();
        let sessions = Arc::new(SessionManager::new(store, clean_freq));
        Self::with_sessions(root, config, sessions)
    }

    /// Build an application sharing a session manager
    #[must_use]
    pub fn with_sessions(root: HandlerNode, config: AppConfig, sessions: Arc<SessionManager>) -> Self {
        let base = Config::new(config.global.clone());
        let mut hooks = HookMap::new();
        hooks.attach(
            HookPoint::BeforeHandler,
            "trailing_slash",
            TRAILING_SLASH_PRIORITY,
            trailing_slash,
        );
        session::install(&mut hooks, Arc::clone(&sessions));
        Self {
            root: Arc::new(root),
            config,
            base,
            dispatcher: Dispatcher::new(),
            hooks,
            sessions,
        }
    }

    /// Attach an extra request hook
    #[must_use]
    pub fn with_hook(
        mut self,
        point: HookPoint,
        name: &'static str,
        priority: u8,
        hook: impl Hook + 'static,
    ) -> Self {
        self.hooks.attach(point, name, priority, hook);
        self
    }

    /// Replace the dispatcher (e.g. for a different segment translation)
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Application configuration
    #[must_use]
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Session manager
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Hooks attached to this application
    #[must_use]
    pub fn hooks(&self) -> &HookMap {
        &self.hooks
    }

    /// Resolve a decoded path below the mount point
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::find_handler`].
    pub fn resolve(&self, path: &str) -> Result<ResolvedRequest, DispatchError> {
        self.dispatcher
            .find_handler(&self.root, &self.config, &self.base, path)
    }

    /// Run one request mounted at `script_name`
    pub fn serve(&self, script_name: &str, raw: RawRequest) -> RawResponse {
        let started = Instant::now();
        let Ok(method) = http::Method::from_bytes(raw.method.as_bytes()) else {
            warn!(method = %raw.method, "Invalid request method");
            return RawResponse::text(400, "400 Bad Request\n\nInvalid request method");
        };
        let path_info = raw
            .path
            .strip_prefix(script_name)
            .unwrap_or(&raw.path)
            .to_string();
        let path = decode_path(&path_info);
        let mut ctx = RequestContext::new(method, path, script_name.to_string(), raw);
        debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.full_path(),
            "Request started"
        );

        let outcome = self.respond(&mut ctx);
        let response = finalize(&mut ctx, outcome);

        if let Err(err) = self.hooks.run(HookPoint::OnEndRequest, &mut ctx) {
            error!(request_id = %ctx.request_id, error = %err, "on_end_request hook failed");
        }
        // releases a lock that even the failsafe hook could not
        ctx.session = None;

        let latency_ms = started.elapsed().as_millis() as u64;
        if response.status >= 500 {
            error!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.full_path(),
                status = response.status,
                latency_ms,
                "Request failed"
            );
        } else {
            info!(
                request_id = %ctx.request_id,
                method = %ctx.method,
                path = %ctx.full_path(),
                handler = ctx.handler.as_deref().unwrap_or("-"),
                status = response.status,
                latency_ms,
                "Request complete"
            );
        }
        response
    }

    fn respond(&self, ctx: &mut RequestContext) -> DispatchOutcome {
        let resolved = catch_unwind(AssertUnwindSafe(|| self.resolve(&ctx.path)));
        let resolved = match resolved {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(err)) => return HttpError::from(err).into(),
            Err(panic) => {
                return HttpError::Internal(anyhow!(
                    "dispatch panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .into()
            }
        };
        let ResolvedRequest {
            handler,
            vpath,
            config,
            is_index,
            ..
        } = resolved;
        ctx.config = config;
        ctx.is_index = is_index;
        ctx.handler = handler.as_ref().map(|h| h.name().to_string());

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.run_handler(ctx, handler.as_ref(), &vpath)
        }))
        .unwrap_or_else(|panic| {
            Err(HttpError::Internal(anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

        let mut outcome = DispatchOutcome::from(result);
        if !matches!(outcome, DispatchOutcome::ServerError { .. }) {
            if let Err(err) = self.hooks.run(HookPoint::BeforeFinalize, ctx) {
                outcome = err.into();
            }
        }
        outcome
    }

    fn run_handler(
        &self,
        ctx: &mut RequestContext,
        handler: Option<&crate::tree::PageHandler>,
        vpath: &VPath,
    ) -> Result<Body, HttpError> {
        self.hooks.run(HookPoint::BeforeRequestBody, ctx)?;
        if ctx.config.get_or("request.process_request_body", true) {
            ctx.process_body()?;
        }
        self.hooks.run(HookPoint::BeforeHandler, ctx)?;
        let Some(handler) = handler else {
            return Err(HttpError::NotFound(None));
        };
        debug!(request_id = %ctx.request_id, handler = handler.name(), args = ?vpath, "Calling handler");
        handler.call(ctx, vpath)
    }
}

impl RequestSource for Application {
    fn handle(&self, raw: RawRequest) -> RawResponse {
        self.serve("", raw)
    }
}

impl Plugin for Application {
    fn name(&self) -> String {
        "application".to_string()
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.sessions.stop_cleanup();
        Ok(())
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.sessions.stop_cleanup();
        Ok(())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Percent-encode a decoded path for a `Location` header, keeping `/` and `%2F`
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            segment
                .split("%2F")
                .map(|piece| urlencoding::encode(piece).into_owned())
                .collect::<Vec<_>>()
                .join("%2F")
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Redirect index matches to the slash form and, optionally, non-index
/// matches away from it.
fn trailing_slash(ctx: &mut RequestContext) -> Result<(), HttpError> {
    if ctx.handler.is_none() || !ctx.config.get_or("tools.trailing_slash.on", true) {
        return Ok(());
    }
    let missing = ctx.config.get_or("tools.trailing_slash.missing", true);
    let extra = ctx.config.get_or("tools.trailing_slash.extra", false);
    let status = ctx
        .config
        .get_or::<u64>("tools.trailing_slash.status", 301)
        .try_into()
        .unwrap_or(301_u16);

    let target = if ctx.is_index && missing && !ctx.path.ends_with('/') {
        Some(format!("{}{}/", ctx.script_name, ctx.path))
    } else if !ctx.is_index && extra && ctx.path.len() > 1 && ctx.path.ends_with('/') {
        Some(format!(
            "{}{}",
            ctx.script_name,
            ctx.path.trim_end_matches('/')
        ))
    } else {
        None
    };
    let Some(target) = target else {
        return Ok(());
    };
    let mut url = encode_path(&target);
    if !ctx.query_string.is_empty() {
        url.push('?');
        url.push_str(&ctx.query_string);
    }
    Err(HttpError::Redirect { url, status })
}

fn reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

/// Keep only `Set-Cookie` from the headers assembled so far
fn cookie_headers(ctx: &mut RequestContext) -> Vec<(String, String)> {
    std::mem::take(&mut ctx.response.headers)
        .into_iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("set-cookie"))
        .collect()
}

fn text_response(status: u16, mut headers: Vec<(String, String)>, text: String) -> RawResponse {
    headers.push((
        "Content-Type".to_string(),
        "text/plain;charset=utf-8".to_string(),
    ));
    headers.push(("Content-Length".to_string(), text.len().to_string()));
    RawResponse {
        status,
        headers,
        body: Body::Text(text),
    }
}

fn finalize(ctx: &mut RequestContext, outcome: DispatchOutcome) -> RawResponse {
    match outcome {
        DispatchOutcome::Handled(body) => {
            let status = ctx.response.status.unwrap_or(200);
            let mut headers = std::mem::take(&mut ctx.response.headers);
            let has_type = headers
                .iter()
                .any(|(k, _)| k.eq_ignore_ascii_case("content-type"));
            if !has_type {
                if let Some(content_type) = body.default_content_type() {
                    headers.push(("Content-Type".to_string(), content_type.to_string()));
                }
            }
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case("content-length"));
            let body = if body.is_stream() {
                body
            } else {
                let bytes = body.collapse();
                headers.push(("Content-Length".to_string(), bytes.len().to_string()));
                Body::Bytes(bytes)
            };
            RawResponse {
                status,
                headers,
                body,
            }
        }
        DispatchOutcome::Redirect { url, status } => {
            let mut headers = cookie_headers(ctx);
            headers.push(("Location".to_string(), url.clone()));
            text_response(status, headers, format!("{status} {}\n\n{url}", reason(status)))
        }
        DispatchOutcome::ClientError { status, message } => {
            let headers = cookie_headers(ctx);
            let mut text = format!("{status} {}", reason(status));
            if let Some(message) = message {
                text.push_str("\n\n");
                text.push_str(&message);
            }
            text_response(status, headers, text)
        }
        DispatchOutcome::ServerError { status, cause } => {
            error!(
                request_id = %ctx.request_id,
                path = %ctx.full_path(),
                status,
                error = %format!("{cause:#}"),
                "Unhandled error"
            );
            let headers = cookie_headers(ctx);
            let mut text = format!("{status} {}", reason(status));
            if ctx.config.get_or("request.show_tracebacks", false) {
                text.push_str("\n\n");
                text.push_str(&format!("{cause:?}"));
            }
            text_response(status, headers, text)
        }
    }
}
