use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::cookie::{expired_cookie_header, set_cookie_header};
use super::store::{self, SessionStore};
use super::{LockingPolicy, Session, SessionSettings};
use crate::config::Config;
use crate::engine::Monitor;
use crate::error::{HttpError, SessionError};
use crate::hooks::{HookMap, HookPoint, DEFAULT_PRIORITY};
use crate::request::RequestContext;

/// Default interval between expired-session sweeps (minutes)
pub const DEFAULT_CLEAN_FREQ: f64 = 5.0;

/// Owns an application's session store and its cleanup sweep.
///
/// The sweep is started lazily by the first request that opens a session, so
/// applications that never enable sessions never spawn the thread. At most
/// one sweep runs per manager.
#[derive(Debug)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    cleanup: Monitor,
}

impl SessionManager {
    /// Manager over `store`, sweeping every `clean_freq` (zero disables)
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, clean_freq: Duration) -> Self {
        let sweep_store = Arc::clone(&store);
        let cleanup = Monitor::new("session-cleanup", clean_freq, move || {
            match sweep_store.clean_up() {
                Ok(removed) => debug!(store = sweep_store.kind(), removed, "Session cleanup sweep"),
                Err(e) => error!(store = sweep_store.kind(), error = %e, "Session cleanup failed"),
            }
        });
        Self { store, cleanup }
    }

    /// Build the store and sweep from the application root config
    /// (`tools.sessions.storage_type`, `.storage_path`, `.servers`, `.clean_freq`)
    ///
    /// # Errors
    ///
    /// Unknown storage types or a store that cannot be opened.
    pub fn from_config(root: &Config) -> anyhow::Result<Self> {
        let store = store::from_config(root)?;
        let freq: f64 = root.get_or("tools.sessions.clean_freq", DEFAULT_CLEAN_FREQ);
        let clean_freq = super::minutes(freq)
            .to_std()
            .unwrap_or(Duration::ZERO);
        info!(
            store = store.kind(),
            clean_freq_secs = clean_freq.as_secs_f64(),
            "Session store configured"
        );
        Ok(Self::new(store, clean_freq))
    }

    /// The backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Resolve the session for a request, starting the sweep if needed
    ///
    /// # Errors
    ///
    /// See [`Session::new`].
    pub fn open(&self, requested: Option<&str>, settings: SessionSettings) -> Result<Session, SessionError> {
        if let Err(e) = self.cleanup.start_thread() {
            warn!(error = %format!("{e:#}"), "Could not start session cleanup");
        }
        Session::new(Arc::clone(&self.store), requested, settings)
    }

    /// Whether the cleanup sweep is running
    #[must_use]
    pub fn cleanup_running(&self) -> bool {
        self.cleanup.is_running()
    }

    /// Stop the sweep (it restarts on the next session request)
    pub fn stop_cleanup(&self) {
        self.cleanup.stop_thread();
    }
}

/// Cookie path for this request
fn cookie_path(ctx: &RequestContext, session: &Session) -> String {
    let cookie = &session.settings().cookie;
    let header = cookie.path_header.as_deref().and_then(|h| ctx.header(h));
    cookie.resolve_path(header)
}

/// Replace any `Set-Cookie` for `name` with `value`
fn replace_cookie(ctx: &mut RequestContext, name: &str, value: String) {
    let prefix = format!("{name}=");
    ctx.response
        .headers
        .retain(|(k, v)| !(k.eq_ignore_ascii_case("set-cookie") && v.starts_with(&prefix)));
    ctx.response.add_header("Set-Cookie", value);
}

fn set_session_cookie(ctx: &mut RequestContext, session: &Session) {
    let path = cookie_path(ctx, session);
    let settings = session.settings();
    let value = set_cookie_header(&settings.cookie, session.id(), settings.timeout, &path, Utc::now());
    replace_cookie(ctx, &settings.cookie.name, value);
}

/// Tell the client to drop its session cookie.
///
/// No-op when the request has no session.
pub fn expire(ctx: &mut RequestContext) {
    let Some(session) = ctx.session.take() else {
        return;
    };
    let path = cookie_path(ctx, &session);
    let value = expired_cookie_header(&session.settings().cookie, session.id(), &path, Utc::now());
    replace_cookie(ctx, &session.settings().cookie.name, value);
    ctx.session = Some(session);
}

fn init(ctx: &mut RequestContext, manager: &SessionManager) -> Result<(), HttpError> {
    if ctx.session.is_some() || !ctx.config.get_or("tools.sessions.on", false) {
        return Ok(());
    }
    let settings = SessionSettings::from_config(&ctx.config);
    let requested = ctx.cookie(&settings.cookie.name).map(str::to_string);
    let session = manager.open(requested.as_deref(), settings)?;
    set_session_cookie(ctx, &session);
    ctx.session = Some(session);
    Ok(())
}

fn lock_for(ctx: &mut RequestContext, policy: LockingPolicy) -> Result<(), HttpError> {
    match ctx.session.as_mut() {
        Some(session) if session.settings().locking == policy => {
            session.acquire_lock().map_err(|e| {
                if matches!(e, SessionError::LockTimeout { .. }) {
                    warn!(request_id = %ctx.request_id, "Session lock timed out");
                }
                HttpError::from(e)
            })
        }
        _ => Ok(()),
    }
}

fn save(ctx: &mut RequestContext) -> Result<(), HttpError> {
    let Some(mut session) = ctx.session.take() else {
        return Ok(());
    };
    let saved = session.save();
    if session.regenerated() {
        set_session_cookie(ctx, &session);
    }
    ctx.session = Some(session);
    saved.map_err(|e| {
        error!(request_id = %ctx.request_id, error = %e, "Session save failed");
        HttpError::from(e)
    })
}

fn close(ctx: &mut RequestContext) -> Result<(), HttpError> {
    if let Some(session) = ctx.session.as_mut() {
        if session.is_locked() {
            session.release_lock()?;
        }
    }
    Ok(())
}

/// Attach the session hooks.
///
/// | point | priority | hook |
/// |-------|----------|------|
/// | before request body | 50 | create the session, set the cookie |
/// | before request body | 60 | `early` lock |
/// | before handler | 50 | `implicit` lock |
/// | before finalize | 50 | save, release, refresh cookie after regeneration |
/// | on end request | 50 | release a lock still held (failsafe) |
pub fn install(hooks: &mut HookMap, manager: Arc<SessionManager>) {
    hooks.attach(
        HookPoint::BeforeRequestBody,
        "sessions.init",
        DEFAULT_PRIORITY,
        move |ctx: &mut RequestContext| init(ctx, &manager),
    );
    hooks.attach(
        HookPoint::BeforeRequestBody,
        "sessions.acquire_lock_early",
        60,
        |ctx: &mut RequestContext| lock_for(ctx, LockingPolicy::Early),
    );
    hooks.attach(
        HookPoint::BeforeHandler,
        "sessions.acquire_lock",
        DEFAULT_PRIORITY,
        |ctx: &mut RequestContext| lock_for(ctx, LockingPolicy::Implicit),
    );
    hooks.attach(HookPoint::BeforeFinalize, "sessions.save", DEFAULT_PRIORITY, save);
    hooks.attach_failsafe(HookPoint::OnEndRequest, "sessions.close", DEFAULT_PRIORITY, close);
}
