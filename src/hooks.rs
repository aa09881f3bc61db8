//! # Hooks Module
//!
//! Minimal request-hook pipeline. Tools attach callbacks to fixed points of
//! the request lifecycle; within a point, hooks run in ascending priority
//! order (ties keep attach order).
//!
//! If a hook fails, later hooks at that point are skipped unless they are
//! marked failsafe. The first error is returned after the failsafe hooks have
//! run. Session lock release relies on this at [`HookPoint::OnEndRequest`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::HttpError;
use crate::request::RequestContext;

/// Priority used when a tool does not specify one
pub const DEFAULT_PRIORITY: u8 = 50;

/// Lifecycle points a hook can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookPoint {
    /// After dispatch, before the request body is read
    BeforeRequestBody,
    /// After the body is read, just before the handler runs
    BeforeHandler,
    /// After the handler, before the response is assembled
    BeforeFinalize,
    /// After the response is assembled; always runs
    OnEndRequest,
}

/// A request hook.
pub trait Hook: Send + Sync {
    /// Run against the current request
    ///
    /// # Errors
    ///
    /// Any [`HttpError`] aborts the remaining non-failsafe hooks at this point.
    fn run(&self, ctx: &mut RequestContext) -> Result<(), HttpError>;
}

impl<F> Hook for F
where
    F: Fn(&mut RequestContext) -> Result<(), HttpError> + Send + Sync,
{
    fn run(&self, ctx: &mut RequestContext) -> Result<(), HttpError> {
        self(ctx)
    }
}

#[derive(Clone)]
struct HookEntry {
    name: &'static str,
    priority: u8,
    failsafe: bool,
    hook: Arc<dyn Hook>,
}

/// Hooks grouped by point, sorted by priority.
#[derive(Clone, Default)]
pub struct HookMap {
    points: BTreeMap<HookPoint, Vec<HookEntry>>,
}

impl fmt::Debug for HookMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (point, entries) in &self.points {
            let names: Vec<(&str, u8)> = entries.iter().map(|e| (e.name, e.priority)).collect();
            map.entry(point, &names);
        }
        map.finish()
    }
}

impl HookMap {
    /// Empty map
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a hook
    pub fn attach(
        &mut self,
        point: HookPoint,
        name: &'static str,
        priority: u8,
        hook: impl Hook + 'static,
    ) {
        self.insert(point, name, priority, false, Arc::new(hook));
    }

    /// Attach a hook that runs even after an earlier hook at the same point failed
    pub fn attach_failsafe(
        &mut self,
        point: HookPoint,
        name: &'static str,
        priority: u8,
        hook: impl Hook + 'static,
    ) {
        self.insert(point, name, priority, true, Arc::new(hook));
    }

    fn insert(
        &mut self,
        point: HookPoint,
        name: &'static str,
        priority: u8,
        failsafe: bool,
        hook: Arc<dyn Hook>,
    ) {
        let entries = self.points.entry(point).or_default();
        entries.push(HookEntry {
            name,
            priority,
            failsafe,
            hook,
        });
        entries.sort_by_key(|e| e.priority);
    }

    /// Names attached at `point`, in run order
    #[must_use]
    pub fn names(&self, point: HookPoint) -> Vec<&'static str> {
        self.points
            .get(&point)
            .map(|entries| entries.iter().map(|e| e.name).collect())
            .unwrap_or_default()
    }

    /// Run every hook at `point`.
    ///
    /// # Errors
    ///
    /// The first error raised by any hook at this point.
    pub fn run(&self, point: HookPoint, ctx: &mut RequestContext) -> Result<(), HttpError> {
        let Some(entries) = self.points.get(&point) else {
            return Ok(());
        };
        let mut first_err: Option<HttpError> = None;
        for entry in entries {
            if first_err.is_some() && !entry.failsafe {
                continue;
            }
            debug!(
                request_id = %ctx.request_id,
                hook = entry.name,
                point = ?point,
                priority = entry.priority,
                "Running hook"
            );
            if let Err(err) = entry.hook.run(ctx) {
                warn!(
                    request_id = %ctx.request_id,
                    hook = entry.name,
                    point = ?point,
                    status = err.status(),
                    error = %err,
                    "Hook failed"
                );
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
