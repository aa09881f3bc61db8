//! # Handler Tree Module
//!
//! The application's object tree and the callables hanging off it.
//!
//! A [`HandlerNode`] is built once at mount time and is read-only afterwards.
//! Each node may carry:
//!
//! - named children, looked up by (translated) path segment
//! - an exposed handler of its own (the node is directly callable)
//! - an `index` child, matched by a trailing slash
//! - a `default` handler that absorbs leftover path segments
//! - a [`DispatchOverride`] consulted when a segment has no matching child
//! - an attached configuration block
//!
//! ```rust,ignore
//! let blog = HandlerNode::new()
//!     .index(PageHandler::new("blog.index", Signature::new(), |_, _| Ok("posts".into())))
//!     .with_default(PageHandler::new(
//!         "blog.default",
//!         Signature::new().varargs(),
//!         |_, args| Ok(args.rest().join("/").into()),
//!     ))
//!     .with_config("tools.sessions.timeout", 30);
//! let root = HandlerNode::new().child("blog", blog);
//! ```
//!
//! [`PageHandler`] pairs a callable with its declared [`Signature`] so the
//! arguments derived from the URL and request body can be checked before the
//! call. The check tells "this URL does not exist" (404) apart from "the
//! submitted entity is malformed" (400).

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::config::{ConfigBlock, FromConfigValue};
use crate::error::{ClientErrorKind, HttpError};
use crate::request::{Body, Params, RequestContext};

/// Signature of every page handler.
pub type HandlerFn = dyn Fn(&mut RequestContext, CallArgs) -> Result<Body, HttpError> + Send + Sync;

/// Custom per-node dispatch hook.
///
/// Called when a path segment has no matching child and more than one real
/// segment remains. `vpath` holds the remaining segments (the synthetic
/// trailing `index` token is not included). The override may remove segments
/// it consumed; adding segments is a contract violation reported as
/// [`crate::error::DispatchError::SegmentAdded`]. If it removes nothing, the
/// current segment is assumed consumed.
pub trait DispatchOverride: Send + Sync {
    /// Return the node to continue from, or `None` to fall back to `default`
    fn dispatch(&self, vpath: &mut Vec<String>) -> Option<Arc<HandlerNode>>;
}

impl<F> DispatchOverride for F
where
    F: Fn(&mut Vec<String>) -> Option<Arc<HandlerNode>> + Send + Sync,
{
    fn dispatch(&self, vpath: &mut Vec<String>) -> Option<Arc<HandlerNode>> {
        self(vpath)
    }
}

/// A declared handler parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Parameter name as matched against keyword arguments
    pub name: String,
    /// Value used when the request supplies none
    pub default: Option<Value>,
}

/// Declared parameters of a handler.
///
/// Parameters bind positionally from the virtual path first, then by name
/// from query/body keyword arguments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Param>,
    varargs: bool,
    varkw: bool,
}

impl Signature {
    /// No parameters, no catch-alls
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a required parameter
    #[must_use]
    pub fn param(mut self, name: &str) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            default: None,
        });
        self
    }

    /// Add a parameter with a default value
    #[must_use]
    pub fn param_default(mut self, name: &str, default: impl Into<Value>) -> Self {
        self.params.push(Param {
            name: name.to_string(),
            default: Some(default.into()),
        });
        self
    }

    /// Accept extra positional arguments
    #[must_use]
    pub fn varargs(mut self) -> Self {
        self.varargs = true;
        self
    }

    /// Accept extra keyword arguments
    #[must_use]
    pub fn varkw(mut self) -> Self {
        self.varkw = true;
        self
    }

    /// Declared parameters in order
    #[must_use]
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    /// Whether extra positional arguments are accepted
    #[must_use]
    pub fn accepts_varargs(&self) -> bool {
        self.varargs
    }

    /// Whether extra keyword arguments are accepted
    #[must_use]
    pub fn accepts_varkw(&self) -> bool {
        self.varkw
    }
}

/// Why a set of arguments cannot be bound to a [`Signature`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgMismatch {
    /// 404 or 400
    pub kind: ClientErrorKind,
    /// Names the offending parameters, if there are any to name
    pub message: Option<String>,
}

impl ArgMismatch {
    fn new(kind: ClientErrorKind, message: Option<String>) -> Self {
        Self { kind, message }
    }

    /// Convert to an [`HttpError`], dropping the message unless `show_message`
    #[must_use]
    pub fn into_http(self, show_message: bool) -> HttpError {
        HttpError::client(self.kind, self.message.filter(|_| show_message))
    }
}

impl fmt::Display for ArgMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} {msg}", self.kind.status()),
            None => write!(f, "{}", self.kind.status()),
        }
    }
}

impl std::error::Error for ArgMismatch {}

/// Arguments bound to a handler's declared parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArgs {
    named: Map<String, Value>,
    rest: Vec<String>,
    extra: Map<String, Value>,
}

impl CallArgs {
    /// Value bound to a declared parameter (supplied or default)
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named.get(name)
    }

    /// String value of a declared parameter
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.named.get(name).and_then(Value::as_str)
    }

    /// Declared parameter coerced like a config value (`"3"` -> `3`)
    #[must_use]
    pub fn get_as<T: FromConfigValue>(&self, name: &str) -> Option<T> {
        self.named.get(name).and_then(T::from_config)
    }

    /// Extra positional arguments (requires [`Signature::varargs`])
    #[must_use]
    pub fn rest(&self) -> &[String] {
        &self.rest
    }

    /// Extra keyword arguments (requires [`Signature::varkw`])
    #[must_use]
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }
}

/// A handler callable with its declared signature.
#[derive(Clone)]
pub struct PageHandler {
    name: String,
    signature: Signature,
    config: ConfigBlock,
    func: Arc<HandlerFn>,
}

impl fmt::Debug for PageHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageHandler")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

impl PageHandler {
    /// Wrap a callable
    pub fn new<F>(name: &str, signature: Signature, func: F) -> Self
    where
        F: Fn(&mut RequestContext, CallArgs) -> Result<Body, HttpError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            signature,
            config: ConfigBlock::new(),
            func: Arc::new(func),
        }
    }

    /// Attach a config value to this handler
    #[must_use]
    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// Handler name used in logs
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared signature
    #[must_use]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Config attached to this handler
    #[must_use]
    pub fn config(&self) -> &ConfigBlock {
        &self.config
    }

    /// Check whether `args` and `params` can be bound, and classify why not.
    ///
    /// # Errors
    ///
    /// Checked in order: a missing parameter (404), extra positional
    /// arguments without varargs (404), a parameter bound twice (404 if any
    /// value came from the query string, else 400), unexpected keywords
    /// without varkw (404 from the query string, 400 from the body).
    pub fn validate(&self, args: &[String], params: &Params) -> Result<(), ArgMismatch> {
        let declared = self.signature.params();
        let mut usage: Vec<usize> = vec![0; declared.len()];
        let mut vararg_usage = 0_usize;
        let mut extra_kwargs: BTreeSet<&str> = BTreeSet::new();

        for i in 0..args.len() {
            match usage.get_mut(i) {
                Some(count) => *count += 1,
                None => vararg_usage += 1,
            }
        }
        for key in params.values().keys() {
            match declared.iter().position(|p| &p.name == key) {
                Some(idx) => usage[idx] += 1,
                None => {
                    extra_kwargs.insert(key.as_str());
                }
            }
        }
        for (idx, param) in declared.iter().enumerate() {
            if param.default.is_some() && usage[idx] == 0 {
                usage[idx] = 1;
            }
        }

        let missing: Vec<&str> = names_where(declared, &usage, |n| n == 0);
        let multiple: Vec<&str> = names_where(declared, &usage, |n| n > 1);

        if !missing.is_empty() {
            return Err(ArgMismatch::new(
                ClientErrorKind::NotFound,
                Some(format!("Missing parameters: {}", missing.join(","))),
            ));
        }

        if !self.signature.accepts_varargs() && vararg_usage > 0 {
            return Err(ArgMismatch::new(ClientErrorKind::NotFound, None));
        }

        let body_keys = params.body_keys();
        let qs_keys: BTreeSet<&str> = params
            .values()
            .keys()
            .map(String::as_str)
            .filter(|k| !body_keys.contains(*k))
            .collect();

        if !multiple.is_empty() {
            let kind = if multiple.iter().any(|m| qs_keys.contains(m)) {
                ClientErrorKind::NotFound
            } else {
                ClientErrorKind::BadRequest
            };
            return Err(ArgMismatch::new(
                kind,
                Some(format!("Multiple values for parameters: {}", multiple.join(","))),
            ));
        }

        if !self.signature.accepts_varkw() && !extra_kwargs.is_empty() {
            let extra_qs: Vec<&str> = extra_kwargs
                .iter()
                .copied()
                .filter(|k| qs_keys.contains(k))
                .collect();
            if !extra_qs.is_empty() {
                return Err(ArgMismatch::new(
                    ClientErrorKind::NotFound,
                    Some(format!(
                        "Unexpected query string parameters: {}",
                        extra_qs.join(", ")
                    )),
                ));
            }
            let extra_body: Vec<&str> = extra_kwargs
                .iter()
                .copied()
                .filter(|k| body_keys.contains(*k))
                .collect();
            if !extra_body.is_empty() {
                return Err(ArgMismatch::new(
                    ClientErrorKind::BadRequest,
                    Some(format!("Unexpected body parameters: {}", extra_body.join(", "))),
                ));
            }
        }

        Ok(())
    }

    /// Validate, then bind positional and keyword arguments to the signature.
    ///
    /// # Errors
    ///
    /// See [`PageHandler::validate`].
    pub fn bind(&self, args: &[String], params: &Params) -> Result<CallArgs, ArgMismatch> {
        self.validate(args, params)?;
        let declared = self.signature.params();
        let mut bound = CallArgs::default();
        for (i, arg) in args.iter().enumerate() {
            match declared.get(i) {
                Some(p) => {
                    bound.named.insert(p.name.clone(), Value::String(arg.clone()));
                }
                None => bound.rest.push(arg.clone()),
            }
        }
        for (key, value) in params.values() {
            if declared.iter().any(|p| &p.name == key) {
                bound.named.insert(key.clone(), value.clone());
            } else {
                bound.extra.insert(key.clone(), value.clone());
            }
        }
        for p in declared {
            if let Some(default) = &p.default {
                bound
                    .named
                    .entry(p.name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
        Ok(bound)
    }

    /// Bind the request's params to the signature and run the handler.
    ///
    /// # Errors
    ///
    /// A 404/400 when the arguments do not fit (messages only if
    /// `request.show_mismatched_params`), otherwise whatever the handler returns.
    pub fn call(&self, ctx: &mut RequestContext, args: &[String]) -> Result<Body, HttpError> {
        let show = ctx.config.get_or("request.show_mismatched_params", true);
        let bound = self
            .bind(args, &ctx.params)
            .map_err(|mismatch| mismatch.into_http(show))?;
        (self.func)(ctx, bound)
    }
}

fn names_where<'a>(declared: &'a [Param], usage: &[usize], pred: impl Fn(usize) -> bool) -> Vec<&'a str> {
    declared
        .iter()
        .zip(usage)
        .filter(|(_, n)| pred(**n))
        .map(|(p, _)| p.name.as_str())
        .collect()
}

/// A node in the application's handler tree.
#[derive(Clone, Default)]
pub struct HandlerNode {
    children: HashMap<String, Arc<HandlerNode>>,
    handler: Option<PageHandler>,
    default: Option<PageHandler>,
    dispatch: Option<Arc<dyn DispatchOverride>>,
    config: ConfigBlock,
}

impl fmt::Debug for HandlerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut children: Vec<&String> = self.children.keys().collect();
        children.sort();
        f.debug_struct("HandlerNode")
            .field("children", &children)
            .field("handler", &self.handler.as_ref().map(PageHandler::name))
            .field("default", &self.default.as_ref().map(PageHandler::name))
            .field("dispatch_override", &self.dispatch.is_some())
            .finish_non_exhaustive()
    }
}

impl HandlerNode {
    /// Empty, unexposed node
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leaf node exposing `handler`
    #[must_use]
    pub fn leaf(handler: PageHandler) -> Self {
        Self {
            handler: Some(handler),
            ..Self::default()
        }
    }

    /// Attach a child subtree under `name`
    #[must_use]
    pub fn child(mut self, name: &str, node: HandlerNode) -> Self {
        self.children.insert(name.to_string(), Arc::new(node));
        self
    }

    /// Attach an already shared child subtree under `name`
    #[must_use]
    pub fn child_arc(mut self, name: &str, node: Arc<HandlerNode>) -> Self {
        self.children.insert(name.to_string(), node);
        self
    }

    /// Attach an exposed leaf under `name`
    #[must_use]
    pub fn page(self, name: &str, handler: PageHandler) -> Self {
        self.child(name, HandlerNode::leaf(handler))
    }

    /// Expose this node itself
    #[must_use]
    pub fn exposed(mut self, handler: PageHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Handler for the trailing-slash form of this node's path
    #[must_use]
    pub fn index(self, handler: PageHandler) -> Self {
        self.page("index", handler)
    }

    /// Handler absorbing leftover path segments
    #[must_use]
    pub fn with_default(mut self, handler: PageHandler) -> Self {
        self.default = Some(handler);
        self
    }

    /// Install a custom dispatch override
    #[must_use]
    pub fn dispatch_override(mut self, hook: impl DispatchOverride + 'static) -> Self {
        self.dispatch = Some(Arc::new(hook));
        self
    }

    /// Attach a config value to this node
    #[must_use]
    pub fn with_config(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.config.insert(key.to_string(), value.into());
        self
    }

    /// Child registered under `name`
    #[must_use]
    pub fn get_child(&self, name: &str) -> Option<&Arc<HandlerNode>> {
        self.children.get(name)
    }

    /// Handler exposed by the node itself
    #[must_use]
    pub fn handler(&self) -> Option<&PageHandler> {
        self.handler.as_ref()
    }

    /// Whether the node is directly callable
    #[must_use]
    pub fn is_exposed(&self) -> bool {
        self.handler.is_some()
    }

    /// The `default` handler, if any
    #[must_use]
    pub fn default_handler(&self) -> Option<&PageHandler> {
        self.default.as_ref()
    }

    /// Whether an exposed `index` child exists
    #[must_use]
    pub fn has_index(&self) -> bool {
        self.children
            .get("index")
            .is_some_and(|node| node.is_exposed())
    }

    /// The dispatch override, if any
    #[must_use]
    pub fn override_hook(&self) -> Option<&Arc<dyn DispatchOverride>> {
        self.dispatch.as_ref()
    }

    /// Config attached to this node
    #[must_use]
    pub fn config(&self) -> &ConfigBlock {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handler(sig: Signature) -> PageHandler {
        PageHandler::new("h", sig, |_, _| Ok(Body::Empty))
    }

    fn query(qs: &str) -> Params {
        Params::from_query(qs)
    }

    fn kind(r: Result<(), ArgMismatch>) -> Option<u16> {
        r.err().map(|m| m.kind.status())
    }

    #[test]
    fn test_missing_required_is_not_found() {
        let h = handler(Signature::new().param("id"));
        let err = h.validate(&[], &query("")).unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::NotFound);
        assert_eq!(err.message.as_deref(), Some("Missing parameters: id"));
    }

    #[test]
    fn test_default_fills_missing() {
        let h = handler(Signature::new().param("id").param_default("page", 1));
        let bound = h.bind(&["7".to_string()], &query("")).unwrap();
        assert_eq!(bound.get_str("id"), Some("7"));
        assert_eq!(bound.get("page"), Some(&json!(1)));
        assert_eq!(bound.get_as::<i64>("id"), Some(7));
    }

    #[test]
    fn test_extra_positional_without_varargs() {
        let h = handler(Signature::new().param("id"));
        assert_eq!(kind(h.validate(&["1".into(), "2".into()], &query(""))), Some(404));
        let h = handler(Signature::new().param("id").varargs());
        let bound = h.bind(&["1".into(), "2".into()], &query("")).unwrap();
        assert_eq!(bound.rest(), &["2".to_string()]);
    }

    #[test]
    fn test_multiple_from_query_is_not_found() {
        let h = handler(Signature::new().param("id"));
        assert_eq!(kind(h.validate(&["1".into()], &query("id=2"))), Some(404));
    }

    #[test]
    fn test_multiple_from_body_is_bad_request() {
        let h = handler(Signature::new().param("id"));
        let mut params = Params::default();
        params.add("id".into(), json!("2"), true);
        let err = h.validate(&["1".into()], &params).unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::BadRequest);
        assert_eq!(err.message.as_deref(), Some("Multiple values for parameters: id"));
    }

    #[test]
    fn test_unexpected_kwargs_classified_by_origin() {
        let h = handler(Signature::new());
        let err = h.validate(&[], &query("x=1")).unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::NotFound);
        assert_eq!(
            err.message.as_deref(),
            Some("Unexpected query string parameters: x")
        );

        let mut params = Params::default();
        params.add("y".into(), json!("1"), true);
        let err = h.validate(&[], &params).unwrap_err();
        assert_eq!(err.kind, ClientErrorKind::BadRequest);
        assert_eq!(err.message.as_deref(), Some("Unexpected body parameters: y"));

        let h = handler(Signature::new().varkw());
        let bound = h.bind(&[], &query("x=1")).unwrap();
        assert_eq!(bound.extra().get("x"), Some(&json!("1")));
    }

    #[test]
    fn test_missing_checked_before_extras() {
        let h = handler(Signature::new().param("id"));
        let err = h.validate(&[], &query("other=1")).unwrap_err();
        assert_eq!(err.message.as_deref(), Some("Missing parameters: id"));
    }

    #[test]
    fn test_message_hidden_when_disabled() {
        let mismatch = ArgMismatch::new(ClientErrorKind::NotFound, Some("x".into()));
        assert!(matches!(mismatch.clone().into_http(false), HttpError::NotFound(None)));
        assert!(matches!(mismatch.into_http(true), HttpError::NotFound(Some(_))));
    }

    #[test]
    fn test_node_capabilities() {
        let node = HandlerNode::new()
            .index(handler(Signature::new()))
            .with_default(handler(Signature::new().varargs()))
            .dispatch_override(|_: &mut Vec<String>| -> Option<Arc<HandlerNode>> { None });
        assert!(node.has_index());
        assert!(!node.is_exposed());
        assert!(node.default_handler().is_some());
        assert!(node.override_hook().is_some());
    }
}
