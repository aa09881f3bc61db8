//! # Dispatcher Module
//!
//! Maps a request path onto the handler tree.
//!
//! ## Algorithm
//!
//! 1. Split the path into non-empty segments and append a synthetic `index`
//!    token, so index lookup shares the traversal of named children.
//! 2. Walk from the root. Each segment is translated (ASCII punctuation to `_`
//!    by default) and looked up as a child. Where no child matches, the node's
//!    [`DispatchOverride`](crate::tree::DispatchOverride) may consume segments
//!    when more than one real segment remains.
//! 3. Every visited position is recorded in the [`ConfigTrail`], matched or
//!    not, together with its node config and any app config keyed by the
//!    cumulative path prefix.
//! 4. Walk the trail deepest-first: a `default` handler wins first, then a
//!    directly exposed node. The unconsumed segments become the virtual path.
//! 5. The trail's config blocks merge root-first; deeper entries win.
//!
//! ## Encoded slashes
//!
//! [`decode_path`] percent-decodes everything except `%2F`, which survives the
//! split step and is turned into a literal `/` only in the virtual path handed
//! to the handler. `/files/a%2Fb` therefore yields one argument `a/b`.

use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::config::{AppConfig, Config, ConfigBlock};
use crate::error::DispatchError;
use crate::tree::{HandlerNode, PageHandler};

/// Leftover path segments passed as positional arguments.
pub type VPath = SmallVec<[String; 4]>;

/// Encoded slash marker kept through path splitting.
const ENCODED_SLASH: &str = "%2F";

/// One visited position on the way down the tree.
#[derive(Debug, Clone)]
pub struct ConfigTrailEntry {
    /// Raw segment name (`root` for the first entry)
    pub name: String,
    /// Node reached at this position, if any
    pub node: Option<Arc<HandlerNode>>,
    /// Node-attached config plus app config for this path prefix
    pub config: ConfigBlock,
    /// Segments (including the `index` token) still unconsumed here
    pub segleft: usize,
}

/// Ordered record of a tree walk, root first.
#[derive(Debug, Clone, Default)]
pub struct ConfigTrail {
    entries: Vec<ConfigTrailEntry>,
}

impl ConfigTrail {
    /// Entries in root-to-leaf order
    #[must_use]
    pub fn entries(&self) -> &[ConfigTrailEntry] {
        &self.entries
    }

    /// Merge `base` and every entry's config, root first
    #[must_use]
    pub fn effective_config(&self, base: &Config) -> Config {
        let mut merged = base.clone();
        for entry in &self.entries {
            merged.merge(&entry.config);
        }
        merged
    }

    fn push(&mut self, entry: ConfigTrailEntry) {
        self.entries.push(entry);
    }
}

/// Outcome of resolving a path.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    /// Selected handler, `None` when nothing matched
    pub handler: Option<PageHandler>,
    /// Positional arguments, `%2F` already turned back into `/`
    pub vpath: VPath,
    /// Effective configuration for the request
    pub config: Config,
    /// Matched an index handler (or a default reached with a trailing slash)
    pub is_index: bool,
    /// The walk that produced `config`
    pub trail: ConfigTrail,
}

impl ResolvedRequest {
    /// Whether a handler was found
    #[must_use]
    pub fn is_found(&self) -> bool {
        self.handler.is_some()
    }
}

/// Replace ASCII punctuation with `_`
#[must_use]
pub fn translate_punctuation(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_punctuation() { '_' } else { c })
        .collect()
}

/// Percent-decode a raw request path, leaving `%2F` (any case) encoded as
/// uppercase `%2F`. Invalid UTF-8 is replaced lossily.
#[must_use]
pub fn decode_path(raw: &str) -> String {
    let mut pieces: Vec<String> = Vec::new();
    let mut rest = raw;
    loop {
        let found = rest
            .char_indices()
            .find(|(i, _)| {
                rest.get(*i..*i + 3)
                    .is_some_and(|s| s.eq_ignore_ascii_case(ENCODED_SLASH))
            })
            .map(|(i, _)| i);
        match found {
            Some(i) => {
                pieces.push(percent_decode(&rest[..i]));
                rest = &rest[i + 3..];
            }
            None => {
                pieces.push(percent_decode(rest));
                break;
            }
        }
    }
    pieces.join(ENCODED_SLASH)
}

fn percent_decode(s: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(s.as_bytes())).into_owned()
}

/// Tree-walking dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher {
    translate: fn(&str) -> String,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            translate: translate_punctuation,
        }
    }
}

impl Dispatcher {
    /// Dispatcher with the default punctuation translation
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatcher with a custom segment translation
    #[must_use]
    pub fn with_translation(translate: fn(&str) -> String) -> Self {
        Self { translate }
    }

    /// Resolve `path` (already passed through [`decode_path`]) against `root`.
    ///
    /// `base` is the engine-wide config the trail is merged onto.
    ///
    /// # Errors
    ///
    /// [`DispatchError::SegmentAdded`] when a dispatch override grows the
    /// remaining segment list.
    pub fn find_handler(
        &self,
        root: &Arc<HandlerNode>,
        app_config: &AppConfig,
        base: &Config,
        path: &str,
    ) -> Result<ResolvedRequest, DispatchError> {
        let mut fullpath: Vec<String> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        fullpath.push("index".to_string());
        let fullpath_len = fullpath.len();

        let mut trail = ConfigTrail::default();
        let mut root_conf = root.config().clone();
        if let Some(section) = app_config.section("/") {
            root_conf.extend(section.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        trail.push(ConfigTrailEntry {
            name: "root".to_string(),
            node: Some(Arc::clone(root)),
            config: root_conf,
            segleft: fullpath_len,
        });

        let mut node: Option<Arc<HandlerNode>> = Some(Arc::clone(root));
        let mut iternames = fullpath.clone();
        while let Some(name) = iternames.first().cloned() {
            let objname = (self.translate)(&name);
            let pre_len = iternames.len();
            let mut subnode = node
                .as_ref()
                .and_then(|n| n.get_child(&objname))
                .map(Arc::clone);

            if subnode.is_none() {
                match node.as_ref().and_then(|n| n.override_hook()) {
                    Some(hook) if pre_len > 1 => {
                        let index_token = iternames.pop();
                        subnode = hook.dispatch(&mut iternames);
                        iternames.extend(index_token);
                    }
                    _ => {
                        iternames.remove(0);
                    }
                }
            } else {
                iternames.remove(0);
            }

            let mut segleft = iternames.len();
            if segleft > pre_len {
                return Err(DispatchError::SegmentAdded {
                    segment: name,
                    path: fullpath,
                    before: pre_len,
                    after: segleft,
                });
            } else if segleft == pre_len {
                // Override used the current segment without removing it
                iternames.remove(0);
                segleft -= 1;
            }
            node = subnode;

            let mut nodeconf = node
                .as_ref()
                .map(|n| n.config().clone())
                .unwrap_or_default();
            let existing_len = fullpath_len - pre_len;
            let mut curpath = if existing_len == 0 {
                String::new()
            } else {
                format!("/{}", fullpath[..existing_len].join("/"))
            };
            for seg in &fullpath[existing_len..fullpath_len - segleft] {
                curpath.push('/');
                curpath.push_str(seg);
                if let Some(section) = app_config.section(&curpath) {
                    nodeconf.extend(section.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }

            trail.push(ConfigTrailEntry {
                name,
                node: node.clone(),
                config: nodeconf,
                segleft,
            });
        }

        // the trailing `index` token is never an argument
        let vpath_for = |segleft: usize| -> VPath {
            let start = (fullpath_len - segleft).min(fullpath_len - 1);
            fullpath[start..fullpath_len - 1]
                .iter()
                .map(|s| s.replace(ENCODED_SLASH, "/"))
                .collect()
        };

        let last = trail.entries.len() - 1;
        for i in (0..=last).rev() {
            let entry = &trail.entries[i];
            let Some(candidate) = entry.node.clone() else {
                continue;
            };
            let segleft = entry.segleft;

            if let Some(default) = candidate.default_handler() {
                trail.entries.insert(
                    i + 1,
                    ConfigTrailEntry {
                        name: "default".to_string(),
                        node: None,
                        config: default.config().clone(),
                        segleft,
                    },
                );
                let resolved = ResolvedRequest {
                    handler: Some(default.clone()),
                    vpath: vpath_for(segleft),
                    config: trail.effective_config(base),
                    is_index: path.ends_with('/'),
                    trail,
                };
                debug!(
                    path = %path,
                    handler = %default.name(),
                    vpath = ?resolved.vpath,
                    "Dispatched to default handler"
                );
                return Ok(resolved);
            }

            if let Some(handler) = candidate.handler() {
                let resolved = ResolvedRequest {
                    handler: Some(handler.clone()),
                    vpath: vpath_for(segleft),
                    config: trail.effective_config(base),
                    is_index: i == last,
                    trail,
                };
                debug!(
                    path = %path,
                    handler = %handler.name(),
                    vpath = ?resolved.vpath,
                    is_index = resolved.is_index,
                    "Dispatched to exposed handler"
                );
                return Ok(resolved);
            }
        }

        warn!(path = %path, "No handler matched");
        Ok(ResolvedRequest {
            handler: None,
            vpath: VPath::new(),
            config: trail.effective_config(base),
            is_index: false,
            trail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Body;
    use crate::tree::Signature;
    use serde_json::json;

    fn page(name: &str, sig: Signature) -> PageHandler {
        PageHandler::new(name, sig, |_, _| Ok(Body::Empty))
    }

    fn tree() -> Arc<HandlerNode> {
        let blog = HandlerNode::new()
            .index(page("blog.index", Signature::new()))
            .with_default(page("blog.default", Signature::new().varargs()))
            .page("post", page("blog.post", Signature::new().param("id")));
        Arc::new(
            HandlerNode::new()
                .index(page("root.index", Signature::new()))
                .page("about_html", page("about", Signature::new()))
                .child("blog", blog),
        )
    }

    fn resolve(path: &str) -> ResolvedRequest {
        Dispatcher::new()
            .find_handler(&tree(), &AppConfig::new(), &Config::default(), path)
            .unwrap()
    }

    fn handler_name(r: &ResolvedRequest) -> Option<&str> {
        r.handler.as_ref().map(PageHandler::name)
    }

    #[test]
    fn test_root_index() {
        let r = resolve("/");
        assert_eq!(handler_name(&r), Some("root.index"));
        assert!(r.is_index);
        assert!(r.vpath.is_empty());
    }

    #[test]
    fn test_default_absorbs_segments() {
        let r = resolve("/blog/2024/05");
        assert_eq!(handler_name(&r), Some("blog.default"));
        assert_eq!(r.vpath.as_slice(), &["2024".to_string(), "05".to_string()]);
        assert!(!r.is_index);
    }

    #[test]
    fn test_index_leaf_beats_parent_default() {
        let r = resolve("/blog/");
        assert_eq!(handler_name(&r), Some("blog.index"));
        assert!(r.is_index);
    }

    #[test]
    fn test_exposed_leaf_with_vpath() {
        let r = resolve("/blog/post/7");
        assert_eq!(handler_name(&r), Some("blog.post"));
        assert_eq!(r.vpath.as_slice(), &["7".to_string()]);
        assert!(!r.is_index);
    }

    #[test]
    fn test_punctuation_translation() {
        let r = resolve("/about.html");
        assert_eq!(handler_name(&r), Some("about"));
    }

    #[test]
    fn test_unmatched_is_not_found() {
        let root = Arc::new(HandlerNode::new().page("a", page("a", Signature::new())));
        let r = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), "/missing")
            .unwrap();
        assert!(!r.is_found());
        assert!(r.vpath.is_empty());
    }

    #[test]
    fn test_encoded_slash_stays_one_argument() {
        let root = Arc::new(
            HandlerNode::new().child(
                "files",
                HandlerNode::new().with_default(page("files", Signature::new().varargs())),
            ),
        );
        let path = decode_path("/files/a%2fb/c%20d");
        assert_eq!(path, "/files/a%2Fb/c d");
        let r = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), &path)
            .unwrap();
        assert_eq!(r.vpath.as_slice(), &["a/b".to_string(), "c d".to_string()]);
    }

    #[test]
    fn test_config_deepest_prefix_wins() {
        let config = AppConfig::new()
            .with("/", "timeout", 60)
            .with("/", "root_only", true)
            .with("/blog", "timeout", 30);
        let r = Dispatcher::new()
            .find_handler(&tree(), &config, &Config::default(), "/blog/post/7")
            .unwrap();
        assert_eq!(r.config.get("timeout"), Some(&json!(30)));
        assert_eq!(r.config.get("root_only"), Some(&json!(true)));

        let r = Dispatcher::new()
            .find_handler(&tree(), &config, &Config::default(), "/about.html")
            .unwrap();
        assert_eq!(r.config.get("timeout"), Some(&json!(60)));
    }

    #[test]
    fn test_node_and_handler_config_merge() {
        let root = Arc::new(
            HandlerNode::new().with_config("a", 1).child(
                "x",
                HandlerNode::new()
                    .with_config("a", 2)
                    .with_default(page("d", Signature::new().varargs()).with_config("b", 3)),
            ),
        );
        let r = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), "/x/y")
            .unwrap();
        assert_eq!(r.config.get("a"), Some(&json!(2)));
        assert_eq!(r.config.get("b"), Some(&json!(3)));
    }

    #[test]
    fn test_trail_records_unmatched_positions() {
        let r = resolve("/blog/2024/05");
        let names: Vec<&str> = r.trail.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["root", "blog", "default", "2024", "05", "index"]);
    }

    #[test]
    fn test_dispatch_override_consumes_segments() {
        let item = Arc::new(HandlerNode::leaf(page("item", Signature::new().varargs())));
        let target = Arc::clone(&item);
        let users = HandlerNode::new().dispatch_override(
            move |vpath: &mut Vec<String>| -> Option<Arc<HandlerNode>> {
                vpath.remove(0);
                Some(Arc::clone(&target))
            },
        );
        let root = Arc::new(HandlerNode::new().child("users", users));
        let r = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), "/users/42/edit")
            .unwrap();
        assert_eq!(handler_name(&r), Some("item"));
        assert_eq!(r.vpath.as_slice(), &["edit".to_string()]);
    }

    #[test]
    fn test_dispatch_override_adding_segments_is_an_error() {
        let root = Arc::new(HandlerNode::new().dispatch_override(
            |vpath: &mut Vec<String>| -> Option<Arc<HandlerNode>> {
                vpath.push("extra".to_string());
                None
            },
        ));
        let err = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), "/a/b")
            .unwrap_err();
        assert!(matches!(err, DispatchError::SegmentAdded { before: 3, after: 4, .. }));
    }

    #[test]
    fn test_override_not_called_for_last_segment() {
        let root = Arc::new(
            HandlerNode::new()
                .dispatch_override(|_: &mut Vec<String>| -> Option<Arc<HandlerNode>> {
                    panic!("override must not see the index token alone")
                })
                .with_default(page("d", Signature::new().varargs())),
        );
        let r = Dispatcher::new()
            .find_handler(&root, &AppConfig::new(), &Config::default(), "/")
            .unwrap();
        assert_eq!(handler_name(&r), Some("d"));
        assert!(r.is_index);
    }

    #[test]
    fn test_determinism() {
        let a = resolve("/blog/2024/05");
        let b = resolve("/blog/2024/05");
        assert_eq!(handler_name(&a), handler_name(&b));
        assert_eq!(a.vpath, b.vpath);
        assert_eq!(a.config, b.config);
    }
}
