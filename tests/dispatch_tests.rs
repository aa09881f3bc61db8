use std::sync::Arc;

use arbor::config::AppConfig;
use arbor::session::store::MemoryStore;
use arbor::tree::{HandlerNode, PageHandler, Signature};
use arbor::{Application, RawRequest, RawResponse, RequestSource};
use serde_json::{json, Value};

mod common;

fn app(config: AppConfig) -> Application {
    let echo = |name: &str, signature: Signature| {
        PageHandler::new(name, signature, |_, args| {
            Ok(json!({ "named": args.get("a"), "rest": args.rest(), "extra": args.extra() }).into())
        })
    };
    let root = HandlerNode::new()
        .index(echo("index", Signature::new()))
        .page("one", echo("one", Signature::new().param("a")))
        .page("many", echo("many", Signature::new().param("a").varargs().varkw()))
        .child(
            "files",
            HandlerNode::new().with_default(echo("files", Signature::new().varargs())),
        )
        .child(
            "admin",
            HandlerNode::new()
                .with_config("tools.flag", "node")
                .page(
                    "panel",
                    PageHandler::new("panel", Signature::new(), |ctx, _| {
                        Ok(json!({ "flag": ctx.config.get("tools.flag") }).into())
                    }),
                ),
        );
    Application::with_session_store(root, config, Arc::new(MemoryStore::new()))
}

fn body(response: RawResponse) -> String {
    String::from_utf8(response.body.collapse()).unwrap()
}

fn json_body(response: RawResponse) -> Value {
    serde_json::from_str(&body(response)).unwrap()
}

fn post_form(target: &str, form: &str) -> RawRequest {
    RawRequest::new("POST", target)
        .with_header("Content-Type", "application/x-www-form-urlencoded")
        .with_body(form.as_bytes().to_vec())
}

#[test]
fn test_same_path_resolves_identically() {
    let app = app(AppConfig::new());
    let first = app.resolve("/files/a/b").unwrap();
    let second = app.resolve("/files/a/b").unwrap();
    assert_eq!(first.handler.map(|h| h.name().to_string()), Some("files".to_string()));
    assert_eq!(second.vpath, first.vpath);
    assert_eq!(second.vpath.as_slice(), ["a", "b"]);
}

#[test]
fn test_path_config_overrides_node_config() {
    let by_path = app(AppConfig::new().with("/admin", "tools.flag", "path"));
    let response = by_path.handle(RawRequest::new("GET", "/admin/panel"));
    assert_eq!(json_body(response), json!({ "flag": "path" }));

    let by_global = app(AppConfig::new().with_global("tools.flag", "global"));
    let response = by_global.handle(RawRequest::new("GET", "/admin/panel"));
    assert_eq!(json_body(response), json!({ "flag": "node" }));
}

#[test]
fn test_encoded_slash_is_one_argument() {
    let app = app(AppConfig::new());
    let value = json_body(app.handle(RawRequest::new("GET", "/files/a%2Fb/c")));
    assert_eq!(value["rest"], json!(["a/b", "c"]));
}

#[test]
fn test_missing_parameter_is_not_found() {
    let response = app(AppConfig::new()).handle(RawRequest::new("GET", "/one"));
    assert_eq!(response.status, 404);
    assert!(body(response).contains("Missing parameters: a"));
}

#[test]
fn test_extra_positional_is_not_found() {
    let response = app(AppConfig::new()).handle(RawRequest::new("GET", "/one/x/y"));
    assert_eq!(response.status, 404);
}

#[test]
fn test_unexpected_query_param_is_not_found() {
    let response = app(AppConfig::new()).handle(RawRequest::new("GET", "/one/x?b=2"));
    assert_eq!(response.status, 404);
    assert!(body(response).contains("Unexpected query string parameters: b"));
}

#[test]
fn test_unexpected_body_param_is_bad_request() {
    let response = app(AppConfig::new()).handle(post_form("/one/x", "b=2"));
    assert_eq!(response.status, 400);
    assert!(body(response).contains("Unexpected body parameters: b"));
}

#[test]
fn test_body_param_given_twice_is_bad_request() {
    let response = app(AppConfig::new()).handle(post_form("/one/x", "a=2"));
    assert_eq!(response.status, 400);
    assert!(body(response).contains("Multiple values for parameters: a"));
}

#[test]
fn test_query_param_given_twice_is_not_found() {
    let response = app(AppConfig::new()).handle(RawRequest::new("GET", "/one/x?a=2"));
    assert_eq!(response.status, 404);
}

#[test]
fn test_varargs_and_varkw_collect_the_rest() {
    let response = app(AppConfig::new()).handle(post_form("/many/1/2/3?q=x", "f=y"));
    assert_eq!(response.status, 200);
    assert_eq!(
        json_body(response),
        json!({ "named": "1", "rest": ["2", "3"], "extra": { "q": "x", "f": "y" } })
    );
}

#[test]
fn test_malformed_json_body_is_bad_request() {
    let request = RawRequest::new("POST", "/many/1")
        .with_header("Content-Type", "application/json")
        .with_body(b"{not json".to_vec());
    assert_eq!(app(AppConfig::new()).handle(request).status, 400);
}

#[test]
fn test_oversized_body_is_rejected() {
    let app = app(AppConfig::new().with("/", "request.max_body_size", 4));
    let response = app.handle(post_form("/many/1", "f=123456"));
    assert_eq!(response.status, 413);
}

fn blog_app() -> Application {
    let blog = HandlerNode::new()
        .index(PageHandler::new("blog.index", Signature::new(), |_, _| Ok("blog home".into())))
        .with_default(PageHandler::new("blog.default", Signature::new().varargs(), |_, args| {
            Ok(json!({ "args": args.rest() }).into())
        }));
    let root = HandlerNode::new()
        .index(PageHandler::new("root.index", Signature::new(), |_, _| Ok("home".into())))
        .child("blog", blog);
    let config = AppConfig::new()
        .with("/", "tools.sessions.timeout", 60)
        .with("/blog", "tools.sessions.timeout", 30);
    Application::with_session_store(root, config, Arc::new(MemoryStore::new()))
}

#[test]
fn test_root_index_is_served() {
    let app = blog_app();
    let resolved = app.resolve("/").unwrap();
    assert!(resolved.is_index);
    assert!(resolved.vpath.is_empty());

    let response = app.handle(RawRequest::new("GET", "/"));
    assert_eq!(response.status, 200);
    assert_eq!(body(response), "home");
}

#[test]
fn test_index_without_slash_redirects() {
    let response = blog_app().handle(RawRequest::new("GET", "/blog?page=2"));
    assert_eq!(response.status, 301);
    assert_eq!(response.header("location"), Some("/blog/?page=2"));
}

#[test]
fn test_index_with_slash_is_served() {
    let app = blog_app();
    let resolved = app.resolve("/blog/").unwrap();
    assert_eq!(resolved.handler.as_ref().map(PageHandler::name), Some("blog.index"));
    assert!(resolved.is_index);
    assert!(resolved.vpath.is_empty());

    let response = app.handle(RawRequest::new("GET", "/blog/"));
    assert_eq!(response.status, 200);
    assert_eq!(body(response), "blog home");
}

#[test]
fn test_default_takes_leftover_segments() {
    let app = blog_app();
    let resolved = app.resolve("/blog/2024/05").unwrap();
    assert_eq!(resolved.handler.as_ref().map(PageHandler::name), Some("blog.default"));
    assert_eq!(resolved.vpath.as_slice(), ["2024", "05"]);
    assert!(!resolved.is_index);
    assert_eq!(resolved.config.get_or("tools.sessions.timeout", 0_u64), 30);

    let response = app.handle(RawRequest::new("GET", "/blog/2024/05"));
    assert_eq!(json_body(response), json!({ "args": ["2024", "05"] }));
}

#[test]
fn test_root_config_applies_outside_deeper_sections() {
    let resolved = blog_app().resolve("/").unwrap();
    assert_eq!(resolved.config.get_or("tools.sessions.timeout", 0_u64), 60);
}
