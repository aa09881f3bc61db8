use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use arbor::config::AppConfig;
use arbor::engine::Engine;
use arbor::hooks::HookPoint;
use arbor::runtime_config::ServerConfig;
use arbor::server::{BackpressureMode, HttpServer, WorkerPoolConfig};
use arbor::session::store::MemoryStore;
use arbor::tree::{HandlerNode, PageHandler, Signature};
use arbor::{Application, EngineState, HttpError, RequestContext, Session};

mod common;
use common::http_client::{get, send};
use common::{cookie_pair, counter_app};

fn server_config(workers: usize, queue: usize, mode: BackpressureMode) -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1:0".to_string(),
        pool: WorkerPoolConfig::new(workers, queue, mode),
    }
}

#[test]
fn test_engine_serves_sessions_over_http() {
    let engine = Engine::new();
    engine.mount("/app", Arc::new(counter_app(Arc::new(MemoryStore::new()), 60.0)));
    let server = Arc::new(HttpServer::new(
        server_config(4, 64, BackpressureMode::Block),
        engine.apps(),
    ));
    let plugin: Arc<HttpServer> = Arc::clone(&server);
    engine.subscribe(plugin);
    engine.start().unwrap();
    assert_eq!(engine.state(), EngineState::Started);
    server.wait_ready().unwrap();
    let addr = server.local_addr().unwrap();

    let first = get(addr, "/app/count", None);
    assert_eq!(first.status, 200);
    assert_eq!(first.body, "1");
    let cookie = cookie_pair(first.set_cookies()[0]);
    assert!(cookie.starts_with("session_id="));

    let second = get(addr, "/app/count", Some(&cookie));
    assert_eq!(second.body, "2");
    assert_eq!(cookie_pair(second.set_cookies()[0]), cookie);

    let index = get(addr, "/app", None);
    assert_eq!(index.status, 301);
    assert_eq!(index.header("location"), Some("/app/"));

    let missing = get(addr, "/elsewhere", None);
    assert_eq!(missing.status, 404);

    engine.exit().unwrap();
    assert_eq!(engine.state(), EngineState::Exited);
    assert!(server.local_addr().is_none());
}

#[test]
fn test_post_form_reaches_handler() {
    let root = HandlerNode::new().page(
        "greet",
        PageHandler::new("greet", Signature::new().param("name"), |_, args| {
            Ok(format!("hi {}", args.get_str("name").unwrap_or("?")).into())
        }),
    );
    let app = Application::with_session_store(root, AppConfig::new(), Arc::new(MemoryStore::new()));
    let server = HttpServer::new(server_config(2, 16, BackpressureMode::Block), Arc::new(app));
    server.start_server().unwrap();
    server.wait_ready().unwrap();

    let reply = send(
        server.local_addr().unwrap(),
        "POST",
        "/greet",
        &[("Content-Type", "application/x-www-form-urlencoded")],
        "name=ann",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "hi ann");
    assert_eq!(reply.header("content-length"), Some("6"));
    server.stop_server();
}

#[test]
fn test_full_queue_sheds_with_503() {
    let root = HandlerNode::new().index(PageHandler::new("slow", Signature::new(), |_, _| {
        thread::sleep(Duration::from_millis(300));
        Ok("done".into())
    }));
    let app = Application::with_session_store(root, AppConfig::new(), Arc::new(MemoryStore::new()));
    let server = Arc::new(HttpServer::new(
        server_config(1, 1, BackpressureMode::Shed),
        Arc::new(app),
    ));
    server.start_server().unwrap();
    server.wait_ready().unwrap();
    let addr = server.local_addr().unwrap();

    let clients: Vec<_> = (0..6)
        .map(|_| thread::spawn(move || get(addr, "/", None).status))
        .collect();
    let statuses: Vec<u16> = clients.into_iter().map(|c| c.join().unwrap()).collect();

    assert!(statuses.contains(&200), "{statuses:?}");
    assert!(statuses.contains(&503), "{statuses:?}");
    assert!(server.metrics().unwrap().get_shed_count() > 0);
    server.stop_server();
}

#[test]
fn test_early_lock_is_taken_before_the_body_is_read() {
    let seen = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    let root = HandlerNode::new().page(
        "upload",
        PageHandler::new("upload", Signature::new().param("data"), |ctx, args| {
            let data = args.get_str("data").unwrap_or_default().to_string();
            ctx.session()?.insert("data", &data)?;
            Ok(data.into())
        }),
    );
    let config = AppConfig::new()
        .with("/", "tools.sessions.on", true)
        .with("/", "tools.sessions.locking", "early");
    let app = Application::with_session_store(root, config, Arc::new(MemoryStore::new())).with_hook(
        HookPoint::BeforeRequestBody,
        "record_lock_state",
        70,
        move |ctx: &mut RequestContext| -> Result<(), HttpError> {
            let locked = ctx.session.as_ref().is_some_and(Session::is_locked);
            *record.lock().unwrap() = Some((locked, ctx.body_bytes().is_none()));
            Ok(())
        },
    );
    let server = HttpServer::new(server_config(2, 16, BackpressureMode::Block), Arc::new(app));
    server.start_server().unwrap();
    server.wait_ready().unwrap();

    let reply = send(
        server.local_addr().unwrap(),
        "POST",
        "/upload",
        &[("Content-Type", "application/x-www-form-urlencoded")],
        "data=abc",
    );
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, "abc");
    assert_eq!(*seen.lock().unwrap(), Some((true, true)));
    server.stop_server();
}

#[test]
fn test_application_body_limit_applies_over_http() {
    let root = HandlerNode::new().page(
        "upload",
        PageHandler::new("upload", Signature::new().varkw(), |_, _| Ok("ok".into())),
    );
    let config = AppConfig::new().with("/", "request.max_body_size", 16);
    let app = Application::with_session_store(root, config, Arc::new(MemoryStore::new()));
    let server = HttpServer::new(server_config(2, 16, BackpressureMode::Block), Arc::new(app));
    server.start_server().unwrap();
    server.wait_ready().unwrap();
    let addr = server.local_addr().unwrap();

    let form = [("Content-Type", "application/x-www-form-urlencoded")];
    assert_eq!(send(addr, "POST", "/upload", &form, "a=1").status, 200);
    let large = format!("a={}", "x".repeat(64));
    assert_eq!(send(addr, "POST", "/upload", &form, &large).status, 413);
    server.stop_server();
}
