//! # Arbor
//!
//! **Arbor** is an embeddable HTTP application framework. Applications are trees
//! of handler objects: a URL path is walked segment by segment down the tree,
//! configuration is layered along the way, and the matched handler is called
//! with arguments taken from the remaining path and the query/body parameters.
//! Per-client state lives in sessions backed by pluggable stores with per-id
//! locking.
//!
//! ## Architecture
//!
//! - **[`tree`]** - handler nodes, [`tree::PageHandler`] and argument validation
//! - **[`dispatcher`]** - path walking, `default`/`index` resolution, config trail
//! - **[`config`]** - global and path-keyed configuration, YAML loading
//! - **[`request`]** - the transport contract and the per-request context
//! - **[`hooks`]** - prioritized request hooks
//! - **[`session`]** - session façade, cookie handling and stores (memory, file, memcached)
//! - **[`app`]** - the request pipeline and error boundary
//! - **[`engine`]** - lifecycle bus, background monitors, mounted application tree
//! - **[`server`]** - `tiny_http` transport and worker pool
//! - **[`logging`]** - `tracing` subscriber setup
//!
//! ### Request Handling Flow
//!
//! ```mermaid
//! sequenceDiagram
//!     participant Client
//!     participant Server as server::HttpServer
//!     participant Pool as WorkerPool
//!     participant Tree as engine::AppTree
//!     participant App as app::Application
//!     participant Disp as dispatcher::Dispatcher
//!     participant Hooks as hooks::HookMap
//!     participant Handler as tree::PageHandler
//!
//!     Client->>Server: HTTP request
//!     Server->>Pool: dispatch (503 when shedding)
//!     Pool->>Tree: RawRequest
//!     Tree->>App: longest script-name match
//!     App->>Disp: find_handler(path)
//!     Disp-->>App: handler, vpath, config, is_index
//!     App->>Hooks: before_request_body (session init / early lock)
//!     App->>Hooks: before_handler (trailing slash / implicit lock)
//!     App->>Handler: call(ctx, vpath)
//!     Handler-->>App: Body or HttpError
//!     App->>Hooks: before_finalize (session save)
//!     App->>Hooks: on_end_request (release lock)
//!     App-->>Client: RawResponse
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use arbor::app::Application;
//! use arbor::config::AppConfig;
//! use arbor::engine::Engine;
//! use arbor::runtime_config::ServerConfig;
//! use arbor::server::HttpServer;
//! use arbor::tree::{HandlerNode, PageHandler, Signature};
//!
//! # fn main() -> anyhow::Result<()> {
//! let root = HandlerNode::new()
//!     .index(PageHandler::new("index", Signature::new(), |_, _| Ok("Hello".into())));
//! let config = AppConfig::new().with("/", "tools.sessions.on", true);
//!
//! let engine = Engine::new();
//! engine.mount("/", Arc::new(Application::new(root, config)?));
//! engine.subscribe(Arc::new(HttpServer::new(ServerConfig::default(), engine.apps())));
//! engine.start()?;
//! engine.block();
//! # Ok(())
//! # }
//! ```
//!
//! ## Runtime Considerations
//!
//! Requests run on plain OS threads. A session lock blocks its worker thread
//! until the holder saves, so `server.thread_pool` bounds how many requests can
//! wait on locks at once. Handlers may block freely.

pub mod app;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod ids;
pub mod logging;
pub mod request;
pub mod runtime_config;
pub mod server;
pub mod session;
pub mod tree;

pub use app::Application;
pub use config::{AppConfig, Config};
pub use dispatcher::{Dispatcher, ResolvedRequest};
pub use engine::{Engine, EngineState, Plugin};
pub use error::{DispatchOutcome, HttpError, SessionError};
pub use request::{Body, RawRequest, RawResponse, RequestContext, RequestSource};
pub use session::{Session, SessionManager, SessionSettings};
pub use tree::{CallArgs, HandlerNode, PageHandler, Signature};
