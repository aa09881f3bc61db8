//! # CLI Module
//!
//! Command-line entry point for the `arbor` binary.
//!
//! ## Commands
//!
//! ### `serve`
//!
//! Run the bundled demo application:
//!
//! ```bash
//! arbor serve --config arbor.yaml --bind 0.0.0.0:8080
//! ```
//!
//! - `--config <FILE>` - YAML configuration (`global` plus `/path` sections)
//! - `--bind <ADDR>` - overrides `server.socket_host`/`server.socket_port` and `ARBOR_BIND`
//!
//! `SIGINT`/`SIGTERM` exit the engine; `SIGHUP` publishes `graceful`.
//!
//! ### `check-config`
//!
//! Parse a configuration file and print the merged sections as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::app::Application;
use crate::config::AppConfig;
use crate::engine::Engine;
use crate::error::HttpError;
use crate::logging::{init_logging, LogConfig};
use crate::runtime_config::ServerConfig;
use crate::server::HttpServer;
use crate::tree::{HandlerNode, PageHandler, Signature};

/// Command-line interface for arbor
#[derive(Parser, Debug)]
#[command(name = "arbor", version, about = "Arbor application server", long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Serve the demo application
    Serve {
        /// YAML configuration file
        #[arg(short, long, env = "ARBOR_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on (host:port)
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Validate a configuration file and print its sections
    CheckConfig {
        /// YAML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Parse arguments and run the selected command
///
/// # Errors
///
/// Configuration, logging or startup failures.
pub fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { config, bind } => serve(config, bind),
        Commands::CheckConfig { config } => {
            let app_config = AppConfig::from_file(&config)?;
            println!("{}", serde_json::to_string_pretty(&describe(&app_config))?);
            Ok(())
        }
    }
}

fn describe(config: &AppConfig) -> Value {
    let paths: Map<String, Value> = config
        .paths
        .iter()
        .map(|(path, block)| (path.clone(), Value::Object(block.clone())))
        .collect();
    json!({ "global": config.global, "paths": paths })
}

fn serve(config_path: Option<PathBuf>, bind: Option<String>) -> anyhow::Result<()> {
    // a second subscriber (e.g. from tests) is not an error here
    if let Err(e) = init_logging(&LogConfig::from_env()) {
        eprintln!("logging already initialised: {e:#}");
    }

    let app_config = match &config_path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::new().with("/", "tools.sessions.on", true),
    };
    let mut server_config = ServerConfig::from_config(&app_config.root()).with_env_overrides();
    if let Some(bind) = bind {
        server_config.bind = bind;
    }

    let engine = Engine::new();
    let app = Application::new(demo_tree(), app_config).context("building application")?;
    engine.mount("/", Arc::new(app));
    engine.subscribe(Arc::new(HttpServer::new(server_config, engine.apps())));

    #[cfg(unix)]
    install_signal_handler(engine.clone())?;

    engine.start()?;
    info!("Engine started; waiting for shutdown signal");
    engine.block();
    Ok(())
}

#[cfg(unix)]
fn install_signal_handler(engine: Engine) -> anyhow::Result<()> {
    use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP]).context("installing signal handlers")?;
    std::thread::Builder::new()
        .name("arbor-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                if signal == SIGHUP {
                    info!("SIGHUP received - graceful restart");
                    if let Err(e) = engine.graceful() {
                        tracing::error!(error = %format!("{e:#}"), "Graceful restart failed");
                    }
                    continue;
                }
                info!(signal, "Shutdown signal received");
                if let Err(e) = engine.exit() {
                    tracing::error!(error = %format!("{e:#}"), "Errors during shutdown");
                }
                break;
            }
        })
        .context("spawning signal thread")?;
    Ok(())
}

/// The demo handler tree served by `arbor serve`
#[must_use]
pub fn demo_tree() -> HandlerNode {
    let blog = HandlerNode::new()
        .index(PageHandler::new("blog.index", Signature::new(), |_, _| {
            Ok("<h1>Blog</h1>".into())
        }))
        .with_default(PageHandler::new(
            "blog.archive",
            Signature::new().param("year").param_default("month", "all"),
            |_, args| {
                Ok(json!({
                    "year": args.get("year"),
                    "month": args.get("month"),
                })
                .into())
            },
        ));

    HandlerNode::new()
        .index(PageHandler::new("index", Signature::new(), |_, _| {
            Ok("<h1>Hello from arbor</h1>".into())
        }))
        .page(
            "counter",
            PageHandler::new("counter", Signature::new(), |ctx, _| {
                let session = ctx.session()?;
                let count = session.get_as::<i64>("count")?.unwrap_or(0) + 1;
                session.insert("count", count)?;
                Ok(json!({ "count": count }).into())
            }),
        )
        .page(
            "login",
            PageHandler::new("login", Signature::new().param("user"), |ctx, args| {
                let user = args
                    .get_str("user")
                    .ok_or_else(|| HttpError::BadRequest(Some("user must be a string".into())))?
                    .to_string();
                let session = ctx.session()?;
                session.regenerate()?;
                session.insert("user", &user)?;
                Err(HttpError::see_other("/whoami"))
            }),
        )
        .page(
            "whoami",
            PageHandler::new("whoami", Signature::new(), |ctx, _| {
                let user = ctx.session()?.get_as::<String>("user")?;
                Ok(json!({ "user": user }).into())
            }),
        )
        .page(
            "echo",
            PageHandler::new("echo", Signature::new().varargs().varkw(), |_, args| {
                Ok(json!({ "args": args.rest(), "kwargs": args.extra() }).into())
            }),
        )
        .child("blog", blog)
}
