//! # Runtime Configuration Module
//!
//! Server-level settings: where to listen and how many worker threads to run.
//!
//! Values come from the `global` block of an [`AppConfig`](crate::config::AppConfig)
//! and may be overridden by environment variables, which win over the file.
//!
//! ## Environment Variables
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `ARBOR_BIND` | `host:port` to listen on | `127.0.0.1:8080` |
//! | `ARBOR_THREAD_POOL` | number of worker threads | `10` |
//! | `ARBOR_QUEUE_BOUND` | accepted-request queue depth | `1024` |
//! | `ARBOR_BACKPRESSURE` | `block` or `shed` | `block` |
//!
//! ## Example
//!
//! ```bash
//! export ARBOR_BIND=0.0.0.0:9000
//! export ARBOR_THREAD_POOL=32
//! cargo run --bin arbor
//! ```
//!
//! Every request runs to completion on one worker thread, and session locks
//! block that thread while they wait. Size the pool for the number of requests
//! you expect to hold a session lock at the same time.

use std::env;

use crate::config::Config;
use crate::server::worker_pool::{BackpressureMode, WorkerPoolConfig};

/// Listener and worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Address to bind (`host:port`)
    pub bind: String,
    /// Worker pool configuration
    pub pool: WorkerPoolConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            pool: WorkerPoolConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from the `global` config block (`server.*` keys).
    #[must_use]
    pub fn from_config(global: &Config) -> Self {
        let defaults = Self::default();
        let host: String = global.get_or("server.socket_host", "127.0.0.1".to_string());
        let port: u64 = global.get_or("server.socket_port", 8080_u64);
        let num_workers = global.get_or("server.thread_pool", defaults.pool.num_workers);
        let queue_bound = global.get_or("server.queue_bound", defaults.pool.queue_bound);
        let backpressure_mode = global
            .get_opt::<String>("server.backpressure")
            .and_then(|s| BackpressureMode::parse(&s))
            .unwrap_or(defaults.pool.backpressure_mode);
        Self {
            bind: format!("{host}:{port}"),
            pool: WorkerPoolConfig::new(num_workers.max(1), queue_bound.max(1), backpressure_mode),
        }
    }

    /// Apply `ARBOR_*` environment overrides on top of `self`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(bind) = env::var("ARBOR_BIND") {
            if !bind.trim().is_empty() {
                self.bind = bind.trim().to_string();
            }
        }
        if let Some(n) = env::var("ARBOR_THREAD_POOL")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.pool.num_workers = n.max(1);
        }
        if let Some(n) = env::var("ARBOR_QUEUE_BOUND")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            self.pool.queue_bound = n.max(1);
        }
        if let Some(mode) = env::var("ARBOR_BACKPRESSURE")
            .ok()
            .and_then(|s| BackpressureMode::parse(&s))
        {
            self.pool.backpressure_mode = mode;
        }
        self
    }
}
