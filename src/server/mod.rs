//! # Server Module
//!
//! HTTP transport: a `tiny_http` listener whose acceptor thread hands each
//! request to a bounded [`WorkerPool`](worker_pool::WorkerPool) of OS threads.
//! Each worker buffers the entity, converts the request into a
//! [`RawRequest`](crate::request::RawRequest), runs it through a
//! [`RequestSource`](crate::request::RequestSource) and writes the
//! [`RawResponse`](crate::request::RawResponse) back.

pub mod http_server;
pub mod worker_pool;

pub use http_server::HttpServer;
pub use worker_pool::{BackpressureMode, WorkerPool, WorkerPoolConfig, WorkerPoolMetrics};
