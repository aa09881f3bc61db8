use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::worker_pool::{WorkerPool, WorkerPoolMetrics};
use crate::engine::{Channel, Plugin};
use crate::request::{Body, RawRequest, RawResponse, RequestSource};
use crate::runtime_config::ServerConfig;

/// Start after applications (which use the default priority)
const START_PRIORITY: u8 = 75;

struct Running {
    server: Arc<tiny_http::Server>,
    stopping: Arc<AtomicBool>,
    acceptor: JoinHandle<()>,
    addr: SocketAddr,
    metrics: Arc<WorkerPoolMetrics>,
}

/// HTTP listener feeding a [`RequestSource`] through a worker pool.
///
/// Subscribed to the engine bus: `start` binds and spawns the acceptor and
/// workers, `stop` unblocks the acceptor, drains the queue and joins every
/// thread.
pub struct HttpServer {
    config: ServerConfig,
    source: Arc<dyn RequestSource>,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("config", &self.config)
            .field("addr", &self.local_addr())
            .finish_non_exhaustive()
    }
}

impl HttpServer {
    /// Server for `source`; nothing is bound until started
    pub fn new(config: ServerConfig, source: Arc<dyn RequestSource>) -> Self {
        Self {
            config,
            source,
            running: Mutex::new(None),
        }
    }

    /// Listener and pool settings
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bound address while running (resolves port `0`)
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Worker pool metrics while running
    #[must_use]
    pub fn metrics(&self) -> Option<Arc<WorkerPoolMetrics>> {
        self.running.lock().as_ref().map(|r| Arc::clone(&r.metrics))
    }

    /// Wait until the listener accepts TCP connections
    ///
    /// # Errors
    ///
    /// `NotConnected` if the server is not running, `TimedOut` after ~250ms.
    pub fn wait_ready(&self) -> io::Result<()> {
        let addr = self
            .local_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server not started"))?;
        for _ in 0..50 {
            if TcpStream::connect(addr).is_ok() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(5));
        }
        Err(io::Error::new(io::ErrorKind::TimedOut, "server not ready"))
    }

    /// Bind and spawn the acceptor and worker threads (no-op if running)
    ///
    /// # Errors
    ///
    /// Bind failures or thread spawn failures.
    pub fn start_server(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let server = tiny_http::Server::http(self.config.bind.as_str())
            .map_err(|e| anyhow!("failed to bind {}: {e}", self.config.bind))?;
        let addr = server
            .server_addr()
            .to_ip()
            .ok_or_else(|| anyhow!("listener on {} has no IP address", self.config.bind))?;
        let server = Arc::new(server);

        let source = Arc::clone(&self.source);
        let mut pool = WorkerPool::new("arbor-worker", self.config.pool.clone(), move |request| {
            serve_one(source.as_ref(), request);
        })
        .context("spawning worker pool")?;
        let metrics = Arc::clone(pool.metrics());

        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let server = Arc::clone(&server);
            let stopping = Arc::clone(&stopping);
            thread::Builder::new()
                .name("arbor-acceptor".to_string())
                .spawn(move || {
                    loop {
                        match server.recv() {
                            Ok(request) => {
                                if let Err(request) = pool.dispatch(request) {
                                    reject(request);
                                }
                            }
                            Err(_) if stopping.load(Ordering::SeqCst) => break,
                            Err(e) => warn!(error = %e, "Accept failed"),
                        }
                    }
                    pool.shutdown();
                    debug!("Acceptor exiting");
                })
                .context("spawning acceptor thread")?
        };

        info!(
            addr = %addr,
            num_workers = self.config.pool.num_workers,
            queue_bound = self.config.pool.queue_bound,
            "HTTP server listening"
        );
        *running = Some(Running {
            server,
            stopping,
            acceptor,
            addr,
            metrics,
        });
        Ok(())
    }

    /// Stop accepting, finish queued requests, join every thread
    pub fn stop_server(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.stopping.store(true, Ordering::SeqCst);
        running.server.unblock();
        if running.acceptor.join().is_err() {
            error!("Acceptor thread panicked");
        }
        info!(addr = %running.addr, "HTTP server stopped");
    }
}

impl Plugin for HttpServer {
    fn name(&self) -> String {
        format!("http-server {}", self.config.bind)
    }

    fn start(&self) -> anyhow::Result<()> {
        self.start_server()
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.stop_server();
        Ok(())
    }

    fn graceful(&self) -> anyhow::Result<()> {
        self.stop_server();
        self.start_server()
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.stop_server();
        Ok(())
    }

    fn priority(&self, channel: Channel) -> u8 {
        match channel {
            Channel::Start => START_PRIORITY,
            _ => crate::engine::DEFAULT_PRIORITY,
        }
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        self.stop_server();
    }
}

/// Answer a shed request without touching the application
fn reject(request: tiny_http::Request) {
    warn!(method = %request.method(), url = %request.url(), "Queue full - shedding request");
    let response = tiny_http::Response::from_string("503 Service Unavailable\n\nServer is at capacity")
        .with_status_code(503);
    if let Err(e) = request.respond(response) {
        debug!(error = %e, "Client went away before 503");
    }
}

/// Request body read straight from the connection.
///
/// The application pulls bytes only when it parses the body, so hooks that
/// run earlier (the `early` session lock) see an unread entity. The request
/// is taken back out of the slot to send the response.
struct ConnectionBody(Arc<Mutex<Option<tiny_http::Request>>>);

impl Read for ConnectionBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.lock().as_mut() {
            Some(request) => request.as_reader().read(buf),
            None => Ok(0),
        }
    }
}

fn serve_one(source: &dyn RequestSource, request: tiny_http::Request) {
    let mut raw = RawRequest::new(request.method().as_str(), request.url());
    raw.headers = request
        .headers()
        .iter()
        .map(|h| (h.field.as_str().as_str().to_string(), h.value.as_str().to_string()))
        .collect();

    let slot = Arc::new(Mutex::new(Some(request)));
    raw.body = Box::new(ConnectionBody(Arc::clone(&slot)));
    let response = source.handle(raw);

    let Some(request) = slot.lock().take() else {
        error!("Request vanished before the response was sent");
        return;
    };
    respond(request, response);
}

fn respond(request: tiny_http::Request, response: RawResponse) {
    let mut headers = Vec::with_capacity(response.headers.len());
    for (name, value) in response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        match tiny_http::Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            Ok(header) => headers.push(header),
            Err(()) => warn!(header = %name, "Dropping header that is not valid ASCII"),
        }
    }
    // tiny_http writes Content-Length from data_length, chunked when unknown
    let (reader, data_length) = if response.body.is_stream() {
        (response.body.into_reader(), None)
    } else {
        let bytes = response.body.collapse();
        let len = bytes.len();
        (Body::Bytes(bytes).into_reader(), Some(len))
    };
    let reply = tiny_http::Response::new(
        tiny_http::StatusCode(response.status),
        headers,
        reader,
        data_length,
        None,
    );
    if let Err(e) = request.respond(reply) {
        debug!(error = %e, "Client went away before the response was sent");
    }
}
