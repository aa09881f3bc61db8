//! # Worker Pool Module
//!
//! A fixed pool of OS worker threads draining one shared request queue.
//!
//! ## Features
//!
//! - **Shared Queue**: all workers share a single `may` MPMC channel receiver and
//!   load-balance automatically
//! - **Bounded Depth**: `queue_bound` caps the number of accepted-but-unstarted
//!   jobs; what happens at the cap depends on [`BackpressureMode`]
//! - **Panic Isolation**: a job that panics is logged and the worker keeps going
//! - **Metrics**: queue depth, dispatch, completion and shed counters
//!
//! Workers are plain threads, not coroutines: a job may block for a long time on
//! a per-session lock and must not stall any other request while it waits.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use may::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackpressureMode {
    /// Wait for room in the queue
    #[default]
    Block,
    /// Reject the job immediately (the server answers 503)
    Shed,
}

impl BackpressureMode {
    /// Parse `block` / `shed`, case-insensitively
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "block" => Some(Self::Block),
            "shed" => Some(Self::Shed),
            _ => None,
        }
    }
}

/// Configuration for a worker pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of worker threads
    pub num_workers: usize,
    /// Maximum queue depth
    pub queue_bound: usize,
    /// Behaviour at the queue bound
    pub backpressure_mode: BackpressureMode,
}

impl WorkerPoolConfig {
    /// Create a custom configuration
    #[must_use]
    pub fn new(num_workers: usize, queue_bound: usize, backpressure_mode: BackpressureMode) -> Self {
        Self {
            num_workers,
            queue_bound,
            backpressure_mode,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 10,
            queue_bound: 1024,
            backpressure_mode: BackpressureMode::Block,
        }
    }
}

/// Metrics for a worker pool
#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    /// Jobs rejected at the queue bound
    pub shed_count: AtomicU64,
    /// Jobs queued but not yet picked up
    pub queue_depth: AtomicUsize,
    /// Jobs accepted
    pub dispatched_count: AtomicU64,
    /// Jobs finished (including ones that panicked)
    pub completed_count: AtomicU64,
}

impl WorkerPoolMetrics {
    fn record_shed(&self) {
        self.shed_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_dispatch(&self) {
        self.dispatched_count.fetch_add(1, Ordering::Relaxed);
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    fn record_pickup(&self) {
        self.queue_depth.fetch_sub(1, Ordering::Relaxed);
    }

    fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Current shed count
    #[must_use]
    pub fn get_shed_count(&self) -> u64 {
        self.shed_count.load(Ordering::Relaxed)
    }

    /// Current queue depth
    #[must_use]
    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Relaxed)
    }

    /// Total dispatched
    #[must_use]
    pub fn get_dispatched_count(&self) -> u64 {
        self.dispatched_count.load(Ordering::Relaxed)
    }

    /// Total completed
    #[must_use]
    pub fn get_completed_count(&self) -> u64 {
        self.completed_count.load(Ordering::Relaxed)
    }
}

/// A pool of worker threads running `handler` on each dispatched job
pub struct WorkerPool<T: Send + 'static> {
    config: WorkerPoolConfig,
    sender: Option<mpsc::Sender<T>>,
    metrics: Arc<WorkerPoolMetrics>,
    workers: Vec<JoinHandle<()>>,
    name: String,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `config.num_workers` threads that call `handler` for every job
    ///
    /// # Errors
    ///
    /// Returns an error if a worker thread cannot be spawned.
    pub fn new<F>(name: &str, config: WorkerPoolConfig, handler: F) -> std::io::Result<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>();
        let rx = Arc::new(rx);
        let handler = Arc::new(handler);
        let metrics = Arc::new(WorkerPoolMetrics::default());

        info!(
            pool = %name,
            num_workers = config.num_workers,
            queue_bound = config.queue_bound,
            backpressure_mode = ?config.backpressure_mode,
            "Creating worker pool"
        );

        let mut workers = Vec::with_capacity(config.num_workers);
        for worker_id in 0..config.num_workers {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            let metrics = Arc::clone(&metrics);
            let pool = name.to_string();
            let handle = thread::Builder::new()
                .name(format!("{name}-{worker_id}"))
                .spawn(move || {
                    debug!(pool = %pool, worker_id, "Worker thread started");
                    while let Ok(job) = rx.recv() {
                        metrics.record_pickup();
                        if let Err(panic) =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(job)))
                        {
                            error!(
                                pool = %pool,
                                worker_id,
                                panic_message = ?panic,
                                "Job panicked outside the request error boundary"
                            );
                        }
                        metrics.record_completion();
                    }
                    debug!(pool = %pool, worker_id, "Worker thread exiting");
                })?;
            workers.push(handle);
        }

        Ok(Self {
            config,
            sender: Some(tx),
            metrics,
            workers,
            name: name.to_string(),
        })
    }

    /// Queue a job.
    ///
    /// In [`BackpressureMode::Shed`] the job is handed back when the queue is
    /// at its bound; in [`BackpressureMode::Block`] the caller waits for room.
    /// The job is also handed back if the pool has been shut down.
    ///
    /// # Errors
    ///
    /// Returns the job itself when it was not queued.
    pub fn dispatch(&self, job: T) -> Result<(), T> {
        let Some(sender) = self.sender.as_ref() else {
            return Err(job);
        };
        if self.metrics.get_queue_depth() >= self.config.queue_bound {
            match self.config.backpressure_mode {
                BackpressureMode::Shed => {
                    self.metrics.record_shed();
                    warn!(
                        pool = %self.name,
                        queue_depth = self.metrics.get_queue_depth(),
                        queue_bound = self.config.queue_bound,
                        "Queue full - shedding request"
                    );
                    return Err(job);
                }
                BackpressureMode::Block => {
                    while self.metrics.get_queue_depth() >= self.config.queue_bound {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        self.metrics.record_dispatch();
        sender.send(job).map_err(|e| {
            self.metrics.record_pickup();
            error!(pool = %self.name, "Worker pool channel disconnected");
            e.0
        })
    }

    /// Metrics for this pool
    #[must_use]
    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }

    /// Configuration for this pool
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Close the queue and wait for every worker to finish its queued jobs
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(pool = %self.name, "Worker thread panicked during shutdown");
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn test_backpressure_mode_parse() {
        assert_eq!(BackpressureMode::parse("block"), Some(BackpressureMode::Block));
        assert_eq!(BackpressureMode::parse("SHED"), Some(BackpressureMode::Shed));
        assert_eq!(BackpressureMode::parse(" Shed "), Some(BackpressureMode::Shed));
        assert_eq!(BackpressureMode::parse("invalid"), None);
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.num_workers, 10);
        assert_eq!(config.queue_bound, 1024);
        assert_eq!(config.backpressure_mode, BackpressureMode::Block);
    }

    #[test]
    fn test_jobs_run_and_panics_are_contained() {
        let (tx, rx) = std_mpsc::channel();
        let tx = parking_lot::Mutex::new(tx);
        let mut pool = WorkerPool::new(
            "test-pool",
            WorkerPoolConfig::new(2, 16, BackpressureMode::Block),
            move |n: u32| {
                if n == 3 {
                    panic!("boom");
                }
                tx.lock().send(n).unwrap();
            },
        )
        .unwrap();
        for n in 0..6 {
            pool.dispatch(n).unwrap();
        }
        pool.shutdown();
        let mut seen: Vec<u32> = rx.try_iter().collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 4, 5]);
        assert_eq!(pool.metrics().get_completed_count(), 6);
        assert_eq!(pool.metrics().get_queue_depth(), 0);
    }

    #[test]
    fn test_shed_at_queue_bound() {
        let (gate_tx, gate_rx) = std_mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        let started_tx = parking_lot::Mutex::new(started_tx);
        let mut pool = WorkerPool::new(
            "shed-pool",
            WorkerPoolConfig::new(1, 1, BackpressureMode::Shed),
            move |_: u32| {
                started_tx.lock().send(()).unwrap();
                let _ = gate_rx.lock().recv();
            },
        )
        .unwrap();
        // First job occupies the only worker, second fills the queue
        pool.dispatch(1).unwrap();
        started_rx.recv().unwrap();
        pool.dispatch(2).unwrap();
        assert_eq!(pool.dispatch(3), Err(3));
        assert_eq!(pool.metrics().get_shed_count(), 1);
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        pool.shutdown();
        assert_eq!(pool.dispatch(4), Err(4));
    }
}
