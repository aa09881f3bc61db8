//! # Engine Module
//!
//! Process-wide lifecycle bus plus the table of mounted applications.
//!
//! ## States
//!
//! ```text
//! Stopped -> Starting -> Started -> Stopping -> Stopped
//!                                       \
//!                                        -> Exiting -> Exited
//! ```
//!
//! Components (HTTP servers, applications, [`Monitor`]s) implement [`Plugin`]
//! and subscribe to the [`Bus`]. Publishing a channel runs every subscriber in
//! ascending priority order; failures are collected into [`ChannelFailures`]
//! rather than stopping the remaining listeners. A failed `start` tears the
//! engine down through `exit`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let engine = Engine::new();
//! engine.mount("/", Arc::new(app));
//! engine.subscribe(Arc::new(HttpServer::new(server_config, engine.apps())));
//! engine.start()?;
//! engine.block();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use arc_swap::ArcSwap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::app::Application;
use crate::request::{RawRequest, RawResponse, RequestSource};

/// Listener priority used when a plugin does not say otherwise
pub const DEFAULT_PRIORITY: u8 = 50;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Exiting,
    Exited,
}

/// Bus channels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Start,
    Stop,
    Graceful,
    Exit,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Channel::Start => "start",
            Channel::Stop => "stop",
            Channel::Graceful => "graceful",
            Channel::Exit => "exit",
        };
        f.write_str(name)
    }
}

/// A component driven by the engine bus.
///
/// Every callback defaults to doing nothing.
pub trait Plugin: Send + Sync {
    /// Name for logs and failure reports
    fn name(&self) -> String;

    /// Acquire resources (bind sockets, spawn threads)
    fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release what `start` acquired
    fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Reload in place
    fn graceful(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Final teardown
    fn exit(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Ordering on `channel`; lower runs first
    fn priority(&self, _channel: Channel) -> u8 {
        DEFAULT_PRIORITY
    }
}

/// Every listener error raised while publishing one channel
#[derive(Debug)]
pub struct ChannelFailures {
    /// Channel being published
    pub channel: Channel,
    /// Plugin name and error, in run order
    pub failures: Vec<(String, anyhow::Error)>,
}

impl fmt::Display for ChannelFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} listener(s) failed on {}",
            self.failures.len(),
            self.channel
        )?;
        for (name, err) in &self.failures {
            write!(f, "; {name}: {err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ChannelFailures {}

struct Subscriber {
    seq: usize,
    plugin: Arc<dyn Plugin>,
}

/// Publish/subscribe lifecycle bus with an observable state.
pub struct Bus {
    state: Mutex<EngineState>,
    changed: Condvar,
    subscribers: Mutex<Vec<Subscriber>>,
    // serializes transitions; publishing never holds `state`
    transition: Mutex<()>,
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("state", &*self.state.lock())
            .field("subscribers", &self.subscribers.lock().len())
            .finish()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// New bus in `Stopped`
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::Stopped),
            changed: Condvar::new(),
            subscribers: Mutex::new(Vec::new()),
            transition: Mutex::new(()),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
        self.changed.notify_all();
        debug!(state = ?state, "Bus state changed");
    }

    /// Register a plugin on every channel
    pub fn subscribe(&self, plugin: Arc<dyn Plugin>) {
        let mut subscribers = self.subscribers.lock();
        let seq = subscribers.len();
        debug!(plugin = %plugin.name(), "Bus subscribe");
        subscribers.push(Subscriber { seq, plugin });
    }

    /// Remove every subscription of a plugin (by pointer identity)
    pub fn unsubscribe(&self, plugin: &Arc<dyn Plugin>) {
        self.subscribers
            .lock()
            .retain(|s| !Arc::ptr_eq(&s.plugin, plugin));
    }

    /// Run every listener of `channel` in priority order.
    ///
    /// # Errors
    ///
    /// [`ChannelFailures`] listing each listener that returned an error or panicked.
    pub fn publish(&self, channel: Channel) -> Result<(), ChannelFailures> {
        let mut listeners: Vec<(u8, usize, Arc<dyn Plugin>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.plugin.priority(channel), s.seq, Arc::clone(&s.plugin)))
            .collect();
        listeners.sort_by_key(|(priority, seq, _)| (*priority, *seq));

        let mut failures = Vec::new();
        for (_, _, plugin) in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| match channel {
                Channel::Start => plugin.start(),
                Channel::Stop => plugin.stop(),
                Channel::Graceful => plugin.graceful(),
                Channel::Exit => plugin.exit(),
            }))
            .unwrap_or_else(|_| Err(anyhow!("listener panicked")));
            if let Err(err) = outcome {
                error!(channel = %channel, plugin = %plugin.name(), error = %format!("{err:#}"), "Bus listener failed");
                failures.push((plugin.name(), err));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChannelFailures { channel, failures })
        }
    }

    /// Start every plugin. A failure runs `exit` before returning it.
    ///
    /// # Errors
    ///
    /// The start failures.
    pub fn start(&self) -> anyhow::Result<()> {
        let transition = self.transition.lock();
        match self.state() {
            EngineState::Started => return Ok(()),
            EngineState::Exiting | EngineState::Exited => {
                return Err(anyhow!("engine has exited"));
            }
            _ => {}
        }
        info!("Bus STARTING");
        self.set_state(EngineState::Starting);
        let Err(failures) = self.publish(Channel::Start) else {
            self.set_state(EngineState::Started);
            info!("Bus STARTED");
            return Ok(());
        };
        error!(error = %failures, "Shutting down due to error in start listener");
        drop(transition);
        if let Err(exit_err) = self.exit() {
            warn!(error = %format!("{exit_err:#}"), "Errors during exit after failed start");
        }
        Err(anyhow::Error::new(failures))
    }

    /// Stop every plugin
    ///
    /// # Errors
    ///
    /// Listener failures; the state still reaches `Stopped`.
    pub fn stop(&self) -> anyhow::Result<()> {
        let _transition = self.transition.lock();
        self.stop_locked()
    }

    fn stop_locked(&self) -> anyhow::Result<()> {
        if matches!(self.state(), EngineState::Stopped | EngineState::Exited) {
            return Ok(());
        }
        info!("Bus STOPPING");
        self.set_state(EngineState::Stopping);
        let result = self.publish(Channel::Stop);
        self.set_state(EngineState::Stopped);
        info!("Bus STOPPED");
        result.map_err(anyhow::Error::new)
    }

    /// Publish `graceful`
    ///
    /// # Errors
    ///
    /// Listener failures.
    pub fn graceful(&self) -> anyhow::Result<()> {
        let _transition = self.transition.lock();
        info!("Bus graceful");
        self.publish(Channel::Graceful).map_err(anyhow::Error::new)
    }

    /// Stop (if needed), then publish `exit`. Idempotent.
    ///
    /// # Errors
    ///
    /// Listener failures from either channel; the state still reaches `Exited`.
    pub fn exit(&self) -> anyhow::Result<()> {
        let _transition = self.transition.lock();
        if matches!(self.state(), EngineState::Exiting | EngineState::Exited) {
            return Ok(());
        }
        let stopped = self.stop_locked();
        info!("Bus EXITING");
        self.set_state(EngineState::Exiting);
        let exited = self.publish(Channel::Exit).map_err(anyhow::Error::new);
        self.set_state(EngineState::Exited);
        info!("Bus EXITED");
        stopped.and(exited)
    }

    /// Wait until the bus reaches `state`. Returns false on timeout.
    pub fn wait(&self, state: EngineState, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut current = self.state.lock();
        while *current != state {
            match deadline {
                None => self.changed.wait(&mut current),
                Some(deadline) => {
                    if self.changed.wait_until(&mut current, deadline).timed_out() {
                        return *current == state;
                    }
                }
            }
        }
        true
    }

    /// Park the calling thread until the bus has exited
    pub fn block(&self) {
        self.wait(EngineState::Exited, None);
    }
}

struct MonitorThread {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

/// Periodic background task that follows the engine's start/stop.
pub struct Monitor {
    name: String,
    frequency: Duration,
    callback: Arc<dyn Fn() + Send + Sync>,
    running: Mutex<Option<MonitorThread>>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("name", &self.name)
            .field("frequency", &self.frequency)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Monitor {
    /// Run `callback` every `frequency`. A zero frequency never runs.
    pub fn new(
        name: impl Into<String>,
        frequency: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            frequency,
            callback: Arc::new(callback),
            running: Mutex::new(None),
        }
    }

    /// Interval between runs
    #[must_use]
    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    /// Whether the background thread is alive
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Spawn the background thread unless it is already running
    ///
    /// # Errors
    ///
    /// Thread spawn failures.
    pub fn start_thread(&self) -> anyhow::Result<()> {
        if self.frequency.is_zero() {
            return Ok(());
        }
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_stop = Arc::clone(&stop);
        let callback = Arc::clone(&self.callback);
        let frequency = self.frequency;
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let (flag, signal) = &*thread_stop;
                loop {
                    {
                        let mut stopped = flag.lock();
                        if !*stopped {
                            signal.wait_for(&mut stopped, frequency);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                        error!(monitor = %name, "Monitor callback panicked");
                    }
                }
            })?;
        debug!(monitor = %self.name, frequency_ms = frequency.as_millis() as u64, "Monitor started");
        *running = Some(MonitorThread { stop, handle });
        Ok(())
    }

    /// Signal the thread and join it
    pub fn stop_thread(&self) {
        let Some(thread) = self.running.lock().take() else {
            return;
        };
        let (flag, signal) = &*thread.stop;
        *flag.lock() = true;
        signal.notify_all();
        if thread.handle.join().is_err() {
            warn!(monitor = %self.name, "Monitor thread panicked");
        }
        debug!(monitor = %self.name, "Monitor stopped");
    }
}

impl Plugin for Monitor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn start(&self) -> anyhow::Result<()> {
        self.start_thread()
    }

    fn stop(&self) -> anyhow::Result<()> {
        self.stop_thread();
        Ok(())
    }

    fn graceful(&self) -> anyhow::Result<()> {
        self.stop_thread();
        self.start_thread()
    }

    fn exit(&self) -> anyhow::Result<()> {
        self.stop_thread();
        Ok(())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop_thread();
    }
}

/// Normalize a mount point: no trailing slash, `""` for the root
#[must_use]
pub fn normalize_script_name(script_name: &str) -> String {
    let trimmed = script_name.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Mounted applications, keyed by script name.
///
/// Lookups read a snapshot; mounting swaps in a new map.
#[derive(Default)]
pub struct AppTree {
    apps: ArcSwap<BTreeMap<String, Arc<Application>>>,
}

impl fmt::Debug for AppTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.apps.load().keys()).finish()
    }
}

impl AppTree {
    /// Empty tree
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mount `app` at `script_name`, replacing any app already there
    pub fn mount(&self, script_name: &str, app: Arc<Application>) {
        let script_name = normalize_script_name(script_name);
        self.apps.rcu(|current| {
            let mut next = BTreeMap::clone(current);
            next.insert(script_name.clone(), Arc::clone(&app));
            next
        });
    }

    /// Mounted script names
    #[must_use]
    pub fn script_names(&self) -> Vec<String> {
        self.apps.load().keys().cloned().collect()
    }

    /// The application with the longest script name that prefixes `path`
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<(String, Arc<Application>)> {
        let apps = self.apps.load();
        apps.iter()
            .filter(|(sn, _)| {
                sn.is_empty()
                    || path == sn.as_str()
                    || path
                        .strip_prefix(sn.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(sn, _)| sn.len())
            .map(|(sn, app)| (sn.clone(), Arc::clone(app)))
    }
}

impl RequestSource for AppTree {
    fn handle(&self, raw: RawRequest) -> RawResponse {
        match self.resolve(&raw.path) {
            Some((script_name, app)) => app.serve(&script_name, raw),
            None => RawResponse::text(404, "404 Not Found"),
        }
    }
}

/// Bus plus application tree.
#[derive(Debug, Default, Clone)]
pub struct Engine {
    bus: Arc<Bus>,
    apps: Arc<AppTree>,
}

impl Engine {
    /// Fresh engine in `Stopped`
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The lifecycle bus
    #[must_use]
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// The mounted applications, as a request source for servers
    #[must_use]
    pub fn apps(&self) -> Arc<AppTree> {
        Arc::clone(&self.apps)
    }

    /// Mount an application and subscribe it to the bus
    pub fn mount(&self, script_name: &str, app: Arc<Application>) {
        info!(script_name = %normalize_script_name(script_name), "Mounting application");
        self.apps.mount(script_name, Arc::clone(&app));
        self.bus.subscribe(app);
    }

    /// Subscribe an additional plugin
    pub fn subscribe(&self, plugin: Arc<dyn Plugin>) {
        self.bus.subscribe(plugin);
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.bus.state()
    }

    /// See [`Bus::start`]
    ///
    /// # Errors
    ///
    /// Start listener failures.
    pub fn start(&self) -> anyhow::Result<()> {
        self.bus.start()
    }

    /// See [`Bus::stop`]
    ///
    /// # Errors
    ///
    /// Stop listener failures.
    pub fn stop(&self) -> anyhow::Result<()> {
        self.bus.stop()
    }

    /// See [`Bus::graceful`]
    ///
    /// # Errors
    ///
    /// Graceful listener failures.
    pub fn graceful(&self) -> anyhow::Result<()> {
        self.bus.graceful()
    }

    /// See [`Bus::exit`]
    ///
    /// # Errors
    ///
    /// Stop/exit listener failures.
    pub fn exit(&self) -> anyhow::Result<()> {
        self.bus.exit()
    }

    /// See [`Bus::wait`]
    pub fn wait(&self, state: EngineState, timeout: Option<Duration>) -> bool {
        self.bus.wait(state, timeout)
    }

    /// See [`Bus::block`]
    pub fn block(&self) {
        self.bus.block();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        name: &'static str,
        priority: u8,
        log: Arc<Mutex<Vec<String>>>,
        fail_start: bool,
    }

    impl Plugin for Recorder {
        fn name(&self) -> String {
            self.name.to_string()
        }
        fn start(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:start", self.name));
            if self.fail_start {
                anyhow::bail!("boom");
            }
            Ok(())
        }
        fn stop(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:stop", self.name));
            Ok(())
        }
        fn exit(&self) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:exit", self.name));
            Ok(())
        }
        fn priority(&self, _channel: Channel) -> u8 {
            self.priority
        }
    }

    fn recorder(name: &'static str, priority: u8, log: &Arc<Mutex<Vec<String>>>) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            priority,
            log: Arc::clone(log),
            fail_start: false,
        })
    }

    #[test]
    fn test_priority_order_and_states() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new();
        bus.subscribe(recorder("late", 75, &log));
        bus.subscribe(recorder("early", 10, &log));
        bus.subscribe(recorder("mid", DEFAULT_PRIORITY, &log));

        bus.start().unwrap();
        assert_eq!(bus.state(), EngineState::Started);
        bus.exit().unwrap();
        assert_eq!(bus.state(), EngineState::Exited);
        assert_eq!(
            *log.lock(),
            vec![
                "early:start", "mid:start", "late:start",
                "early:stop", "mid:stop", "late:stop",
                "early:exit", "mid:exit", "late:exit",
            ]
        );
        // idempotent
        bus.exit().unwrap();
        assert_eq!(log.lock().len(), 9);
    }

    #[test]
    fn test_failed_start_exits_and_runs_all_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::new();
        bus.subscribe(Arc::new(Recorder {
            name: "bad",
            priority: 10,
            log: Arc::clone(&log),
            fail_start: true,
        }));
        bus.subscribe(recorder("good", 20, &log));

        let err = bus.start().unwrap_err();
        let failures = err.downcast_ref::<ChannelFailures>().unwrap();
        assert_eq!(failures.failures.len(), 1);
        assert_eq!(failures.failures[0].0, "bad");
        assert_eq!(bus.state(), EngineState::Exited);
        assert!(log.lock().contains(&"good:start".to_string()));
        assert!(log.lock().contains(&"good:exit".to_string()));
    }

    #[test]
    fn test_wait_and_block_release_on_exit() {
        let bus = Arc::new(Bus::new());
        assert!(!bus.wait(EngineState::Started, Some(Duration::from_millis(10))));
        let waiter = {
            let bus = Arc::clone(&bus);
            thread::spawn(move || bus.block())
        };
        bus.start().unwrap();
        bus.exit().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_monitor_runs_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let monitor = Monitor::new("tick", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        monitor.start_thread().unwrap();
        monitor.start_thread().unwrap();
        thread::sleep(Duration::from_millis(100));
        monitor.stop_thread();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 2, "ticked {seen} times");
        thread::sleep(Duration::from_millis(40));
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_zero_frequency_monitor_never_starts() {
        let monitor = Monitor::new("off", Duration::ZERO, || {});
        monitor.start_thread().unwrap();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_normalize_script_name() {
        assert_eq!(normalize_script_name("/"), "");
        assert_eq!(normalize_script_name(""), "");
        assert_eq!(normalize_script_name("/api/"), "/api");
        assert_eq!(normalize_script_name("api"), "/api");
    }
}
