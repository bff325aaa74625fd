//! Daemon module - lifecycle orchestration
//!
//! Starts the components in dependency order, supervises the capture loop,
//! drives periodic checkpoints, and tears everything down in reverse order
//! on SIGTERM/SIGINT:
//!
//! 1. device registry (discover keyboards, start the hotplug watch)
//! 2. counter store (load the last checkpoint)
//! 3. audio engine (optional, failures only disable clicks)
//! 4. capture loop on a blocking thread, counter consumer as a task
//!
//! SIGUSR1 forces an immediate checkpoint.

use crate::audio::{sample, AudioEngine, RodioFactory, SinkFactory};
use crate::config::{Config, DeviceConfig};
use crate::counter::{CounterSnapshot, CounterStore};
use crate::device::{DeviceOpener, DeviceRegistry, EvdevOpener, HotplugWatch, INPUT_DIR};
use crate::error::{CaptureError, KeytallyError, Result};
use crate::event::KeyEvent;
use crate::multiplexer::{Dispatcher, Multiplexer};
use crate::status::{DaemonStatus, StatusFile, StatusReport};
use pidlock::Pidlock;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

type CaptureTask = JoinHandle<std::result::Result<DeviceRegistry, CaptureError>>;

/// Write PID file for external control via signals
fn write_pid_file(path: &Path) -> Option<PathBuf> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!("Failed to create PID file directory: {}", e);
            return None;
        }
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(path, pid.to_string()) {
        tracing::warn!("Failed to write PID file: {}", e);
        return None;
    }

    tracing::debug!("PID file written: {:?} (pid={})", path, pid);
    Some(path.to_path_buf())
}

/// Remove PID file on shutdown
fn cleanup_pid_file(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            tracing::warn!("Failed to remove PID file: {}", e);
        }
    }
}

/// Take the single-instance lock in the runtime directory
fn acquire_lock(runtime_dir: &Path) -> Result<Pidlock> {
    let lock_path = runtime_dir.join("keytally.lock");
    let mut lock = Pidlock::new(&lock_path.to_string_lossy());
    lock.acquire()
        .map_err(|_| KeytallyError::AlreadyRunning(lock_path.clone()))?;
    tracing::debug!("Acquired daemon lock {:?}", lock_path);
    Ok(lock)
}

fn release_runtime_files(pid_file: Option<PathBuf>, lock: Option<Pidlock>) {
    if let Some(ref path) = pid_file {
        cleanup_pid_file(path);
    }
    if let Some(mut lock) = lock {
        if lock.release().is_err() {
            tracing::warn!("Failed to release daemon lock");
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Where the daemon gets its devices and audio output from
pub struct Backends {
    /// Directory scanned and watched for event nodes
    pub input_dir: PathBuf,
    pub opener: Arc<dyn DeviceOpener>,
    /// None disables click feedback regardless of config
    pub sinks: Option<Box<dyn SinkFactory>>,
    /// Runtime directory for the PID file and instance lock, if any
    pub runtime_dir: Option<PathBuf>,
}

impl Backends {
    /// Real evdev devices under /dev/input and the default audio output
    pub fn system(config: &Config) -> Self {
        Self {
            input_dir: PathBuf::from(INPUT_DIR),
            opener: Arc::new(EvdevOpener),
            sinks: Some(Box::new(RodioFactory::new(config.audio.volume))),
            runtime_dir: Some(Config::runtime_dir()),
        }
    }
}

/// Cloneable query and control surface of a running daemon
#[derive(Clone)]
pub struct DaemonHandle {
    store: Arc<CounterStore>,
    status: Arc<DaemonStatus>,
    shutdown: Arc<Notify>,
    checkpoint: Arc<Notify>,
}

impl DaemonHandle {
    /// Current per-key and total counts
    pub fn snapshot(&self) -> CounterSnapshot {
        self.store.snapshot()
    }

    /// Devices and audio state
    pub fn status(&self) -> StatusReport {
        self.status.report()
    }

    /// Same as SIGTERM
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Same as SIGUSR1
    pub fn request_checkpoint(&self) {
        self.checkpoint.notify_one();
    }
}

/// Stops the capture thread when the daemon future is dropped mid-run
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Everything a capture thread needs to (re)build its registry
#[derive(Clone)]
struct CaptureContext {
    input_dir: PathBuf,
    devices: DeviceConfig,
    opener: Arc<dyn DeviceOpener>,
    status: Arc<DaemonStatus>,
    poll_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl CaptureContext {
    fn registry(&self) -> DeviceRegistry {
        DeviceRegistry::new(
            self.input_dir.clone(),
            self.devices.clone(),
            self.opener.clone(),
            self.status.clone(),
        )
    }

    fn watch(&self) -> Option<HotplugWatch> {
        match HotplugWatch::new(&self.input_dir) {
            Ok(watch) => Some(watch),
            Err(e) => {
                tracing::warn!("{}; new keyboards will not be picked up", e);
                None
            }
        }
    }

    /// Run the capture loop on a blocking thread.
    ///
    /// Without a prepared registry a fresh one is discovered on that thread.
    fn spawn(
        &self,
        prepared: Option<(DeviceRegistry, Option<HotplugWatch>)>,
        dispatcher: Dispatcher,
    ) -> CaptureTask {
        let ctx = self.clone();
        tokio::task::spawn_blocking(move || {
            let (mut registry, watch) = match prepared {
                Some(prepared) => prepared,
                None => {
                    // Watch first so nodes created during the scan are not missed
                    let watch = ctx.watch();
                    let mut registry = ctx.registry();
                    if let Err(e) = registry.discover() {
                        tracing::warn!("{}", e);
                    }
                    (registry, watch)
                }
            };

            let mut mux = Multiplexer::new(dispatcher, watch, ctx.poll_timeout);
            mux.run(&mut registry, &ctx.stop).map(|()| registry)
        })
    }
}

/// Move events from the counter queue into the store until every sender is
/// gone. Returns the number of keystrokes counted.
async fn count_events(mut rx: mpsc::UnboundedReceiver<KeyEvent>, store: Arc<CounterStore>) -> u64 {
    let mut counted = 0;
    while let Some(event) = rx.recv().await {
        if store.record(&event) {
            counted += 1;
        }
    }
    counted
}

/// Main daemon that orchestrates all components
pub struct Daemon {
    config: Config,
    backends: Backends,
    store: Arc<CounterStore>,
    status: Arc<DaemonStatus>,
    shutdown_requested: Arc<Notify>,
    checkpoint_requested: Arc<Notify>,
}

impl Daemon {
    /// Create a daemon reading real keyboards
    pub fn new(config: Config) -> Self {
        let backends = Backends::system(&config);
        Self::with_backends(config, backends)
    }

    /// Create a daemon with explicit device and audio backends
    pub fn with_backends(config: Config, backends: Backends) -> Self {
        let store = Arc::new(CounterStore::new(config.resolve_counter_file()));
        Self {
            config,
            backends,
            store,
            status: Arc::new(DaemonStatus::new()),
            shutdown_requested: Arc::new(Notify::new()),
            checkpoint_requested: Arc::new(Notify::new()),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            store: self.store.clone(),
            status: self.status.clone(),
            shutdown: self.shutdown_requested.clone(),
            checkpoint: self.checkpoint_requested.clone(),
        }
    }

    /// Open the output device on a blocking thread; the first open can take
    /// a while
    async fn start_audio(&mut self) -> Option<AudioEngine> {
        if !self.config.audio.enabled {
            tracing::info!("Click feedback disabled");
            return None;
        }
        let factory = self.backends.sinks.take()?;
        let config = self.config.audio.clone();
        let restarts = self.config.supervisor.audio_restarts;
        let status = self.status.clone();

        let started = tokio::task::spawn_blocking(move || {
            let click = sample::load_click(&config.sample);
            AudioEngine::start(&config, click, factory, restarts, status)
        })
        .await;

        match started {
            Ok(Ok(engine)) => Some(engine),
            Ok(Err(e)) => {
                tracing::warn!("{}; continuing without click feedback", e);
                None
            }
            Err(e) => {
                tracing::warn!("Audio startup task failed: {}; continuing without click feedback", e);
                None
            }
        }
    }

    /// Write a checkpoint off the async threads, then refresh the status file
    async fn checkpoint(&self, status_file: &mut Option<StatusFile>, force: bool) {
        if force || self.store.is_dirty() {
            let store = self.store.clone();
            match tokio::task::spawn_blocking(move || store.checkpoint()).await {
                Ok(Ok(state)) => tracing::debug!(
                    "Checkpoint #{} committed ({} keystrokes)",
                    state.sequence,
                    state.total
                ),
                Ok(Err(e)) => tracing::warn!("{}; keeping counts in memory until the next attempt", e),
                Err(e) => tracing::error!("Checkpoint task failed: {}", e),
            }
        }

        if let Some(file) = status_file {
            file.update(self.store.snapshot().total);
        }
    }

    /// Run the daemon until a shutdown signal or an unrecoverable capture
    /// failure
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!("Starting keytally daemon");

        // Single instance and PID file for `keytally stop` / `keytally checkpoint`
        let mut lock = None;
        let mut pid_file_path = None;
        if let Some(runtime_dir) = self.backends.runtime_dir.clone() {
            self.config.ensure_directories()?;
            lock = Some(acquire_lock(&runtime_dir)?);
            pid_file_path = write_pid_file(&runtime_dir.join("pid"));
        }

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| KeytallyError::Config(format!("Failed to set up SIGTERM handler: {}", e)))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| KeytallyError::Config(format!("Failed to set up SIGINT handler: {}", e)))?;
        let mut sigusr1 = signal(SignalKind::user_defined1())
            .map_err(|e| KeytallyError::Config(format!("Failed to set up SIGUSR1 handler: {}", e)))?;

        let ctx = CaptureContext {
            input_dir: self.backends.input_dir.clone(),
            devices: self.config.devices.clone(),
            opener: self.backends.opener.clone(),
            status: self.status.clone(),
            poll_timeout: Duration::from_millis(self.config.supervisor.poll_timeout_ms.max(1)),
            stop: Arc::new(AtomicBool::new(false)),
        };

        let _stop_capture = StopOnDrop(ctx.stop.clone());

        // 1. Devices
        let watch = ctx.watch();
        let mut registry = ctx.registry();
        let found = match registry.discover() {
            Ok(found) => found,
            Err(e) => {
                release_runtime_files(pid_file_path, lock);
                return Err(e.into());
            }
        };
        tracing::info!("Counting keystrokes from {} keyboard(s)", found);
        for device in registry.devices() {
            tracing::debug!(
                "  #{} {} ({:?}){}",
                device.id(),
                device.name(),
                device.path(),
                if device.is_grabbed() { " [grabbed]" } else { "" }
            );
        }

        // 2. Counts
        self.store.load(self.config.counter.reset_on_start);
        tracing::info!("Counter file: {:?}", self.store.path());

        let mut status_file = self.config.resolve_status_file().map(StatusFile::new);
        if let Some(ref file) = status_file {
            tracing::info!("Status file: {:?}", file.path());
        }
        if self.config.counter.reset_on_start {
            // Replace the old file now so `keytally show` agrees with the daemon
            self.checkpoint(&mut status_file, true).await;
        } else if let Some(ref mut file) = status_file {
            file.update(self.store.snapshot().total);
        }

        // 3. Clicks
        let audio = self.start_audio().await;

        // 4. Capture
        let (counter_tx, counter_rx) = mpsc::unbounded_channel();
        let counter_task = tokio::spawn(count_events(counter_rx, self.store.clone()));

        let dispatcher = Dispatcher::new(counter_tx.clone(), audio.as_ref().map(|a| a.producer()));
        let mut capture: Option<CaptureTask> = Some(ctx.spawn(Some((registry, watch)), dispatcher));

        let period = Duration::from_secs(self.config.counter.checkpoint_interval_secs.max(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let restart_budget = self.config.supervisor.capture_restarts;
        let mut failures = 0u32;

        let outcome: std::result::Result<(), CaptureError> = loop {
            tokio::select! {
                Some(joined) = async {
                    match &mut capture {
                        Some(task) => Some(task.await),
                        None => std::future::pending().await,
                    }
                } => {
                    capture = None;
                    let reason = match joined {
                        Ok(Ok(_)) => "capture loop exited".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) if e.is_panic() => CaptureError::Panicked(panic_message(e.into_panic())).to_string(),
                        Err(e) => e.to_string(),
                    };

                    failures += 1;
                    if failures > restart_budget {
                        tracing::error!("{}; restart budget of {} used up", reason, restart_budget);
                        break Err(CaptureError::Exhausted(failures));
                    }
                    tracing::warn!(
                        "{}; restarting capture ({}/{})",
                        reason,
                        failures,
                        restart_budget
                    );

                    // The previous producer died with the old thread
                    let dispatcher = Dispatcher::new(counter_tx.clone(), audio.as_ref().map(|a| a.producer()));
                    capture = Some(ctx.spawn(None, dispatcher));
                }

                _ = ticker.tick() => {
                    self.checkpoint(&mut status_file, false).await;
                }

                _ = sigusr1.recv() => {
                    tracing::info!("Received SIGUSR1, writing checkpoint");
                    self.checkpoint(&mut status_file, true).await;
                }

                _ = self.checkpoint_requested.notified() => {
                    self.checkpoint(&mut status_file, true).await;
                }

                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down...");
                    break Ok(());
                }

                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, shutting down...");
                    break Ok(());
                }

                _ = self.shutdown_requested.notified() => {
                    tracing::info!("Shutdown requested");
                    break Ok(());
                }
            }
        };

        // Stop capture first so nothing new enters the counter queue
        ctx.stop.store(true, Ordering::Release);
        if let Some(task) = capture.take() {
            match task.await {
                Ok(Ok(mut registry)) => registry.close_all(),
                Ok(Err(e)) => tracing::warn!("Capture loop ended with error: {}", e),
                Err(e) => tracing::warn!("Capture task failed during shutdown: {}", e),
            }
        }

        drop(counter_tx);
        match counter_task.await {
            Ok(counted) => tracing::debug!("Counter queue drained, {} keystrokes this session", counted),
            Err(e) => tracing::error!("Counter task failed: {}", e),
        }

        self.checkpoint(&mut status_file, false).await;
        let snapshot = self.store.snapshot();
        tracing::info!(
            "Final count: {} keystrokes (checkpoint #{})",
            snapshot.total,
            snapshot.sequence
        );

        if let Some(engine) = audio {
            if let Err(e) = tokio::task::spawn_blocking(move || engine.shutdown()).await {
                tracing::warn!("Audio shutdown failed: {}", e);
            }
        }

        if let Some(ref file) = status_file {
            file.cleanup();
        }
        release_runtime_files(pid_file_path, lock);

        tracing::info!("Daemon stopped");
        outcome.map_err(KeytallyError::from)
    }
}
