//! Playback thread
//!
//! The thread opens the output device once, then sleeps until the capture
//! loop pushes a trigger. Device errors lead to a bounded number of reopen
//! attempts with exponential backoff; once those are used up, or once the
//! thread has panicked more than the restart budget allows, click feedback
//! is switched off for the rest of the session. Counting is never affected.

use super::{AudioSample, ClickSink, SinkFactory, TriggerRing};
use crate::config::AudioConfig;
use crate::error::AudioError;
use crate::status::DaemonStatus;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Longest the thread parks before rechecking the shutdown flag
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Clicks older than this when dequeued are skipped
const STALE_AFTER: Duration = Duration::from_millis(200);

/// How long `start` waits for the first open attempt
const STARTUP_WAIT: Duration = Duration::from_secs(2);

/// Retry policy for reopening the output device
#[derive(Debug, Clone, Copy)]
pub struct ReopenPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl From<&AudioConfig> for ReopenPolicy {
    fn from(config: &AudioConfig) -> Self {
        Self {
            attempts: config.reopen_attempts,
            backoff: Duration::from_millis(config.reopen_backoff_ms),
        }
    }
}

/// Why a playback loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackExit {
    Shutdown,
    Exhausted,
}

/// State shared by every run of the playback loop
struct Playback {
    ring: Arc<TriggerRing>,
    sample: AudioSample,
    factory: Box<dyn SinkFactory>,
    policy: ReopenPolicy,
    shutdown: Arc<AtomicBool>,
    status: Arc<DaemonStatus>,
}

impl Playback {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Sleep for `duration`, waking early on shutdown
    fn backoff(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout((deadline - now).min(IDLE_WAIT));
        }
    }

    /// Try to open the device, retrying with doubling backoff
    fn reopen(&self) -> Option<Box<dyn ClickSink>> {
        let mut delay = self.policy.backoff;
        for attempt in 1..=self.policy.attempts {
            self.backoff(delay);
            if self.stopping() {
                return None;
            }
            match self.factory.open() {
                Ok(sink) => {
                    tracing::info!("Audio output reopened (attempt {})", attempt);
                    return Some(sink);
                }
                Err(e) => {
                    tracing::warn!(
                        "Audio reopen attempt {}/{} failed: {}",
                        attempt,
                        self.policy.attempts,
                        e
                    );
                }
            }
            delay = delay.saturating_mul(2);
        }
        None
    }

    fn run(&self, first_open: Option<Result<Box<dyn ClickSink>, AudioError>>) -> PlaybackExit {
        let opened = first_open.unwrap_or_else(|| self.factory.open());
        let mut sink = match opened {
            Ok(sink) => sink,
            Err(e) => {
                tracing::warn!("{}", e);
                match self.reopen() {
                    Some(sink) => sink,
                    None if self.stopping() => return PlaybackExit::Shutdown,
                    None => return PlaybackExit::Exhausted,
                }
            }
        };

        loop {
            if self.stopping() {
                return PlaybackExit::Shutdown;
            }

            while let Some(at) = self.ring.pop() {
                if at.elapsed() > STALE_AFTER {
                    self.status.click_dropped();
                    continue;
                }
                match sink.play(&self.sample) {
                    Ok(()) => self.status.click_played(),
                    Err(e) => {
                        tracing::warn!("{}", e);
                        sink = match self.reopen() {
                            Some(sink) => sink,
                            None if self.stopping() => return PlaybackExit::Shutdown,
                            None => return PlaybackExit::Exhausted,
                        };
                    }
                }
            }

            thread::park_timeout(IDLE_WAIT);
        }
    }
}

/// Handle on the playback thread
pub struct AudioEngine {
    ring: Arc<TriggerRing>,
    shutdown: Arc<AtomicBool>,
    status: Arc<DaemonStatus>,
    handle: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Spawn the playback thread and wait briefly for the first device open
    pub fn start(
        config: &AudioConfig,
        sample: AudioSample,
        factory: Box<dyn SinkFactory>,
        restarts: u32,
        status: Arc<DaemonStatus>,
    ) -> Result<Self, AudioError> {
        let ring = Arc::new(TriggerRing::new(config.queue_capacity));
        let shutdown = Arc::new(AtomicBool::new(false));

        let playback = Playback {
            ring: ring.clone(),
            sample,
            factory,
            policy: ReopenPolicy::from(config),
            shutdown: shutdown.clone(),
            status: status.clone(),
        };

        status.set_audio_enabled(true);
        let (ready_tx, ready_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("keytally-audio".to_string())
            .spawn(move || supervise(playback, restarts, ready_tx))
            .map_err(|e| AudioError::Unavailable(format!("Failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv_timeout(STARTUP_WAIT) {
            Ok(Ok(())) => tracing::info!(
                "Audio feedback enabled (volume: {:.0}%)",
                config.volume * 100.0
            ),
            Ok(Err(e)) => tracing::warn!("{}, retrying in the background", e),
            Err(_) => tracing::debug!("Audio output still opening"),
        }

        Ok(Self {
            ring,
            shutdown,
            status,
            handle: Some(handle),
        })
    }

    /// Producer handle for the capture loop.
    ///
    /// The ring has a single producer: only one handle may be in use at a
    /// time.
    pub fn producer(&self) -> ClickProducer {
        ClickProducer {
            ring: self.ring.clone(),
            status: self.status.clone(),
        }
    }

    /// Whether clicks are still being played
    pub fn is_enabled(&self) -> bool {
        !self.ring.is_closed()
    }

    /// Stop the playback thread and close the device
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                tracing::warn!("Playback thread panicked during shutdown");
            }
            tracing::debug!("Audio feedback stopped");
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the playback loop, restarting it after panics within budget
fn supervise(playback: Playback, restarts: u32, ready: mpsc::Sender<Result<(), AudioError>>) {
    playback.ring.set_consumer(thread::current());

    let first = playback.factory.open();
    let _ = ready.send(first.as_ref().map(|_| ()).map_err(|e| AudioError::Unavailable(e.to_string())));
    let mut first = Some(first);

    let mut failures = 0u32;
    loop {
        let open = first.take();
        let result = panic::catch_unwind(AssertUnwindSafe(|| playback.run(open)));
        match result {
            Ok(PlaybackExit::Shutdown) => break,
            Ok(PlaybackExit::Exhausted) => {
                tracing::warn!("Audio output unavailable, click feedback disabled for this session");
                break;
            }
            Err(_) => {
                failures += 1;
                if failures > restarts {
                    tracing::error!(
                        "Playback thread failed {} times, click feedback disabled",
                        failures
                    );
                    break;
                }
                tracing::warn!(
                    "Playback thread panicked, restarting ({}/{})",
                    failures,
                    restarts
                );
            }
        }
    }

    playback.ring.close();
    playback.status.set_audio_enabled(false);
}

/// Capture-side handle that queues clicks
pub struct ClickProducer {
    ring: Arc<TriggerRing>,
    status: Arc<DaemonStatus>,
}

impl ClickProducer {
    /// Queue a click for a key-down at `at`; never blocks
    pub fn trigger(&self, at: Instant) -> bool {
        if self.ring.is_closed() {
            return false;
        }
        let queued = self.ring.push(at);
        if !queued {
            self.status.click_dropped();
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    struct CountingSink {
        plays: Arc<AtomicU32>,
        fail: bool,
    }

    impl ClickSink for CountingSink {
        fn play(&mut self, _sample: &AudioSample) -> Result<(), AudioError> {
            if self.fail {
                return Err(AudioError::Playback("device unplugged".to_string()));
            }
            self.plays.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Scripted factory: each open pops the next outcome, then repeats the last
    struct ScriptedFactory {
        outcomes: Mutex<Vec<Outcome>>,
        opens: Arc<AtomicU32>,
        plays: Arc<AtomicU32>,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Outcome {
        Ok,
        FailOpen,
        FailPlay,
        Panic,
    }

    impl SinkFactory for ScriptedFactory {
        fn open(&self) -> Result<Box<dyn ClickSink>, AudioError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let outcome = {
                let mut outcomes = self.outcomes.lock().unwrap();
                if outcomes.len() > 1 {
                    outcomes.remove(0)
                } else {
                    outcomes[0]
                }
            };
            match outcome {
                Outcome::Ok => Ok(Box::new(CountingSink {
                    plays: self.plays.clone(),
                    fail: false,
                })),
                Outcome::FailPlay => Ok(Box::new(CountingSink {
                    plays: self.plays.clone(),
                    fail: true,
                })),
                Outcome::FailOpen => Err(AudioError::Unavailable("device busy".to_string())),
                Outcome::Panic => panic!("driver crashed"),
            }
        }
    }

    fn factory(outcomes: &[Outcome]) -> (Box<ScriptedFactory>, Arc<AtomicU32>, Arc<AtomicU32>) {
        let opens = Arc::new(AtomicU32::new(0));
        let plays = Arc::new(AtomicU32::new(0));
        let f = ScriptedFactory {
            outcomes: Mutex::new(outcomes.to_vec()),
            opens: opens.clone(),
            plays: plays.clone(),
        };
        (Box::new(f), opens, plays)
    }

    fn config() -> AudioConfig {
        AudioConfig {
            enabled: true,
            queue_capacity: 8,
            reopen_attempts: 2,
            reopen_backoff_ms: 1,
            ..AudioConfig::default()
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    fn click() -> AudioSample {
        AudioSample::new(44100, 1, vec![0; 16])
    }

    #[test]
    fn test_triggers_are_played() {
        let status = Arc::new(DaemonStatus::new());
        let (f, _, plays) = factory(&[Outcome::Ok]);
        let engine = AudioEngine::start(&config(), click(), f, 1, status.clone()).unwrap();
        let producer = engine.producer();

        for _ in 0..3 {
            assert!(producer.trigger(Instant::now()));
            assert!(wait_for(|| engine.ring.is_empty()));
        }

        assert!(wait_for(|| plays.load(Ordering::SeqCst) == 3));
        assert!(status.report().audio_enabled);
        engine.shutdown();
        assert!(!status.report().audio_enabled);
    }

    #[test]
    fn test_open_failure_recovers_within_budget() {
        let status = Arc::new(DaemonStatus::new());
        let (f, opens, plays) = factory(&[Outcome::FailOpen, Outcome::FailOpen, Outcome::Ok]);
        let engine = AudioEngine::start(&config(), click(), f, 1, status.clone()).unwrap();

        assert!(wait_for(|| opens.load(Ordering::SeqCst) == 3));
        assert!(engine.producer().trigger(Instant::now()));
        assert!(wait_for(|| plays.load(Ordering::SeqCst) == 1));
        assert!(engine.is_enabled());
        engine.shutdown();
    }

    #[test]
    fn test_exhausted_retries_disable_audio() {
        let status = Arc::new(DaemonStatus::new());
        let (f, opens, _) = factory(&[Outcome::FailOpen]);
        let engine = AudioEngine::start(&config(), click(), f, 1, status.clone()).unwrap();

        assert!(wait_for(|| !status.report().audio_enabled));
        // Initial open plus two reopen attempts
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert!(!engine.is_enabled());
        assert!(!engine.producer().trigger(Instant::now()));
        engine.shutdown();
    }

    #[test]
    fn test_play_error_triggers_reopen() {
        let status = Arc::new(DaemonStatus::new());
        let (f, opens, plays) = factory(&[Outcome::FailPlay, Outcome::Ok]);
        let engine = AudioEngine::start(&config(), click(), f, 1, status.clone()).unwrap();
        let producer = engine.producer();

        producer.trigger(Instant::now());
        assert!(wait_for(|| opens.load(Ordering::SeqCst) == 2));
        producer.trigger(Instant::now());
        assert!(wait_for(|| plays.load(Ordering::SeqCst) == 1));
        assert!(engine.is_enabled());
        engine.shutdown();
    }

    #[test]
    fn test_device_lost_after_startup_disables_audio() {
        let status = Arc::new(DaemonStatus::new());
        // Startup open works, the device then fails and never comes back
        let (f, opens, plays) = factory(&[Outcome::FailPlay, Outcome::FailOpen]);
        let engine = AudioEngine::start(&config(), click(), f, 1, status.clone()).unwrap();
        assert!(status.report().audio_enabled);

        assert!(engine.producer().trigger(Instant::now()));
        assert!(wait_for(|| !status.report().audio_enabled));
        // Startup open plus both reopen attempts; no panic restarts involved
        assert_eq!(opens.load(Ordering::SeqCst), 3);
        assert_eq!(plays.load(Ordering::SeqCst), 0);
        assert!(!engine.is_enabled());
        assert!(!engine.producer().trigger(Instant::now()));
        engine.shutdown();
    }

    #[test]
    fn test_repeated_panics_disable_audio() {
        let status = Arc::new(DaemonStatus::new());
        // First open (at startup) succeeds, every restart panics
        let (f, opens, _) = factory(&[Outcome::FailPlay, Outcome::Panic]);
        let engine = AudioEngine::start(&config(), click(), f, 2, status.clone()).unwrap();

        engine.producer().trigger(Instant::now());
        assert!(wait_for(|| !status.report().audio_enabled));
        // startup open + reopen panic + two restarts that panic on open
        assert_eq!(opens.load(Ordering::SeqCst), 4);
        engine.shutdown();
    }

    #[test]
    fn test_full_ring_counts_drops() {
        let status = Arc::new(DaemonStatus::new());
        let ring = Arc::new(TriggerRing::new(2));
        let producer = ClickProducer {
            ring: ring.clone(),
            status: status.clone(),
        };
        let now = Instant::now();
        assert!(producer.trigger(now));
        assert!(producer.trigger(now));
        assert!(!producer.trigger(now));
        assert_eq!(status.report().clicks_dropped, 1);
        assert_eq!(ring.dropped(), 1);
    }
}
