//! # Heartbeat Monitor
//!
//! Detects a remote endpoint that is still connected at the transport level
//! but no longer answers, which a plain disconnect would never reveal.
//!
//! ## Loop
//! 1. Start a beat. If it is rejected immediately because the connection is
//!    already known to be down, stop silently.
//! 2. Wait for it for at most `interval + threshold * interval`.
//! 3. A timeout (unless ignored because a debugger is attached) or a faulted
//!    beat is a failure: report it once and stop.
//! 4. Otherwise count the beat and sleep for what remains of the interval.
//!
//! ## Invariants
//! - At most one failure is reported per `start`.
//! - After `stop` or `dispose`, no failure is reported, even by a beat that
//!   was already in flight.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::broadcast;
use tracing::debug;
use tracing::warn;

use crate::error::CallError;
use crate::settings::HeartbeatSettings;

/// A remote liveness check.
pub trait Heartbeat: Send + Sync + 'static {
    /// Starts one beat.
    ///
    /// Returns `Err` immediately when the remote is already known to be
    /// unreachable; the returned future completes when the remote answered.
    fn beat(&self) -> Result<BoxFuture<'static, Result<(), CallError>>, CallError>;
}

/// Tells whether this process is being debugged.
pub trait Debugger: Send + Sync + 'static {
    fn is_attached(&self) -> bool;
}

/// Reads the tracer of the current process from procfs.
pub struct ProcessDebugger;

impl Debugger for ProcessDebugger {
    #[cfg(target_os = "linux")]
    fn is_attached(&self) -> bool {
        let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
            return false;
        };
        status
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .and_then(|pid| pid.trim().parse::<u32>().ok())
            .is_some_and(|pid| pid != 0)
    }

    #[cfg(not(target_os = "linux"))]
    fn is_attached(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// No answer within the failure interval.
    TimedOut(Duration),
    /// The beat itself failed.
    Faulted(String),
}

impl std::fmt::Display for HeartbeatFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TimedOut(after) => write!(f, "no heartbeat answer within {:?}", after),
            Self::Faulted(reason) => write!(f, "heartbeat failed: {}", reason),
        }
    }
}

#[derive(Default)]
struct MonitorState {
    generation: u64,
    started: bool,
    disposed: bool,
    failure_detected: bool,
    num_heartbeats: u64,
    last_heartbeat: Option<Instant>,
}

struct MonitorInner {
    heartbeat: Arc<dyn Heartbeat>,
    debugger: Arc<dyn Debugger>,
    settings: HeartbeatSettings,
    state: Mutex<MonitorState>,
    failures: broadcast::Sender<HeartbeatFailure>,
}

pub struct HeartbeatMonitor {
    inner: Arc<MonitorInner>,
}

impl HeartbeatMonitor {
    pub fn new(heartbeat: Arc<dyn Heartbeat>, settings: HeartbeatSettings) -> Self {
        Self::with_debugger(heartbeat, Arc::new(ProcessDebugger), settings)
    }

    pub fn with_debugger(heartbeat: Arc<dyn Heartbeat>, debugger: Arc<dyn Debugger>, settings: HeartbeatSettings) -> Self {
        let (failures, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(MonitorInner {
                heartbeat,
                debugger,
                settings,
                state: Mutex::new(MonitorState::default()),
                failures,
            }),
        }
    }

    pub fn settings(&self) -> &HeartbeatSettings {
        &self.inner.settings
    }

    /// Clears a previous failure and starts the loop on its own task.
    pub fn start(&self) {
        let generation = {
            let mut state = self.inner.lock();
            if state.disposed || state.started {
                return;
            }
            state.generation += 1;
            state.started = true;
            state.failure_detected = false;
            state.generation
        };
        tokio::spawn(self.inner.clone().run(generation));
    }

    /// Asks the loop to exit at its next check point.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        state.started = false;
        state.generation += 1;
    }

    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        state.disposed = true;
        state.started = false;
        state.generation += 1;
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn failure_detected(&self) -> bool {
        self.inner.lock().failure_detected
    }

    pub fn num_heartbeats(&self) -> u64 {
        self.inner.lock().num_heartbeats
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.inner.lock().last_heartbeat
    }

    /// Every failure is delivered to every subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<HeartbeatFailure> {
        self.inner.failures.subscribe()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.started && state.generation == generation
    }

    fn reports_timeouts(&self) -> bool {
        self.settings.report_with_debugger || !self.debugger.is_attached()
    }

    async fn run(self: Arc<Self>, generation: u64) {
        let failure_interval = self.settings.failure_interval();
        debug!(?failure_interval, "heartbeat monitor started");

        while self.is_current(generation) {
            let started = Instant::now();
            let beat = match self.heartbeat.beat() {
                Ok(beat) => beat,
                Err(e) => {
                    debug!("heartbeat monitor stopping, remote already unreachable: {}", e);
                    break;
                }
            };

            match tokio::time::timeout(failure_interval, beat).await {
                Err(_) if self.reports_timeouts() => {
                    self.report_failure(generation, HeartbeatFailure::TimedOut(failure_interval));
                    break;
                }
                Err(_) => {
                    debug!("heartbeat timed out while a debugger is attached, ignoring");
                }
                Ok(Err(e)) => {
                    self.report_failure(generation, HeartbeatFailure::Faulted(e.to_string()));
                    break;
                }
                Ok(Ok(())) => {
                    {
                        let mut state = self.lock();
                        state.num_heartbeats += 1;
                        state.last_heartbeat = Some(Instant::now());
                    }
                    let remaining = self.settings.interval.saturating_sub(started.elapsed());
                    if !remaining.is_zero() {
                        tokio::time::sleep(remaining).await;
                    }
                }
            }
        }
        debug!("heartbeat monitor stopped");
    }

    fn report_failure(&self, generation: u64, failure: HeartbeatFailure) {
        {
            let mut state = self.lock();
            if state.disposed || !state.started || state.generation != generation {
                return;
            }
            state.failure_detected = true;
            state.started = false;
        }
        warn!("{}", failure);
        let _ = self.failures.send(failure);
    }
}
