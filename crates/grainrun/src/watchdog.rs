//! # Process Watchdog
//!
//! Owns at most one worker process at a time.
//!
//! `start` spawns the worker with this process's id as its first argument,
//! then reads the startup lines from its stdout (see [`crate::startup`]).
//! The pid and a kill handle are recorded as soon as the process exists, so
//! `try_kill` reaches a worker that is still starting. The port is exposed
//! only once the ready marker has been seen.
//!
//! ## Invariants
//! - Running and failed are mutually exclusive; a failed watchdog has no pid
//!   and no port.
//! - Only an exit the watchdog did not cause is reported as `ProcessExited`.
//! - `start` always tears down the previous process first, so it can be
//!   called again right after a kill or a crash.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use grainrpc::RemoteException;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::io::Lines;
use tokio::process::Child;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::settings::WatchdogSettings;
use crate::startup;

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("worker exited before it was ready: {0}")]
    ExitedBeforeReady(String),

    #[error("worker failed to start: {0}")]
    Startup(RemoteException),

    #[error("unexpected startup output: {0}")]
    Handshake(String),

    #[error("worker not ready after {0:?}")]
    Timeout(Duration),

    #[error("worker was killed before it was ready")]
    KilledBeforeReady,

    #[error("watchdog has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, WatchdogError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogEvent {
    ProcessExited { pid: u32, status: Option<i32> },
}

#[derive(Default)]
struct WatchState {
    generation: u64,
    pid: Option<u32>,
    port: Option<u16>,
    running: bool,
    failed: bool,
    disposed: bool,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
}

type StdoutLines = Lines<BufReader<ChildStdout>>;

pub struct ProcessWatchdog {
    settings: WatchdogSettings,
    env: Vec<(String, String)>,
    state: Arc<Mutex<WatchState>>,
    events: broadcast::Sender<WatchdogEvent>,
}

fn lock(state: &Mutex<WatchState>) -> MutexGuard<'_, WatchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessWatchdog {
    pub fn new(settings: WatchdogSettings) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            settings,
            env: Vec::new(),
            state: Arc::new(Mutex::new(WatchState::default())),
            events,
        }
    }

    /// Adds an environment variable for every spawned worker.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn host_pid(&self) -> Option<u32> {
        lock(&self.state).pid
    }

    pub fn remote_port(&self) -> Option<u16> {
        lock(&self.state).port
    }

    pub fn is_process_running(&self) -> bool {
        lock(&self.state).running
    }

    pub fn has_process_failed(&self) -> bool {
        lock(&self.state).failed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.events.subscribe()
    }

    /// Spawns a fresh worker and waits for it to become ready. Returns its port.
    pub async fn start(&self) -> Result<u16> {
        if lock(&self.state).disposed {
            return Err(WatchdogError::Disposed);
        }
        self.terminate(false).await;

        let path = self.settings.executable.display().to_string();
        let mut command = Command::new(&self.settings.executable);
        command
            .arg(std::process::id().to_string())
            .args(&self.settings.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|source| WatchdogError::Spawn { path: path.clone(), source })?;
        let pid = child.id().unwrap_or_default();
        debug!(pid, %path, "spawned worker");

        let (kill_tx, mut kill_rx) = oneshot::channel();
        let generation = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.pid = Some(pid);
            state.port = None;
            state.running = false;
            state.failed = false;
            state.kill = Some(kill_tx);
            state.generation
        };

        let Some(stdout) = child.stdout.take() else {
            self.abandon(child, generation).await;
            return Err(WatchdogError::Handshake("worker stdout was not captured".into()));
        };
        let mut lines = BufReader::new(stdout).lines();

        let timeout = self.settings.ready_timeout;
        let startup = tokio::select! {
            result = tokio::time::timeout(timeout, read_startup(&mut lines)) => Some(result),
            _ = &mut kill_rx => None,
        };
        let port = match startup {
            Some(Ok(Ok(port))) => port,
            Some(Ok(Err(WatchdogError::ExitedBeforeReady(reason)))) => {
                let status = self.abandon(child, generation).await;
                return Err(WatchdogError::ExitedBeforeReady(format!("{} ({})", reason, status)));
            }
            Some(Ok(Err(e))) => {
                self.abandon(child, generation).await;
                return Err(e);
            }
            Some(Err(_)) => {
                self.abandon(child, generation).await;
                return Err(WatchdogError::Timeout(timeout));
            }
            None => {
                self.abandon(child, generation).await;
                return Err(WatchdogError::KilledBeforeReady);
            }
        };

        let installed = {
            let mut state = lock(&self.state);
            if state.generation == generation {
                state.port = Some(port);
                state.running = true;
                true
            } else {
                false
            }
        };
        if !installed {
            self.abandon(child, generation).await;
            return Err(WatchdogError::KilledBeforeReady);
        }

        let monitor = tokio::spawn(monitor(
            child,
            lines,
            kill_rx,
            pid,
            generation,
            self.state.clone(),
            self.events.clone(),
        ));
        lock(&self.state).monitor = Some(monitor);

        info!(pid, port, "worker ready");
        Ok(port)
    }

    /// Kills the worker, if any, and leaves the watchdog failed and clean.
    pub async fn try_kill(&self) -> bool {
        let killed = self.terminate(true).await;
        if let Some(pid) = killed {
            info!(pid, "worker killed");
        }
        killed.is_some()
    }

    pub async fn dispose(&self) {
        lock(&self.state).disposed = true;
        self.terminate(false).await;
    }

    async fn terminate(&self, mark_failed: bool) -> Option<u32> {
        let (kill, monitor, pid) = {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.port = None;
            state.running = false;
            if mark_failed {
                state.failed = true;
            }
            (state.kill.take(), state.monitor.take(), state.pid.take())
        };
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }
        pid
    }

    /// Kills a worker that never became ready and marks the watchdog failed.
    async fn abandon(&self, mut child: Child, generation: u64) -> String {
        let _ = child.start_kill();
        let status = match child.wait().await {
            Ok(status) => status.to_string(),
            Err(e) => e.to_string(),
        };
        let mut state = lock(&self.state);
        if state.generation == generation {
            state.pid = None;
            state.port = None;
            state.running = false;
            state.kill = None;
        }
        state.failed = true;
        status
    }
}

impl Drop for ProcessWatchdog {
    fn drop(&mut self) {
        if let Some(kill) = lock(&self.state).kill.take() {
            let _ = kill.send(());
        }
    }
}

async fn read_startup(lines: &mut StdoutLines) -> Result<u16> {
    let mut booted = false;
    let mut port = None;

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| WatchdogError::Handshake(e.to_string()))?
    {
        if let Some(exception) = startup::parse_exception_line(&line) {
            return Err(WatchdogError::Startup(exception));
        }
        let line = line.trim();
        if !booted {
            booted = line == startup::BOOT_MARKER;
            if !booted {
                debug!("worker: {}", line);
            }
            continue;
        }
        match port {
            None => {
                let parsed = line
                    .parse::<u16>()
                    .map_err(|_| WatchdogError::Handshake(format!("expected a port, got {:?}", line)))?;
                port = Some(parsed);
            }
            Some(port) if line == startup::READY_MARKER => return Ok(port),
            Some(_) => debug!("worker: {}", line),
        }
    }
    Err(WatchdogError::ExitedBeforeReady("stdout closed".into()))
}

async fn monitor(
    mut child: Child,
    mut lines: StdoutLines,
    kill: oneshot::Receiver<()>,
    pid: u32,
    generation: u64,
    state: Arc<Mutex<WatchState>>,
    events: broadcast::Sender<WatchdogEvent>,
) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() == startup::SHUTDOWN_MARKER {
                debug!(pid, "worker is shutting down");
            } else {
                debug!(pid, "worker: {}", line);
            }
        }
    });

    tokio::select! {
        _ = kill => {
            if let Err(e) = child.kill().await {
                warn!(pid, "failed to kill worker: {}", e);
            }
        }
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            let unexpected = {
                let mut state = lock(&state);
                if state.generation == generation {
                    state.pid = None;
                    state.port = None;
                    state.running = false;
                    state.failed = true;
                    state.kill = None;
                    true
                } else {
                    false
                }
            };
            if unexpected {
                warn!(pid, ?code, "worker exited unexpectedly");
                let _ = events.send(WatchdogEvent::ProcessExited { pid, status: code });
            }
        }
    }
}
