//! # Out-of-Process Silo
//!
//! Hosts grains in a supervised worker process. The silo composes a
//! [`ProcessWatchdog`], a client [`RemotingEndpoint`] and one
//! [`HeartbeatMonitor`] per worker connection.
//!
//! ## Fault handling
//! Process exits, heartbeat failures and dropped connections all feed one
//! queue drained by a single task. Each trigger names the worker or the
//! connection it is about; triggers about anything but the current worker
//! are stale and ignored, so one crash seen three ways restarts once.
//!
//! On restart the silo replays every recorded grain creation against the new
//! worker and rebinds the proxies callers already hold. Calls made while the
//! worker is down fail fast with a connection error.
//!
//! ## Invariants
//! - All worker state changes happen under one async lock, so a grain is
//!   either recorded before a restart (and replayed) or created after it.
//! - Replay runs once per start attempt; the failure handler bounds attempts.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use grainrpc::Payload;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::auth;
use crate::endpoint::EndpointEvent;
use crate::endpoint::RemotingEndpoint;
use crate::error::CallError;
use crate::error::ConnectError;
use crate::failure::Decision;
use crate::failure::FailureHandler;
use crate::failure::Fault;
use crate::failure::RestartOnFailureStrategy;
use crate::failure::StartResolution;
use crate::heartbeat::HeartbeatFailure;
use crate::heartbeat::HeartbeatMonitor;
use crate::host::Activate;
use crate::host::HostError;
use crate::host::SubjectHost;
use crate::ids::ConnectionId;
use crate::interface::Remote;
use crate::proxy::ProxyHandle;
use crate::settings::SettingsError;
use crate::settings::SiloSettings;
use crate::startup;
use crate::typemodel::TypeKind;
use crate::typemodel::TypeModel;
use crate::watchdog::ProcessWatchdog;
use crate::watchdog::WatchdogError;
use crate::watchdog::WatchdogEvent;

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum SiloError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Watchdog(#[from] WatchdogError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error("silo has not been started")]
    NotStarted,

    #[error("silo has been disposed")]
    Disposed,
}

pub type Result<T> = std::result::Result<T, SiloError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiloEvent {
    HostStarted { pid: u32 },
    FaultDetected(Fault),
    HostStopped,
    /// The failure handler gave up restarting; the silo stays failed.
    RestartFailed(String),
}

#[derive(Debug)]
enum Trigger {
    Exited { pid: u32, status: Option<i32> },
    Heartbeat { connection: ConnectionId, failure: HeartbeatFailure },
    Connection { connection: ConnectionId, reason: String },
}

impl Trigger {
    fn concerns(&self, binding: &HostBinding) -> bool {
        match self {
            Trigger::Exited { pid, .. } => *pid == binding.pid,
            Trigger::Heartbeat { connection, .. } | Trigger::Connection { connection, .. } => *connection == binding.connection,
        }
    }

    fn into_fault(self) -> Fault {
        match self {
            Trigger::Exited { pid, status } => Fault::HostProcessExited { pid, status },
            Trigger::Heartbeat { failure, .. } => Fault::HeartbeatFailure(failure),
            Trigger::Connection { reason, .. } => Fault::ConnectionFailure(reason),
        }
    }
}

struct HostBinding {
    connection: ConnectionId,
    pid: u32,
    host: Arc<dyn SubjectHost>,
    heartbeat: Option<(HeartbeatMonitor, JoinHandle<()>)>,
}

impl HostBinding {
    fn stop_heartbeat(&mut self) {
        if let Some((monitor, forward)) = self.heartbeat.take() {
            monitor.dispose();
            forward.abort();
        }
    }
}

/// A grain creation request, kept for replay.
struct GrainRecord {
    implementation: String,
    interface: &'static str,
    args: Payload,
    handle: ProxyHandle,
}

#[derive(Default)]
struct SiloState {
    binding: Option<HostBinding>,
    grains: Vec<GrainRecord>,
}

struct SiloInner {
    settings: SiloSettings,
    endpoint: RemotingEndpoint,
    watchdog: ProcessWatchdog,
    handler: Arc<dyn FailureHandler>,
    types: TypeModel,
    state: tokio::sync::Mutex<SiloState>,
    events: broadcast::Sender<SiloEvent>,
    triggers: mpsc::UnboundedSender<Trigger>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    failed: AtomicBool,
    disposed: AtomicBool,
}

pub struct OutOfProcessSilo {
    inner: Arc<SiloInner>,
}

impl OutOfProcessSilo {
    /// A silo that restarts its worker on every fault. Must be called from
    /// within a tokio runtime.
    pub fn new(settings: SiloSettings) -> Result<Self> {
        Self::with_handler(settings, Arc::new(RestartOnFailureStrategy::default()))
    }

    pub fn with_handler(settings: SiloSettings, handler: Arc<dyn FailureHandler>) -> Result<Self> {
        settings.validate()?;

        let secret = settings.endpoint.secret.clone().unwrap_or_else(auth::challenge);
        let mut endpoint_settings = settings.endpoint.clone();
        endpoint_settings.secret = Some(secret.clone());
        endpoint_settings.connect_timeout = settings.failure.endpoint_connect_timeout;
        let endpoint = RemotingEndpoint::new(endpoint_settings);
        let watchdog = ProcessWatchdog::new(settings.watchdog.clone()).with_env(startup::SECRET_ENV, secret);

        let (events, _) = broadcast::channel(64);
        let (triggers, trigger_rx) = mpsc::unbounded_channel();
        let forward_exits = tokio::spawn(forward_exits(watchdog.subscribe(), triggers.clone()));
        let forward_disconnects = tokio::spawn(forward_disconnects(endpoint.subscribe(), triggers.clone()));

        let inner = Arc::new(SiloInner {
            settings,
            endpoint,
            watchdog,
            handler,
            types: TypeModel::new(),
            state: tokio::sync::Mutex::new(SiloState::default()),
            events,
            triggers,
            tasks: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });
        let faults = tokio::spawn(fault_loop(Arc::downgrade(&inner), trigger_rx));
        inner.lock_tasks().extend([forward_exits, forward_disconnects, faults]);

        Ok(Self { inner })
    }

    pub fn settings(&self) -> &SiloSettings {
        &self.inner.settings
    }

    pub fn endpoint(&self) -> &RemotingEndpoint {
        &self.inner.endpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SiloEvent> {
        self.inner.events.subscribe()
    }

    pub fn host_pid(&self) -> Option<u32> {
        self.inner.watchdog.host_pid()
    }

    pub fn is_process_running(&self) -> bool {
        self.inner.watchdog.is_process_running()
    }

    pub fn has_process_failed(&self) -> bool {
        self.inner.watchdog.has_process_failed()
    }

    /// True once the failure handler gave up on the worker.
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub async fn grain_count(&self) -> usize {
        self.inner.state.lock().await.grains.len()
    }

    /// Starts the worker and replays recorded grains. A no-op while a worker is up.
    pub async fn start(&self) -> Result<()> {
        self.inner.ensure_alive()?;
        let mut state = self.inner.state.lock().await;
        if state.binding.is_some() {
            return Ok(());
        }
        match self.inner.bring_up(&mut state).await {
            Ok(pid) => {
                self.inner.failed.store(false, Ordering::SeqCst);
                info!(pid, "silo started");
                self.inner.emit(SiloEvent::HostStarted { pid });
                Ok(())
            }
            Err(e) => {
                self.inner.tear_down(&mut state).await;
                Err(e)
            }
        }
    }

    /// Creates a `G` inside the worker and returns a proxy to it.
    pub async fn create_grain<G: Activate>(&self, args: &impl Serialize) -> Result<Arc<G::Interface>> {
        let description = self.inner.types.describe::<G>().map_err(HostError::from)?;
        if !matches!(description.kind, TypeKind::ByReference { .. }) {
            return Err(HostError::NotAGrain {
                type_name: description.name.clone(),
                reason: format!("classified as {:?}", description.kind),
            }
            .into());
        }
        let args = Payload::encode(args).map_err(CallError::from)?;
        self.create_grain_by_name::<G::Interface>(&description.name, args).await
    }

    /// Creates the grain registered as `implementation` in the worker.
    pub async fn create_grain_by_name<I: Remote + ?Sized>(&self, implementation: &str, args: Payload) -> Result<Arc<I>> {
        self.inner.ensure_alive()?;
        let mut state = self.inner.state.lock().await;
        let Some(binding) = state.binding.as_ref() else {
            if self.is_failed() {
                return Err(CallError::NotConnected.into());
            }
            return Err(SiloError::NotStarted);
        };

        let id = binding
            .host
            .create_subject(implementation.to_string(), I::NAME.to_string(), args.clone())
            .await?;
        let proxy = self.inner.endpoint.get_or_create_proxy::<I>(id, binding.connection);
        let handle = proxy
            .proxy_handle()
            .cloned()
            .ok_or_else(|| CallError::Protocol(format!("{} proxy has no handle", I::NAME)))?;

        debug!(%id, %implementation, "created grain");
        state.grains.push(GrainRecord {
            implementation: implementation.to_string(),
            interface: I::NAME,
            args,
            handle,
        });
        Ok(proxy)
    }

    /// Stops the worker and releases everything. Waiting callers fail.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }

        let mut state = self.inner.state.lock().await;
        if let Some(mut binding) = state.binding.take() {
            binding.stop_heartbeat();
            if tokio::time::timeout(SHUTDOWN_GRACE, binding.host.shutdown()).await.is_err() {
                debug!(pid = binding.pid, "worker did not acknowledge shutdown");
            }
        }
        state.grains.clear();
        self.inner.watchdog.dispose().await;
        self.inner.endpoint.dispose().await;
        info!("silo disposed");
        self.inner.emit(SiloEvent::HostStopped);
    }
}

impl Drop for OutOfProcessSilo {
    fn drop(&mut self) {
        for task in self.inner.lock_tasks().drain(..) {
            task.abort();
        }
    }
}

impl SiloInner {
    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SiloError::Disposed);
        }
        Ok(())
    }

    fn emit(&self, event: SiloEvent) {
        let _ = self.events.send(event);
    }

    /// Spawns a worker, connects to it and replays every recorded grain.
    async fn bring_up(&self, state: &mut SiloState) -> Result<u32> {
        let port = self.watchdog.start().await?;
        let pid = self
            .watchdog
            .host_pid()
            .ok_or_else(|| WatchdogError::ExitedBeforeReady("exited right after becoming ready".into()))?;
        let connection = self.endpoint.connect(&format!("127.0.0.1:{}", port)).await?;
        let host = self.endpoint.bootstrap::<dyn SubjectHost>(connection);
        state.binding = Some(HostBinding { connection, pid, host: host.clone(), heartbeat: None });

        for record in &state.grains {
            let id = host
                .create_subject(record.implementation.clone(), record.interface.to_string(), record.args.clone())
                .await?;
            self.endpoint.registry().rebind_proxy(&record.handle, id, connection);
        }
        if !state.grains.is_empty() {
            debug!(pid, grains = state.grains.len(), "replayed grains");
        }

        if let Some(binding) = state.binding.as_mut() {
            binding.heartbeat = self.watch_heartbeat(connection);
        }
        Ok(pid)
    }

    /// Stops monitoring, kills the worker and drops its connection.
    async fn tear_down(&self, state: &mut SiloState) {
        let binding = state.binding.take();
        let connection = binding.map(|mut binding| {
            binding.stop_heartbeat();
            binding.connection
        });
        self.watchdog.try_kill().await;
        if let Some(connection) = connection {
            self.endpoint.disconnect(connection).await;
        }
    }

    fn watch_heartbeat(&self, connection: ConnectionId) -> Option<(HeartbeatMonitor, JoinHandle<()>)> {
        let settings = self.settings.failure.heartbeat.clone();
        if !settings.enabled {
            return None;
        }
        let monitor = HeartbeatMonitor::new(Arc::new(self.endpoint.heartbeat(connection)), settings);
        let mut failures = monitor.subscribe();
        let triggers = self.triggers.clone();
        let forward = tokio::spawn(async move {
            if let Ok(failure) = failures.recv().await {
                let _ = triggers.send(Trigger::Heartbeat { connection, failure });
            }
        });
        monitor.start();
        Some((monitor, forward))
    }

    async fn handle(&self, trigger: Trigger) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().await;
        if !state.binding.as_ref().is_some_and(|binding| trigger.concerns(binding)) {
            debug!(?trigger, "ignoring stale trigger");
            return;
        }

        let fault = trigger.into_fault();
        warn!(%fault, "worker fault detected");
        self.emit(SiloEvent::FaultDetected(fault.clone()));

        let decision = self.handler.on_failure(&fault);
        let restarted = match decision {
            Decision::Stop => {
                self.tear_down(&mut state).await;
                self.failed.store(true, Ordering::SeqCst);
                self.emit(SiloEvent::HostStopped);
                false
            }
            Decision::RestartHost => self.restart(&mut state).await,
        };
        self.handler.on_resolution_finished(&fault, decision, restarted);
    }

    async fn restart(&self, state: &mut SiloState) -> bool {
        let mut attempt = 0;
        loop {
            self.tear_down(state).await;
            if self.disposed.load(Ordering::SeqCst) {
                return false;
            }
            attempt += 1;
            let error = match self.bring_up(state).await {
                Ok(pid) => {
                    info!(pid, attempt, "worker restarted");
                    self.failed.store(false, Ordering::SeqCst);
                    self.emit(SiloEvent::HostStarted { pid });
                    return true;
                }
                Err(e) => e.to_string(),
            };

            warn!(attempt, "restart attempt failed: {}", error);
            match self.handler.on_start_failure(attempt, &error) {
                StartResolution::Retry(delay) => tokio::time::sleep(delay).await,
                StartResolution::Stop => {
                    self.tear_down(state).await;
                    self.failed.store(true, Ordering::SeqCst);
                    self.emit(SiloEvent::RestartFailed(error));
                    return false;
                }
            }
        }
    }
}

async fn fault_loop(weak: Weak<SiloInner>, mut triggers: mpsc::UnboundedReceiver<Trigger>) {
    while let Some(trigger) = triggers.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        inner.handle(trigger).await;
    }
}

async fn forward_exits(mut events: broadcast::Receiver<WatchdogEvent>, triggers: mpsc::UnboundedSender<Trigger>) {
    loop {
        match events.recv().await {
            Ok(WatchdogEvent::ProcessExited { pid, status }) => {
                if triggers.send(Trigger::Exited { pid, status }).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "missed watchdog events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn forward_disconnects(mut events: broadcast::Receiver<EndpointEvent>, triggers: mpsc::UnboundedSender<Trigger>) {
    loop {
        match events.recv().await {
            Ok(EndpointEvent::Failure { connection, reason }) | Ok(EndpointEvent::Disconnected { connection, reason }) => {
                if triggers.send(Trigger::Connection { connection, reason }).is_err() {
                    break;
                }
            }
            Ok(EndpointEvent::Connected { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(missed)) => warn!(missed, "missed endpoint events"),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use crate::settings::WatchdogSettings;
    use crate::testing::ReturnsPid;

    struct RecordingHandler {
        decision: Decision,
        start_failures: AtomicU32,
        resolutions: Mutex<Vec<(Fault, Decision, bool)>>,
    }

    impl RecordingHandler {
        fn deciding(decision: Decision) -> Arc<Self> {
            Arc::new(Self {
                decision,
                start_failures: AtomicU32::new(0),
                resolutions: Mutex::new(Vec::new()),
            })
        }

        fn resolutions(&self) -> Vec<(Fault, Decision, bool)> {
            self.resolutions.lock().unwrap().clone()
        }
    }

    impl FailureHandler for RecordingHandler {
        fn on_failure(&self, _fault: &Fault) -> Decision {
            self.decision
        }

        fn on_start_failure(&self, _attempt: u32, _error: &str) -> StartResolution {
            self.start_failures.fetch_add(1, Ordering::SeqCst);
            StartResolution::Stop
        }

        fn on_resolution_finished(&self, fault: &Fault, decision: Decision, restarted: bool) {
            self.resolutions.lock().unwrap().push((fault.clone(), decision, restarted));
        }
    }

    fn unstartable_silo(handler: Arc<RecordingHandler>) -> OutOfProcessSilo {
        OutOfProcessSilo::with_handler(SiloSettings::for_executable("/nonexistent/grain-host"), handler).unwrap()
    }

    fn binding(connection: u64, pid: u32) -> HostBinding {
        let endpoint = RemotingEndpoint::new(Default::default());
        HostBinding {
            connection: ConnectionId(connection),
            pid,
            host: endpoint.bootstrap::<dyn SubjectHost>(ConnectionId(connection)),
            heartbeat: None,
        }
    }

    #[tokio::test]
    async fn test_triggers_about_other_workers_are_stale() {
        let current = binding(1, 100);

        assert!(Trigger::Exited { pid: 100, status: None }.concerns(&current));
        assert!(!Trigger::Exited { pid: 99, status: Some(0) }.concerns(&current));
        assert!(Trigger::Connection { connection: ConnectionId(1), reason: "reset".into() }.concerns(&current));
        assert!(!Trigger::Heartbeat {
            connection: ConnectionId(2),
            failure: HeartbeatFailure::Faulted("gone".into()),
        }
        .concerns(&current));
    }

    #[test]
    fn test_trigger_becomes_fault() {
        let fault = Trigger::Exited { pid: 4, status: Some(9) }.into_fault();
        assert_eq!(fault, Fault::HostProcessExited { pid: 4, status: Some(9) });
    }

    #[tokio::test]
    async fn test_grains_need_a_started_silo() {
        let silo = OutOfProcessSilo::new(SiloSettings::for_executable("/nonexistent/grain-host")).unwrap();

        assert!(matches!(silo.create_grain::<ReturnsPid>(&()).await, Err(SiloError::NotStarted)));
        silo.dispose().await;
        assert!(matches!(silo.start().await, Err(SiloError::Disposed)));
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_start() {
        let settings = SiloSettings {
            watchdog: WatchdogSettings::for_executable("/nonexistent/grain-host"),
            ..SiloSettings::default()
        };
        let silo = OutOfProcessSilo::new(settings).unwrap();

        assert!(matches!(silo.start().await, Err(SiloError::Watchdog(WatchdogError::Spawn { .. }))));
        assert!(silo.has_process_failed());
        assert!(!silo.is_process_running());
        assert_eq!(silo.host_pid(), None);
    }

    #[tokio::test]
    async fn test_failed_restart_finishes_the_resolution() {
        let handler = RecordingHandler::deciding(Decision::RestartHost);
        let silo = unstartable_silo(handler.clone());
        let mut events = silo.subscribe();
        silo.inner.state.lock().await.binding = Some(binding(1, 100));

        silo.inner.handle(Trigger::Exited { pid: 100, status: Some(1) }).await;

        let fault = Fault::HostProcessExited { pid: 100, status: Some(1) };
        assert_eq!(handler.resolutions(), vec![(fault.clone(), Decision::RestartHost, false)]);
        assert_eq!(handler.start_failures.load(Ordering::SeqCst), 1);
        assert!(silo.is_failed());
        assert!(silo.inner.state.lock().await.binding.is_none());
        assert_eq!(events.try_recv().unwrap(), SiloEvent::FaultDetected(fault));
        assert!(matches!(events.try_recv().unwrap(), SiloEvent::RestartFailed(_)));
    }

    #[tokio::test]
    async fn test_stop_finishes_the_resolution() {
        let handler = RecordingHandler::deciding(Decision::Stop);
        let silo = unstartable_silo(handler.clone());
        let mut events = silo.subscribe();
        silo.inner.state.lock().await.binding = Some(binding(1, 100));

        let failure = HeartbeatFailure::Faulted("gone".into());
        silo.inner.handle(Trigger::Heartbeat { connection: ConnectionId(1), failure: failure.clone() }).await;

        let fault = Fault::HeartbeatFailure(failure);
        assert_eq!(handler.resolutions(), vec![(fault.clone(), Decision::Stop, false)]);
        assert_eq!(handler.start_failures.load(Ordering::SeqCst), 0);
        assert!(silo.is_failed());
        assert_eq!(events.try_recv().unwrap(), SiloEvent::FaultDetected(fault));
        assert_eq!(events.try_recv().unwrap(), SiloEvent::HostStopped);
    }

    #[tokio::test]
    async fn test_stale_trigger_is_not_resolved() {
        let handler = RecordingHandler::deciding(Decision::RestartHost);
        let silo = unstartable_silo(handler.clone());
        silo.inner.state.lock().await.binding = Some(binding(1, 100));

        silo.inner.handle(Trigger::Exited { pid: 99, status: None }).await;

        assert!(handler.resolutions().is_empty());
        assert!(!silo.is_failed());
        assert!(silo.inner.state.lock().await.binding.is_some());
    }
}
