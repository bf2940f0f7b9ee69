//! # Silo Host
//!
//! The worker side of an out-of-process silo.
//!
//! A [`GrainCatalog`] lists the grain types the worker can activate. The
//! [`SiloServer`] exports a [`SubjectHost`] under [`ObjectId::BOOTSTRAP`],
//! listens on an ephemeral loopback port and announces it on stdout (see
//! [`crate::startup`]). The parent then asks the host to create subjects by
//! implementation name and talks to them through ordinary proxies.
//!
//! ## Invariants
//! - Grain types are classified when they are registered; a type that is not
//!   by-reference, or whose interface differs from its declared one, is never
//!   registered.
//! - The host keeps every subject it created alive until it shuts down.
//! - The worker exits when asked to, or when its parent process is gone.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use grainrpc::Payload;
use grainrpc::RemoteException;
use tokio::sync::Notify;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::endpoint::RemotingEndpoint;
use crate::error::CallError;
use crate::error::ConnectError;
use crate::ids::ObjectId;
use crate::interface::Dispatch;
use crate::interface::InterfaceDescription;
use crate::interface::Remote;
use crate::interface::Subject;
use crate::interface::unknown_method;
use crate::proxy::ProxyHandle;
use crate::registry::RegistryError;
use crate::settings::EndpointSettings;
use crate::startup;
use crate::typemodel::ClassifyError;
use crate::typemodel::Describe;
use crate::typemodel::TypeKind;
use crate::typemodel::TypeModel;

const PARENT_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("{type_name} cannot be hosted: {reason}")]
    NotAGrain { type_name: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A grain type the host can create from a serialized argument payload.
pub trait Activate: Describe + Send + Sync + 'static {
    type Interface: Remote + ?Sized;

    fn activate(args: &Payload) -> Result<Arc<Self::Interface>, CallError>;
}

type Keepalive = Arc<dyn Any + Send + Sync>;
type Factory = Box<dyn Fn(&RemotingEndpoint, &Payload) -> Result<(ObjectId, Keepalive), CallError> + Send + Sync>;

struct Registration {
    interface: &'static str,
    factory: Factory,
}

/// Grain types known to a worker, by implementation name.
#[derive(Default)]
pub struct GrainCatalog {
    types: TypeModel,
    grains: HashMap<String, Registration>,
}

impl GrainCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: Activate>(&mut self) -> Result<&mut Self, HostError> {
        let activates = <G::Interface as Remote>::NAME;
        let description = self.types.describe::<G>()?;
        match &description.kind {
            TypeKind::ByReference { interface } if interface == activates => {}
            TypeKind::ByReference { interface } => {
                return Err(HostError::NotAGrain {
                    type_name: description.name.clone(),
                    reason: format!("declares {} but activates {}", interface, activates),
                });
            }
            other => {
                return Err(HostError::NotAGrain {
                    type_name: description.name.clone(),
                    reason: format!("classified as {:?}", other),
                });
            }
        }

        let factory: Factory = Box::new(|endpoint: &RemotingEndpoint, args: &Payload| {
            let subject = G::activate(args)?;
            let id = endpoint.export(&subject)?;
            let keepalive: Keepalive = Arc::new(subject);
            Ok((id, keepalive))
        });
        debug!(grain = %description.name, interface = activates, "registered grain");
        self.grains.insert(description.name.clone(), Registration { interface: activates, factory });
        Ok(self)
    }

    pub fn contains(&self, implementation: &str) -> bool {
        self.grains.contains_key(implementation)
    }

    pub fn len(&self) -> usize {
        self.grains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grains.is_empty()
    }

    fn activate(&self, endpoint: &RemotingEndpoint, implementation: &str, interface: &str, args: &Payload) -> Result<(ObjectId, Keepalive), CallError> {
        let registration = self
            .grains
            .get(implementation)
            .ok_or_else(|| CallError::remote("UnknownGrain", format!("no grain named {}", implementation)))?;
        if registration.interface != interface {
            return Err(CallError::remote(
                "InterfaceMismatch",
                format!("{} implements {}, not {}", implementation, registration.interface, interface),
            ));
        }
        (registration.factory)(endpoint, args)
    }
}

// --- SubjectHost ---

/// The bootstrap object of a worker.
#[async_trait]
pub trait SubjectHost: Subject {
    /// Creates a subject of `implementation` and returns the id it is exported under.
    async fn create_subject(&self, implementation: String, interface: String, args: Payload) -> Result<ObjectId, CallError>;

    /// Asks the worker to exit.
    async fn shutdown(&self) -> Result<(), CallError>;
}

pub struct SubjectHostProxy {
    handle: ProxyHandle,
}

impl Subject for SubjectHostProxy {
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

#[async_trait]
impl SubjectHost for SubjectHostProxy {
    async fn create_subject(&self, implementation: String, interface: String, args: Payload) -> Result<ObjectId, CallError> {
        self.handle.call("create_subject", &(implementation, interface, args)).await
    }

    async fn shutdown(&self) -> Result<(), CallError> {
        self.handle.call("shutdown", &()).await
    }
}

impl Remote for dyn SubjectHost {
    const NAME: &'static str = "grainrun.SubjectHost";

    fn describe() -> InterfaceDescription {
        InterfaceDescription::new(Self::NAME)
            .method("create_subject", Dispatch::Concurrent)
            .method("shutdown", Dispatch::Concurrent)
    }

    fn proxy(handle: ProxyHandle) -> Arc<Self> {
        Arc::new(SubjectHostProxy { handle })
    }

    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>> {
        match method {
            "create_subject" => Box::pin(async move {
                let (implementation, interface, args): (String, String, Payload) = args.decode()?;
                let id = subject.create_subject(implementation, interface, args).await?;
                Ok(Payload::encode(&id)?)
            }),
            "shutdown" => Box::pin(async move {
                let () = args.decode()?;
                subject.shutdown().await?;
                Ok(Payload::encode(&())?)
            }),
            other => unknown_method(Self::NAME, other),
        }
    }
}

/// Creates subjects from a catalog and keeps them alive.
pub struct HostedSubjects {
    endpoint: RemotingEndpoint,
    catalog: Arc<GrainCatalog>,
    subjects: Mutex<HashMap<ObjectId, Keepalive>>,
    shutdown: Arc<Notify>,
}

impl HostedSubjects {
    pub fn new(endpoint: RemotingEndpoint, catalog: Arc<GrainCatalog>) -> Self {
        Self {
            endpoint,
            catalog,
            subjects: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn subject_count(&self) -> usize {
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Resolves once `shutdown` has been called, even if that happened first.
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }
}

impl Subject for HostedSubjects {
    fn dispose(&self) {
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

#[async_trait]
impl SubjectHost for HostedSubjects {
    async fn create_subject(&self, implementation: String, interface: String, args: Payload) -> Result<ObjectId, CallError> {
        let (id, keepalive) = self.catalog.activate(&self.endpoint, &implementation, &interface, &args)?;
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner).insert(id, keepalive);
        info!(%id, %implementation, "created subject");
        Ok(id)
    }

    async fn shutdown(&self) -> Result<(), CallError> {
        info!("shutdown requested");
        self.shutdown.notify_one();
        Ok(())
    }
}

// --- SiloServer ---

/// Runs a worker: export the host, announce the port, wait for the end.
pub struct SiloServer {
    catalog: Arc<GrainCatalog>,
    settings: EndpointSettings,
    parent_pid: Option<u32>,
}

impl SiloServer {
    pub fn new(catalog: GrainCatalog, settings: EndpointSettings) -> Self {
        Self {
            catalog: Arc::new(catalog),
            settings,
            parent_pid: None,
        }
    }

    /// Exit once the process `pid` is gone.
    pub fn with_parent(mut self, pid: Option<u32>) -> Self {
        self.parent_pid = pid;
        self
    }

    /// Prints the startup lines and serves until shutdown.
    ///
    /// An error before the ready line is reported as an exception line, so
    /// the parent sees the cause rather than a bare exit.
    pub async fn run(self) -> Result<(), HostError> {
        println!("{}", startup::BOOT_MARKER);
        let result = self.serve().await;
        if let Err(e) = &result {
            report_exception(e);
        }
        result
    }

    async fn serve(self) -> Result<(), HostError> {
        let endpoint = RemotingEndpoint::new(self.settings);
        let host = Arc::new(HostedSubjects::new(endpoint.clone(), self.catalog));
        let subject: Arc<dyn SubjectHost> = host.clone();
        endpoint.create_servant(ObjectId::BOOTSTRAP, &subject)?;

        let local = endpoint.bind("127.0.0.1:0").await?;
        println!("{}", local.port());
        println!("{}", startup::READY_MARKER);
        info!(port = local.port(), parent = ?self.parent_pid, "worker ready");

        tokio::select! {
            _ = host.shutdown_requested() => {}
            _ = parent_exited(self.parent_pid) => warn!("parent process is gone"),
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
        }

        println!("{}", startup::SHUTDOWN_MARKER);
        endpoint.dispose().await;
        Ok(())
    }
}

/// Writes `error` as an exception line on stdout.
pub fn report_exception<E: std::error::Error>(error: &E) {
    let exception = RemoteException::from_error(error);
    println!("{}", startup::exception_line(&exception));
}

async fn parent_exited(parent: Option<u32>) {
    let Some(pid) = parent else {
        return std::future::pending().await;
    };
    loop {
        tokio::time::sleep(PARENT_POLL_INTERVAL).await;
        if !process_alive(pid) {
            return;
        }
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::testing::Counter;
    use crate::testing::CountingGrain;
    use crate::testing::ReturnsPid;
    use crate::typemodel::TypeShape;

    struct Loose;

    impl Describe for Loose {
        fn shape() -> TypeShape {
            TypeShape::new("tests.Loose").by_value()
        }
    }

    impl Activate for Loose {
        type Interface = dyn Counter;

        fn activate(_args: &Payload) -> Result<Arc<dyn Counter>, CallError> {
            Ok(Arc::new(CountingGrain::default()))
        }
    }

    #[test]
    fn test_by_value_type_is_not_a_grain() {
        let mut catalog = GrainCatalog::new();
        assert!(matches!(catalog.register::<Loose>(), Err(HostError::NotAGrain { .. })));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_registration_by_implementation_name() {
        let mut catalog = GrainCatalog::new();
        crate::testing::register_all(&mut catalog).unwrap();

        assert_eq!(catalog.len(), 3);
        assert!(catalog.contains("grainrun.testing.ReturnsPid"));
        assert!(catalog.contains(&<ReturnsPid as Describe>::type_name()));
    }

    #[tokio::test]
    async fn test_create_subject_exports_and_keeps_alive() {
        let endpoint = RemotingEndpoint::new(EndpointSettings::named("host"));
        let mut catalog = GrainCatalog::new();
        catalog.register::<CountingGrain>().unwrap();
        let host = HostedSubjects::new(endpoint.clone(), Arc::new(catalog));

        let args = Payload::encode(&(41u64,)).unwrap();
        let id = host
            .create_subject("grainrun.testing.CountingGrain".into(), "grainrun.testing.Counter".into(), args)
            .await
            .unwrap();

        assert_eq!(host.subject_count(), 1);
        let counter = endpoint.registry().retrieve_subject::<dyn Counter>(id).unwrap();
        assert_eq!(counter.increment().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_unknown_grain_and_wrong_interface() {
        let endpoint = RemotingEndpoint::new(EndpointSettings::named("host"));
        let mut catalog = GrainCatalog::new();
        catalog.register::<ReturnsPid>().unwrap();
        let host = HostedSubjects::new(endpoint, Arc::new(catalog));

        let unknown = host
            .create_subject("nope".into(), "grainrun.testing.GetPid".into(), Payload::encode(&()).unwrap())
            .await;
        assert!(matches!(unknown, Err(CallError::Remote(e)) if e.type_name == "UnknownGrain"));

        let mismatch = host
            .create_subject("grainrun.testing.ReturnsPid".into(), "grainrun.testing.Counter".into(), Payload::encode(&()).unwrap())
            .await;
        assert!(matches!(mismatch, Err(CallError::Remote(e)) if e.type_name == "InterfaceMismatch"));
    }

    #[tokio::test]
    async fn test_shutdown_signal_is_not_lost() {
        let endpoint = RemotingEndpoint::new(EndpointSettings::named("host"));
        let host = HostedSubjects::new(endpoint, Arc::new(GrainCatalog::new()));

        host.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), host.shutdown_requested())
            .await
            .unwrap();
    }
}
