//! Small grains used by the test suites and by the `grain-host` binary.
//!
//! Each interface here is written out by hand the way any remotable
//! interface is: the trait, a proxy forwarding through a [`ProxyHandle`],
//! and `impl Remote for dyn Trait` decoding inbound calls.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use grainrpc::Payload;

use crate::error::CallError;
use crate::host::Activate;
use crate::host::GrainCatalog;
use crate::host::HostError;
use crate::interface::Dispatch;
use crate::interface::InterfaceDescription;
use crate::interface::Remote;
use crate::interface::Subject;
use crate::interface::unknown_method;
use crate::proxy::ProxyHandle;
use crate::typemodel::Describe;
use crate::typemodel::TypeShape;

/// Registers every activatable grain in this module.
pub fn register_all(catalog: &mut GrainCatalog) -> Result<(), HostError> {
    catalog.register::<ReturnsPid>()?;
    catalog.register::<SleepingGrain>()?;
    catalog.register::<CountingGrain>()?;
    Ok(())
}

// --- GetPid ---

#[async_trait]
pub trait GetPid: Subject {
    async fn get_pid(&self) -> Result<u32, CallError>;
}

pub struct GetPidProxy {
    handle: ProxyHandle,
}

impl Subject for GetPidProxy {
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

#[async_trait]
impl GetPid for GetPidProxy {
    async fn get_pid(&self) -> Result<u32, CallError> {
        self.handle.call("get_pid", &()).await
    }
}

impl Remote for dyn GetPid {
    const NAME: &'static str = "grainrun.testing.GetPid";

    fn describe() -> InterfaceDescription {
        InterfaceDescription::new(Self::NAME).method("get_pid", Dispatch::Concurrent)
    }

    fn proxy(handle: ProxyHandle) -> Arc<Self> {
        Arc::new(GetPidProxy { handle })
    }

    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>> {
        match method {
            "get_pid" => Box::pin(async move {
                let () = args.decode()?;
                Ok(Payload::encode(&subject.get_pid().await?)?)
            }),
            other => unknown_method(Self::NAME, other),
        }
    }
}

/// Answers with the id of the process it lives in.
#[derive(Debug, Default)]
pub struct ReturnsPid;

impl Subject for ReturnsPid {}

#[async_trait]
impl GetPid for ReturnsPid {
    async fn get_pid(&self) -> Result<u32, CallError> {
        Ok(std::process::id())
    }
}

impl Describe for ReturnsPid {
    fn shape() -> TypeShape {
        TypeShape::new("grainrun.testing.ReturnsPid")
            .by_reference()
            .implements(<dyn GetPid as Remote>::NAME, true)
    }
}

impl Activate for ReturnsPid {
    type Interface = dyn GetPid;

    fn activate(_args: &Payload) -> Result<Arc<dyn GetPid>, CallError> {
        Ok(Arc::new(ReturnsPid))
    }
}

// --- Sleeper ---

#[async_trait]
pub trait Sleeper: Subject {
    /// Returns after `millis` milliseconds.
    async fn sleep(&self, millis: u64) -> Result<(), CallError>;
}

pub struct SleeperProxy {
    handle: ProxyHandle,
}

impl Subject for SleeperProxy {
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

#[async_trait]
impl Sleeper for SleeperProxy {
    async fn sleep(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("sleep", &(millis,)).await
    }
}

impl Remote for dyn Sleeper {
    const NAME: &'static str = "grainrun.testing.Sleeper";

    fn describe() -> InterfaceDescription {
        InterfaceDescription::new(Self::NAME).method("sleep", Dispatch::Concurrent)
    }

    fn proxy(handle: ProxyHandle) -> Arc<Self> {
        Arc::new(SleeperProxy { handle })
    }

    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>> {
        match method {
            "sleep" => Box::pin(async move {
                let (millis,): (u64,) = args.decode()?;
                subject.sleep(millis).await?;
                Ok(Payload::encode(&())?)
            }),
            other => unknown_method(Self::NAME, other),
        }
    }
}

#[derive(Debug, Default)]
pub struct SleepingGrain;

impl Subject for SleepingGrain {}

#[async_trait]
impl Sleeper for SleepingGrain {
    async fn sleep(&self, millis: u64) -> Result<(), CallError> {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(())
    }
}

impl Describe for SleepingGrain {
    fn shape() -> TypeShape {
        TypeShape::new("grainrun.testing.SleepingGrain")
            .by_reference()
            .implements(<dyn Sleeper as Remote>::NAME, true)
    }
}

impl Activate for SleepingGrain {
    type Interface = dyn Sleeper;

    fn activate(_args: &Payload) -> Result<Arc<dyn Sleeper>, CallError> {
        Ok(Arc::new(SleepingGrain))
    }
}

// --- Counter ---

#[async_trait]
pub trait Counter: Subject {
    /// Adds one and returns the new value.
    async fn increment(&self) -> Result<u64, CallError>;
    async fn get(&self) -> Result<u64, CallError>;
}

pub struct CounterProxy {
    handle: ProxyHandle,
}

impl Subject for CounterProxy {
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

#[async_trait]
impl Counter for CounterProxy {
    async fn increment(&self) -> Result<u64, CallError> {
        self.handle.call("increment", &()).await
    }

    async fn get(&self) -> Result<u64, CallError> {
        self.handle.call("get", &()).await
    }
}

impl Remote for dyn Counter {
    const NAME: &'static str = "grainrun.testing.Counter";

    fn describe() -> InterfaceDescription {
        InterfaceDescription::new(Self::NAME)
            .method("increment", Dispatch::PerObject)
            .method("get", Dispatch::PerObject)
    }

    fn proxy(handle: ProxyHandle) -> Arc<Self> {
        Arc::new(CounterProxy { handle })
    }

    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>> {
        match method {
            "increment" => Box::pin(async move {
                let () = args.decode()?;
                Ok(Payload::encode(&subject.increment().await?)?)
            }),
            "get" => Box::pin(async move {
                let () = args.decode()?;
                Ok(Payload::encode(&subject.get().await?)?)
            }),
            other => unknown_method(Self::NAME, other),
        }
    }
}

/// A counter that remembers how often it was disposed.
#[derive(Debug, Default)]
pub struct CountingGrain {
    count: AtomicU64,
    disposals: AtomicUsize,
}

impl CountingGrain {
    pub fn starting_at(count: u64) -> Self {
        Self { count: AtomicU64::new(count), ..Self::default() }
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

impl Subject for CountingGrain {
    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Counter for CountingGrain {
    async fn increment(&self) -> Result<u64, CallError> {
        Ok(self.count.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn get(&self) -> Result<u64, CallError> {
        Ok(self.count.load(Ordering::SeqCst))
    }
}

impl Describe for CountingGrain {
    fn shape() -> TypeShape {
        TypeShape::new("grainrun.testing.CountingGrain")
            .by_reference()
            .implements(<dyn Counter as Remote>::NAME, true)
    }
}

impl Activate for CountingGrain {
    type Interface = dyn Counter;

    /// Takes the initial count as its only argument.
    fn activate(args: &Payload) -> Result<Arc<dyn Counter>, CallError> {
        let (start,): (u64,) = args.decode().map_err(|e| CallError::BadArguments(e.to_string()))?;
        Ok(Arc::new(CountingGrain::starting_at(start)))
    }
}

// --- Tracer ---

/// Measures how many of its calls overlap, one method per dispatch strategy.
#[async_trait]
pub trait Tracer: Subject {
    async fn concurrent(&self, millis: u64) -> Result<(), CallError>;
    async fn per_method(&self, millis: u64) -> Result<(), CallError>;
    async fn per_object(&self, millis: u64) -> Result<(), CallError>;
    /// A second per-object method, sharing the object's queue.
    async fn touch(&self, millis: u64) -> Result<(), CallError>;
    async fn per_type(&self, millis: u64) -> Result<(), CallError>;
    async fn fail(&self, message: String) -> Result<(), CallError>;
    async fn panic(&self) -> Result<(), CallError>;
}

pub struct TracerProxy {
    handle: ProxyHandle,
}

impl Subject for TracerProxy {
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        Some(&self.handle)
    }
}

#[async_trait]
impl Tracer for TracerProxy {
    async fn concurrent(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("concurrent", &(millis,)).await
    }

    async fn per_method(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("per_method", &(millis,)).await
    }

    async fn per_object(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("per_object", &(millis,)).await
    }

    async fn touch(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("touch", &(millis,)).await
    }

    async fn per_type(&self, millis: u64) -> Result<(), CallError> {
        self.handle.call("per_type", &(millis,)).await
    }

    async fn fail(&self, message: String) -> Result<(), CallError> {
        self.handle.call("fail", &(message,)).await
    }

    async fn panic(&self) -> Result<(), CallError> {
        self.handle.call("panic", &()).await
    }
}

impl Remote for dyn Tracer {
    const NAME: &'static str = "grainrun.testing.Tracer";

    fn describe() -> InterfaceDescription {
        InterfaceDescription::new(Self::NAME)
            .method("concurrent", Dispatch::Concurrent)
            .method("per_method", Dispatch::PerMethod)
            .method("per_object", Dispatch::PerObject)
            .method("touch", Dispatch::PerObject)
            .method("per_type", Dispatch::PerType)
            .method("fail", Dispatch::Concurrent)
            .method("panic", Dispatch::Concurrent)
    }

    fn proxy(handle: ProxyHandle) -> Arc<Self> {
        Arc::new(TracerProxy { handle })
    }

    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>> {
        match method {
            "concurrent" | "per_method" | "per_object" | "touch" | "per_type" => {
                let method = method.to_string();
                Box::pin(async move {
                    let (millis,): (u64,) = args.decode()?;
                    match method.as_str() {
                        "concurrent" => subject.concurrent(millis).await?,
                        "per_method" => subject.per_method(millis).await?,
                        "per_object" => subject.per_object(millis).await?,
                        "touch" => subject.touch(millis).await?,
                        _ => subject.per_type(millis).await?,
                    }
                    Ok(Payload::encode(&())?)
                })
            }
            "fail" => Box::pin(async move {
                let (message,): (String,) = args.decode()?;
                subject.fail(message).await?;
                Ok(Payload::encode(&())?)
            }),
            "panic" => Box::pin(async move {
                let () = args.decode()?;
                subject.panic().await?;
                Ok(Payload::encode(&())?)
            }),
            other => unknown_method(Self::NAME, other),
        }
    }
}

/// Overlap statistics, shareable between several tracers.
#[derive(Debug, Default)]
pub struct OverlapStats {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl OverlapStats {
    /// Highest number of calls seen running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn hold(&self, millis: u64) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct TracerGrain {
    stats: Arc<OverlapStats>,
}

impl TracerGrain {
    pub fn new(stats: Arc<OverlapStats>) -> Self {
        Self { stats }
    }
}

impl Subject for TracerGrain {}

#[async_trait]
impl Tracer for TracerGrain {
    async fn concurrent(&self, millis: u64) -> Result<(), CallError> {
        self.stats.hold(millis).await;
        Ok(())
    }

    async fn per_method(&self, millis: u64) -> Result<(), CallError> {
        self.stats.hold(millis).await;
        Ok(())
    }

    async fn per_object(&self, millis: u64) -> Result<(), CallError> {
        self.stats.hold(millis).await;
        Ok(())
    }

    async fn touch(&self, millis: u64) -> Result<(), CallError> {
        self.stats.hold(millis).await;
        Ok(())
    }

    async fn per_type(&self, millis: u64) -> Result<(), CallError> {
        self.stats.hold(millis).await;
        Ok(())
    }

    async fn fail(&self, message: String) -> Result<(), CallError> {
        Err(CallError::remote("TracerFailure", message))
    }

    async fn panic(&self) -> Result<(), CallError> {
        panic!("tracer panicked on purpose");
    }
}
