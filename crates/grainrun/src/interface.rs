//! # Interface Contract
//!
//! The seam between the runtime and per-interface glue. For every remotable
//! interface trait `T`, the glue provides:
//!
//! - a proxy struct that implements `T` by forwarding through a [`ProxyHandle`],
//! - an `impl Remote for dyn T` naming the interface, describing its methods
//!   and dispatching inbound calls to a subject.
//!
//! The runtime only ever talks to `Remote`; how the glue is produced does not
//! matter to it. `crate::testing` contains hand-written examples.
//!
//! ## Invariants
//! - Method names are unique within an interface.
//! - `invoke` never blocks; all work happens inside the returned future.

use std::sync::Arc;

use futures::future::BoxFuture;
use grainrpc::Payload;

use crate::error::CallError;
use crate::proxy::ProxyHandle;
use crate::typemodel::ClassifyError;

/// How inbound calls to a method are scheduled on the receiving side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Dispatch {
    /// Every call runs on its own task immediately.
    #[default]
    Concurrent,
    /// One FIFO queue per (interface, method) across all instances.
    PerMethod,
    /// One FIFO queue per (interface, object) across all methods.
    PerObject,
    /// One FIFO queue per interface across all instances and methods.
    PerType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescription {
    pub name: &'static str,
    pub dispatch: Dispatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescription {
    pub name: &'static str,
    pub methods: Vec<MethodDescription>,
}

impl InterfaceDescription {
    pub fn new(name: &'static str) -> Self {
        Self { name, methods: Vec::new() }
    }

    pub fn method(mut self, name: &'static str, dispatch: Dispatch) -> Self {
        self.methods.push(MethodDescription { name, dispatch });
        self
    }

    pub fn dispatch_of(&self, method: &str) -> Option<Dispatch> {
        self.methods.iter().find(|m| m.name == method).map(|m| m.dispatch)
    }

    pub fn validate(&self) -> Result<(), ClassifyError> {
        for (i, method) in self.methods.iter().enumerate() {
            if self.methods[..i].iter().any(|m| m.name == method.name) {
                return Err(ClassifyError::DuplicateMethod {
                    interface: self.name.to_string(),
                    method: method.name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Behaviour every remotable object shares, proxies and subjects alike.
///
/// Interface traits use it as their supertrait.
pub trait Subject: Send + Sync + 'static {
    /// Called when the exporting endpoint is disposed.
    fn dispose(&self) {}

    /// Proxies return their handle so a reference travelling back to its
    /// owner can be resolved to the original subject.
    fn proxy_handle(&self) -> Option<&ProxyHandle> {
        None
    }
}

/// Glue for one interface, implemented on `dyn Interface`.
pub trait Remote: Subject {
    /// Name used on the wire.
    const NAME: &'static str;

    fn describe() -> InterfaceDescription;

    /// Builds a proxy forwarding every method through `handle`.
    fn proxy(handle: ProxyHandle) -> Arc<Self>;

    /// Decodes `args`, calls `method` on `subject` and encodes its result.
    fn invoke(subject: Arc<Self>, method: &str, args: Payload) -> BoxFuture<'static, Result<Payload, CallError>>;
}

/// Future for a method the glue does not know.
pub fn unknown_method(interface: &str, method: &str) -> BoxFuture<'static, Result<Payload, CallError>> {
    let error = CallError::NoSuchMethod {
        interface: interface.to_string(),
        method: method.to_string(),
    };
    Box::pin(std::future::ready(Err(error)))
}
