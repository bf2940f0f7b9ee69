//! # Object Registry
//!
//! Per-endpoint map from object ids to servants (objects exported by this
//! endpoint) and proxies (remote objects referenced by this endpoint).
//!
//! ## Invariants
//! - One lock guards all registry state, so lookup-or-create is atomic.
//! - At most one proxy object exists per object id on a live connection.
//! - A servant holds its subject weakly; a collected subject makes its id
//!   answer `NoSuchServant`.
//! - Id 0 is never allocated; it is reserved for the bootstrap object.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use futures::future::BoxFuture;
use grainrpc::Payload;
use tracing::debug;

use crate::channel::CallChannel;
use crate::error::CallError;
use crate::ids::ConnectionId;
use crate::ids::ObjectId;
use crate::interface::Dispatch;
use crate::interface::InterfaceDescription;
use crate::interface::Remote;
use crate::proxy::ProxyHandle;
use crate::typemodel::ClassifyError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("object id {0} is already exported")]
    DuplicateObjectId(ObjectId),

    #[error("object id range exhausted")]
    ObjectIdRangeExhausted,

    #[error("no servant is exported as {0}")]
    NoSuchServant(ObjectId),

    #[error("{id} implements {found}, not {expected}")]
    InterfaceMismatch { id: ObjectId, expected: String, found: String },

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error("registry has been disposed")]
    Disposed,
}

impl From<RegistryError> for CallError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NoSuchServant(id) => CallError::NoSuchServant(id),
            RegistryError::Disposed => CallError::NotConnected,
            other => CallError::Protocol(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Type-erased weak reference to a subject plus its glue.
trait ServantTarget: Send + Sync {
    fn invoke(&self, method: &str, args: Payload) -> Option<BoxFuture<'static, std::result::Result<Payload, CallError>>>;
    fn is_alive(&self) -> bool;
    fn refers_to(&self, address: usize) -> bool;
    fn dispose(&self);
    fn as_any(&self) -> &dyn Any;
}

struct WeakSubject<I: Remote + ?Sized> {
    subject: Weak<I>,
}

impl<I: Remote + ?Sized> ServantTarget for WeakSubject<I> {
    fn invoke(&self, method: &str, args: Payload) -> Option<BoxFuture<'static, std::result::Result<Payload, CallError>>> {
        let subject = self.subject.upgrade()?;
        Some(I::invoke(subject, method, args))
    }

    fn is_alive(&self) -> bool {
        self.subject.strong_count() > 0
    }

    fn refers_to(&self, address: usize) -> bool {
        self.is_alive() && self.subject.as_ptr().cast::<()>() as usize == address
    }

    fn dispose(&self) {
        if let Some(subject) = self.subject.upgrade() {
            subject.dispose();
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn address_of<I: ?Sized>(subject: &Arc<I>) -> usize {
    Arc::as_ptr(subject).cast::<()>() as usize
}

/// The receiving-side adapter for one exported object.
pub struct Servant {
    id: ObjectId,
    interface: Arc<InterfaceDescription>,
    target: Box<dyn ServantTarget>,
}

impl Servant {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn interface(&self) -> &InterfaceDescription {
        &self.interface
    }

    pub fn dispatch_of(&self, method: &str) -> Option<Dispatch> {
        self.interface.dispatch_of(method)
    }

    pub fn is_alive(&self) -> bool {
        self.target.is_alive()
    }

    /// Resolves the subject and starts the call.
    ///
    /// Fails with `NoSuchServant` once the subject has been dropped and with
    /// `NoSuchMethod` for methods the interface does not declare.
    pub fn invoke(&self, method: &str, args: Payload) -> std::result::Result<BoxFuture<'static, std::result::Result<Payload, CallError>>, CallError> {
        if self.interface.dispatch_of(method).is_none() {
            return Err(CallError::NoSuchMethod {
                interface: self.interface.name.to_string(),
                method: method.to_string(),
            });
        }
        self.target.invoke(method, args).ok_or(CallError::NoSuchServant(self.id))
    }
}

struct ProxyEntry {
    handle: ProxyHandle,
    typed: Arc<dyn Any + Send + Sync>,
}

struct RegistryState {
    next_id: u64,
    servants: HashMap<ObjectId, Arc<Servant>>,
    by_subject: HashMap<usize, ObjectId>,
    proxies: HashMap<ObjectId, ProxyEntry>,
    interfaces: HashMap<&'static str, Arc<InterfaceDescription>>,
    disposed: bool,
}

impl RegistryState {
    fn allocate_id(&mut self) -> Result<ObjectId> {
        loop {
            let id = ObjectId(self.next_id);
            self.next_id = self.next_id.checked_add(1).ok_or(RegistryError::ObjectIdRangeExhausted)?;
            if !self.servants.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    fn interface<I: Remote + ?Sized>(&mut self) -> Result<Arc<InterfaceDescription>> {
        if let Some(existing) = self.interfaces.get(I::NAME) {
            return Ok(existing.clone());
        }
        let description = I::describe();
        description.validate()?;
        let description = Arc::new(description);
        self.interfaces.insert(I::NAME, description.clone());
        Ok(description)
    }

    fn forget(&mut self, id: ObjectId) -> Option<Arc<Servant>> {
        let servant = self.servants.remove(&id)?;
        self.by_subject.retain(|_, v| *v != id);
        Some(servant)
    }

    fn export<I: Remote + ?Sized>(&mut self, id: ObjectId, subject: &Arc<I>) -> Result<Arc<Servant>> {
        let interface = self.interface::<I>()?;
        let servant = Arc::new(Servant {
            id,
            interface,
            target: Box::new(WeakSubject::<I> { subject: Arc::downgrade(subject) }),
        });
        self.servants.insert(id, servant.clone());
        self.by_subject.insert(address_of(subject), id);
        Ok(servant)
    }
}

pub struct ObjectRegistry {
    state: Mutex<RegistryState>,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// A registry whose next allocated id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                next_id: first.max(1),
                servants: HashMap::new(),
                by_subject: HashMap::new(),
                proxies: HashMap::new(),
                interfaces: HashMap::new(),
                disposed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Exports `subject` under a caller-chosen id.
    pub fn create_servant<I: Remote + ?Sized>(&self, id: ObjectId, subject: &Arc<I>) -> Result<Arc<Servant>> {
        let mut state = self.lock();
        if state.disposed {
            return Err(RegistryError::Disposed);
        }
        if state.servants.contains_key(&id) {
            return Err(RegistryError::DuplicateObjectId(id));
        }
        debug!(%id, interface = I::NAME, "exporting servant");
        state.export(id, subject)
    }

    /// Returns the servant already exporting `subject`, or exports it under a fresh id.
    pub fn get_or_create_servant<I: Remote + ?Sized>(&self, subject: &Arc<I>) -> Result<Arc<Servant>> {
        let mut state = self.lock();
        if state.disposed {
            return Err(RegistryError::Disposed);
        }
        let address = address_of(subject);
        let existing = state
            .by_subject
            .get(&address)
            .and_then(|id| state.servants.get(id))
            .filter(|servant| servant.target.refers_to(address))
            .cloned();
        if let Some(servant) = existing {
            return Ok(servant);
        }
        // Any previous subject at this address is gone.
        state.by_subject.remove(&address);
        let id = state.allocate_id()?;
        debug!(%id, interface = I::NAME, "exporting servant");
        state.export(id, subject)
    }

    /// Live servant under `id`. A servant whose subject was collected is removed.
    pub fn servant(&self, id: ObjectId) -> Option<Arc<Servant>> {
        let mut state = self.lock();
        let servant = state.servants.get(&id).cloned()?;
        if servant.is_alive() {
            return Some(servant);
        }
        debug!(%id, "dropping collected servant");
        state.forget(id);
        None
    }

    pub fn remove_servant(&self, id: ObjectId) -> Option<Arc<Servant>> {
        self.lock().forget(id)
    }

    /// Removes every servant whose subject was collected and returns their ids.
    pub fn prune_collected(&self) -> Vec<ObjectId> {
        let mut state = self.lock();
        let dead: Vec<ObjectId> = state
            .servants
            .iter()
            .filter(|(_, servant)| !servant.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            state.forget(*id);
        }
        if !dead.is_empty() {
            debug!(count = dead.len(), "pruned collected servants");
        }
        dead
    }

    /// Returns the subject exported under `id` without creating a proxy.
    pub fn retrieve_subject<I: Remote + ?Sized>(&self, id: ObjectId) -> Result<Arc<I>> {
        let servant = self.servant(id).ok_or(RegistryError::NoSuchServant(id))?;
        let Some(target) = servant.target.as_any().downcast_ref::<WeakSubject<I>>() else {
            return Err(RegistryError::InterfaceMismatch {
                id,
                expected: I::NAME.to_string(),
                found: servant.interface.name.to_string(),
            });
        };
        target.subject.upgrade().ok_or(RegistryError::NoSuchServant(id))
    }

    /// Returns the proxy for `id`, constructing it at most once per connection.
    pub fn get_or_create_proxy<I: Remote + ?Sized>(&self, id: ObjectId, connection: ConnectionId, channel: &Arc<CallChannel>) -> Arc<I> {
        let mut state = self.lock();
        if let Some(entry) = state.proxies.get(&id) {
            if entry.handle.connection() == connection {
                if let Some(existing) = entry.typed.downcast_ref::<Arc<I>>() {
                    return existing.clone();
                }
            }
        }
        let handle = ProxyHandle::new(I::NAME, channel.clone(), id, connection);
        let proxy = I::proxy(handle.clone());
        state.proxies.insert(id, ProxyEntry { handle, typed: Arc::new(proxy.clone()) });
        proxy
    }

    /// Points an existing proxy at a new object, keeping the proxy object itself.
    pub fn rebind_proxy(&self, handle: &ProxyHandle, id: ObjectId, connection: ConnectionId) {
        let mut state = self.lock();
        let old = handle.object_id();
        let owned = state.proxies.get(&old).is_some_and(|e| e.handle.same_as(handle));
        let entry = if owned { state.proxies.remove(&old) } else { None };
        handle.rebind(id, connection);
        if let Some(entry) = entry {
            state.proxies.insert(id, entry);
        }
        debug!(from = %old, to = %id, %connection, "rebound proxy");
    }

    pub fn servant_count(&self) -> usize {
        self.lock().servants.len()
    }

    pub fn proxy_count(&self) -> usize {
        self.lock().proxies.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Releases every servant, disposing live subjects. Idempotent.
    pub fn dispose(&self) {
        let servants: Vec<Arc<Servant>> = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.by_subject.clear();
            state.proxies.clear();
            state.servants.drain().map(|(_, s)| s).collect()
        };
        debug!(count = servants.len(), "disposing servants");
        for servant in servants {
            servant.target.dispose();
        }
    }
}
