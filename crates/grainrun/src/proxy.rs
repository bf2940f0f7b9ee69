//! Caller-side binding shared by every generated proxy.
//!
//! A `ProxyHandle` is the mutable part of a proxy: which object it targets and
//! over which connection. The registry can rebind it in place, so the proxy
//! objects held by callers survive a reconnect to a new remote instance.

use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use grainrpc::Payload;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::channel::CallChannel;
use crate::channel::PendingCall;
use crate::error::CallError;
use crate::ids::ConnectionId;
use crate::ids::ObjectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    object_id: ObjectId,
    connection: ConnectionId,
}

struct ProxyState {
    interface: &'static str,
    channel: Arc<CallChannel>,
    binding: RwLock<Binding>,
}

#[derive(Clone)]
pub struct ProxyHandle {
    state: Arc<ProxyState>,
}

impl ProxyHandle {
    pub(crate) fn new(interface: &'static str, channel: Arc<CallChannel>, object_id: ObjectId, connection: ConnectionId) -> Self {
        Self {
            state: Arc::new(ProxyState {
                interface,
                channel,
                binding: RwLock::new(Binding { object_id, connection }),
            }),
        }
    }

    fn binding(&self) -> Binding {
        *self.state.binding.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn interface(&self) -> &'static str {
        self.state.interface
    }

    pub fn object_id(&self) -> ObjectId {
        self.binding().object_id
    }

    pub fn connection(&self) -> ConnectionId {
        self.binding().connection
    }

    pub(crate) fn rebind(&self, object_id: ObjectId, connection: ConnectionId) {
        *self.state.binding.write().unwrap_or_else(PoisonError::into_inner) = Binding { object_id, connection };
    }

    /// True if both handles belong to the same proxy object.
    pub fn same_as(&self, other: &ProxyHandle) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// True if calls through this handle go over `channel`.
    pub fn uses(&self, channel: &Arc<CallChannel>) -> bool {
        Arc::ptr_eq(&self.state.channel, channel)
    }

    /// Encodes `args`, calls `method` on the bound object and decodes the result.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = Payload::encode(args)?;
        let binding = self.binding();
        let reply = self
            .state
            .channel
            .call_remote_method(binding.connection, binding.object_id, self.state.interface, method, args)
            .await?;
        Ok(reply.decode()?)
    }

    /// Sends the call and returns without waiting for the response.
    pub async fn call_async<A>(&self, method: &str, args: &A) -> Result<PendingCall, CallError>
    where
        A: Serialize + ?Sized,
    {
        let args = Payload::encode(args)?;
        let binding = self.binding();
        self.state
            .channel
            .call_remote_method_async(binding.connection, binding.object_id, self.state.interface, method, args)
            .await
    }

    /// Blocking variant of [`ProxyHandle::call`] for threads outside the runtime.
    pub fn call_blocking<A, R>(&self, method: &str, args: &A) -> Result<R, CallError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = Payload::encode(args)?;
        let binding = self.binding();
        let reply = self.state.channel.call_remote_method_blocking(
            binding.connection,
            binding.object_id,
            self.state.interface,
            method,
            args,
        )?;
        Ok(reply.decode()?)
    }
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let binding = self.binding();
        f.debug_struct("ProxyHandle")
            .field("interface", &self.state.interface)
            .field("object_id", &binding.object_id)
            .field("connection", &binding.connection)
            .finish()
    }
}
