//! # Remoting Endpoint
//!
//! Composes an [`ObjectRegistry`], a [`CallChannel`] and the endpoint's
//! [`DispatchQueues`] with any number of connections. An endpoint can both
//! connect to other endpoints and accept connections, and it serves calls in
//! either direction over every connection.
//!
//! ## Connection lifecycle
//! 1. Handshake (`Hello` / `Login` / `Welcome`), with optional authentication.
//! 2. One receive loop per connection: responses complete pending calls,
//!    calls are routed to the servant's dispatch queue, heartbeat requests
//!    are answered from a separately spawned task.
//! 3. When the loop ends, every call still waiting on that connection fails
//!    with `ConnectionLost` and `Disconnected` is broadcast.
//!
//! ## Invariants
//! - Replies go out on the connection the call came in on.
//! - After `dispose`, no caller stays blocked and no new connection is accepted.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::FutureExt;
use grainrpc::ByReferenceHint;
use grainrpc::FailureReason;
use grainrpc::Frame;
use grainrpc::ObjectRef;
use grainrpc::Payload;
use grainrpc::RejectReason;
use grainrpc::RemoteException;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::auth;
use crate::channel::CallChannel;
use crate::channel::ConnectionHeartbeat;
use crate::dispatch::DispatchQueues;
use crate::dispatch::Job;
use crate::error::CallError;
use crate::error::ConnectError;
use crate::ids::ConnectionId;
use crate::ids::ObjectId;
use crate::interface::Remote;
use crate::registry::ObjectRegistry;
use crate::registry::RegistryError;
use crate::settings::EndpointSettings;
use crate::transport::TcpTransport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Connected { connection: ConnectionId, remote: String },
    /// The connection ended because of an error rather than a clean close.
    Failure { connection: ConnectionId, reason: String },
    Disconnected { connection: ConnectionId, reason: String },
}

struct EndpointInner {
    settings: EndpointSettings,
    registry: ObjectRegistry,
    channel: Arc<CallChannel>,
    queues: DispatchQueues,
    events: broadcast::Sender<EndpointEvent>,
    receivers: Mutex<HashMap<ConnectionId, JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

#[derive(Clone)]
pub struct RemotingEndpoint {
    inner: Arc<EndpointInner>,
}

impl RemotingEndpoint {
    /// Must be called from within a tokio runtime.
    pub fn new(settings: EndpointSettings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(EndpointInner {
                channel: Arc::new(CallChannel::new(settings.call_timeout)),
                settings,
                registry: ObjectRegistry::new(),
                queues: DispatchQueues::new(),
                events,
                receivers: Mutex::new(HashMap::new()),
                listener: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &EndpointSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &ObjectRegistry {
        &self.inner.registry
    }

    pub fn channel(&self) -> &Arc<CallChannel> {
        &self.inner.channel
    }

    /// Number of live serial dispatch queues.
    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.channel.is_connected()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        self.inner.channel.connection_ids()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_alive(&self) -> Result<(), ConnectError> {
        if self.is_disposed() {
            return Err(ConnectError::Disposed);
        }
        Ok(())
    }

    // --- Objects ---

    /// Exports `subject` under a fixed id, typically [`ObjectId::BOOTSTRAP`].
    pub fn create_servant<I: Remote + ?Sized>(&self, id: ObjectId, subject: &Arc<I>) -> Result<ObjectId, RegistryError> {
        self.inner.prune_collected();
        self.inner.registry.create_servant(id, subject).map(|s| s.id())
    }

    /// Exports `subject` under a fresh id, or returns its existing id.
    pub fn export<I: Remote + ?Sized>(&self, subject: &Arc<I>) -> Result<ObjectId, RegistryError> {
        self.inner.prune_collected();
        self.inner.registry.get_or_create_servant(subject).map(|s| s.id())
    }

    pub fn remove_servant(&self, id: ObjectId) -> bool {
        self.inner.queues.forget_object(id);
        self.inner.registry.remove_servant(id).is_some()
    }

    pub fn get_or_create_proxy<I: Remote + ?Sized>(&self, id: ObjectId, connection: ConnectionId) -> Arc<I> {
        self.inner.registry.get_or_create_proxy::<I>(id, connection, &self.inner.channel)
    }

    /// Proxy for the bootstrap object on the other side of `connection`.
    pub fn bootstrap<I: Remote + ?Sized>(&self, connection: ConnectionId) -> Arc<I> {
        self.get_or_create_proxy::<I>(ObjectId::BOOTSTRAP, connection)
    }

    /// Wire form of a by-reference value about to be sent.
    ///
    /// A proxy handed back to the endpoint that owns its subject is tagged so
    /// the receiver uses its own subject instead of building a proxy of a proxy.
    pub fn write_reference<I: Remote + ?Sized>(&self, subject: &Arc<I>) -> Result<ObjectRef, CallError> {
        if let Some(handle) = subject.proxy_handle() {
            if handle.uses(&self.inner.channel) {
                return Ok(ObjectRef {
                    hint: ByReferenceHint::RetrieveSubject,
                    object_id: handle.object_id().0,
                });
            }
        }
        self.inner.prune_collected();
        let servant = self.inner.registry.get_or_create_servant(subject)?;
        Ok(ObjectRef {
            hint: ByReferenceHint::CreateProxy,
            object_id: servant.id().0,
        })
    }

    /// Resolves a by-reference value received over `connection`.
    pub fn read_reference<I: Remote + ?Sized>(&self, reference: ObjectRef, connection: ConnectionId) -> Result<Arc<I>, CallError> {
        let id = ObjectId(reference.object_id);
        match reference.hint {
            ByReferenceHint::CreateProxy => Ok(self.get_or_create_proxy::<I>(id, connection)),
            ByReferenceHint::RetrieveSubject => Ok(self.inner.registry.retrieve_subject::<I>(id)?),
        }
    }

    pub fn heartbeat(&self, connection: ConnectionId) -> ConnectionHeartbeat {
        self.inner.channel.heartbeat(connection)
    }

    // --- Connections ---

    /// Starts accepting connections on `addr` and returns the bound address.
    pub async fn bind(&self, addr: &str) -> Result<SocketAddr, ConnectError> {
        self.ensure_alive()?;
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let task = tokio::spawn(accept_loop(Arc::downgrade(&self.inner), listener));
        if let Some(previous) = self.inner.lock_listener().replace(task) {
            previous.abort();
        }
        info!(endpoint = %self.name(), %local, "listening");
        Ok(local)
    }

    /// Connects to the endpoint listening at `target` (`host:port`).
    pub async fn connect(&self, target: &str) -> Result<ConnectionId, ConnectError> {
        self.ensure_alive()?;
        let timeout = self.inner.settings.connect_timeout;
        let addr = tokio::net::lookup_host(target)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConnectError::NoSuchEndpoint(target.to_string()))?;

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Err(_) => return Err(ConnectError::Timeout(timeout)),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(ConnectError::NoSuchEndpoint(target.to_string()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(stream)) => stream,
        };
        let transport = TcpTransport::new(stream, self.inner.settings.max_frame_len);
        self.connect_transport(Box::new(transport)).await
    }

    /// Runs the connecting side of the handshake over `transport`.
    pub async fn connect_transport(&self, transport: Box<dyn Transport>) -> Result<ConnectionId, ConnectError> {
        self.ensure_alive()?;
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let timeout = self.inner.settings.connect_timeout;

        let (remote, challenge) = match recv_handshake(&transport, timeout).await? {
            Frame::Hello { endpoint, challenge } => (endpoint, challenge),
            other => return Err(ConnectError::Handshake(format!("expected hello, got {}", other.kind()))),
        };

        let response = match (challenge, self.inner.settings.secret.as_deref()) {
            (None, _) => None,
            (Some(challenge), Some(secret)) => Some(auth::respond(&challenge, secret)),
            (Some(_), None) => {
                let login = Frame::Login { endpoint: self.name().to_string(), response: None };
                let _ = send_handshake(&transport, &login).await;
                transport.close().await;
                return Err(ConnectError::AuthenticationRequired);
            }
        };

        send_handshake(&transport, &Frame::Login { endpoint: self.name().to_string(), response }).await?;

        match recv_handshake(&transport, timeout).await? {
            Frame::Welcome { connection_id, .. } => self.attach(ConnectionId(connection_id), transport, remote).await,
            Frame::Rejected { reason } => {
                transport.close().await;
                Err(match reason {
                    RejectReason::AuthenticationRequired => ConnectError::AuthenticationRequired,
                    RejectReason::AuthenticationFailed => ConnectError::AuthenticationFailed,
                    RejectReason::Protocol(message) => ConnectError::Handshake(message),
                })
            }
            other => Err(ConnectError::Handshake(format!("expected welcome, got {}", other.kind()))),
        }
    }

    /// Runs the accepting side of the handshake over `transport`.
    pub async fn accept_transport(&self, transport: Box<dyn Transport>) -> Result<ConnectionId, ConnectError> {
        self.ensure_alive()?;
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let timeout = self.inner.settings.connect_timeout;
        let secret = self.inner.settings.secret.clone();
        let challenge = secret.as_ref().map(|_| auth::challenge());

        let hello = Frame::Hello { endpoint: self.name().to_string(), challenge: challenge.clone() };
        send_handshake(&transport, &hello).await?;

        let (remote, response) = match recv_handshake(&transport, timeout).await? {
            Frame::Login { endpoint, response } => (endpoint, response),
            other => {
                let message = format!("expected login, got {}", other.kind());
                reject(&transport, RejectReason::Protocol(message.clone())).await;
                return Err(ConnectError::Handshake(message));
            }
        };

        if let (Some(secret), Some(challenge)) = (secret.as_deref(), challenge.as_deref()) {
            match response.as_deref() {
                None => {
                    reject(&transport, RejectReason::AuthenticationRequired).await;
                    return Err(ConnectError::AuthenticationRequired);
                }
                Some(answer) if !auth::verify(challenge, secret, answer) => {
                    warn!(endpoint = %self.name(), %remote, "rejecting connection with a wrong secret");
                    reject(&transport, RejectReason::AuthenticationFailed).await;
                    return Err(ConnectError::AuthenticationFailed);
                }
                Some(_) => {}
            }
        }

        let id = ConnectionId::random();
        let welcome = Frame::Welcome { endpoint: self.name().to_string(), connection_id: id.0 };
        send_handshake(&transport, &welcome).await?;
        self.attach(id, transport, remote).await
    }

    async fn attach(&self, id: ConnectionId, transport: Arc<dyn Transport>, remote: String) -> Result<ConnectionId, ConnectError> {
        if self.is_disposed() {
            transport.close().await;
            return Err(ConnectError::Disposed);
        }
        self.inner.channel.attach(id, transport.clone(), remote.clone());
        info!(endpoint = %self.name(), connection = %id, %remote, peer = %transport.peer(), "connected");
        let _ = self.inner.events.send(EndpointEvent::Connected { connection: id, remote });

        let task = tokio::spawn(self.inner.clone().serve(id, transport));
        self.inner.lock_receivers().insert(id, task);
        Ok(id)
    }

    /// Closes one connection. Calls waiting on it fail with `ConnectionLost`.
    pub async fn disconnect(&self, connection: ConnectionId) -> bool {
        if let Some(task) = self.inner.lock_receivers().remove(&connection) {
            task.abort();
        }
        self.inner.drop_connection(connection, "disconnected locally", true).await
    }

    /// Closes every connection, stops listening and releases all servants.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.inner.lock_listener().take() {
            listener.abort();
        }
        let receivers: Vec<JoinHandle<()>> = self.inner.lock_receivers().drain().map(|(_, t)| t).collect();
        for task in receivers {
            task.abort();
        }
        for connection in self.inner.channel.close("endpoint disposed") {
            let _ = connection.send_frame(&Frame::Goodbye).await;
            connection.transport.close().await;
            let _ = self.inner.events.send(EndpointEvent::Disconnected {
                connection: connection.id,
                reason: "endpoint disposed".to_string(),
            });
        }
        self.inner.registry.dispose();
        self.inner.queues.close();
        info!(endpoint = %self.name(), "disposed");
    }
}

impl EndpointInner {
    fn prune_collected(&self) {
        for id in self.registry.prune_collected() {
            self.queues.forget_object(id);
        }
    }

    fn lock_receivers(&self) -> MutexGuard<'_, HashMap<ConnectionId, JoinHandle<()>>> {
        self.receivers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn serve(self: Arc<Self>, id: ConnectionId, transport: Arc<dyn Transport>) {
        let outcome: Result<String, String> = loop {
            match transport.recv().await {
                Ok(Some(bytes)) => match Frame::decode(&bytes) {
                    Ok(Frame::Goodbye) => break Ok("closed by remote".to_string()),
                    Ok(frame) => self.handle_frame(id, &transport, frame).await,
                    Err(e) => break Err(e.to_string()),
                },
                Ok(None) => break Ok("stream closed".to_string()),
                Err(e) => break Err(e.to_string()),
            }
        };

        let reason = match outcome {
            Ok(reason) => reason,
            Err(reason) => {
                warn!(endpoint = %self.settings.name, connection = %id, "connection failed: {}", reason);
                let _ = self.events.send(EndpointEvent::Failure { connection: id, reason: reason.clone() });
                reason
            }
        };
        self.lock_receivers().remove(&id);
        self.drop_connection(id, &reason, false).await;
    }

    async fn drop_connection(&self, id: ConnectionId, reason: &str, say_goodbye: bool) -> bool {
        let Some(connection) = self.channel.detach(id, reason) else {
            return false;
        };
        if say_goodbye {
            let _ = connection.send_frame(&Frame::Goodbye).await;
        }
        connection.transport.close().await;
        info!(endpoint = %self.settings.name, connection = %id, "disconnected: {}", reason);
        let _ = self.events.send(EndpointEvent::Disconnected { connection: id, reason: reason.to_string() });
        true
    }

    async fn handle_frame(&self, id: ConnectionId, transport: &Arc<dyn Transport>, frame: Frame) {
        match frame {
            Frame::Call { rpc_id, object_id, interface, method, args } => {
                self.handle_call(transport, rpc_id, ObjectId(object_id), interface, method, args).await;
            }
            Frame::Result { rpc_id, payload } => {
                self.channel.complete(rpc_id, Ok(payload));
            }
            Frame::Fault { rpc_id, reason } => {
                self.channel.complete(rpc_id, Err(reason.into()));
            }
            Frame::HeartbeatRequest { rpc_id } => {
                // Answered from the runtime, so a starved runtime stops answering.
                let transport = transport.clone();
                tokio::spawn(async move {
                    send_reply(&transport, Frame::HeartbeatResponse { rpc_id }).await;
                });
            }
            Frame::HeartbeatResponse { rpc_id } => {
                self.channel.complete(rpc_id, Ok(Payload::default()));
            }
            other => {
                warn!(connection = %id, kind = other.kind(), "ignoring handshake frame on an established connection");
            }
        }
    }

    async fn handle_call(
        &self,
        transport: &Arc<dyn Transport>,
        rpc_id: u64,
        object_id: ObjectId,
        interface: String,
        method: String,
        args: Payload,
    ) {
        let Some(servant) = self.registry.servant(object_id) else {
            debug!(%object_id, %method, "call for unknown servant");
            self.queues.forget_object(object_id);
            let reason = FailureReason::NoSuchServant { object_id: object_id.0 };
            send_reply(transport, Frame::Fault { rpc_id, reason }).await;
            return;
        };

        if servant.interface().name != interface {
            let reason = FailureReason::NoSuchMethod { interface, method };
            send_reply(transport, Frame::Fault { rpc_id, reason }).await;
            return;
        }

        let dispatch = servant.dispatch_of(&method).unwrap_or_default();
        let invocation = match servant.invoke(&method, args) {
            Ok(invocation) => invocation,
            Err(e) => {
                send_reply(transport, Frame::Fault { rpc_id, reason: e.into_failure() }).await;
                return;
            }
        };

        let reply_to = transport.clone();
        let job: Job = Box::pin(async move {
            let frame = match AssertUnwindSafe(invocation).catch_unwind().await {
                Ok(Ok(payload)) => Frame::Result { rpc_id, payload },
                Ok(Err(e)) => Frame::Fault { rpc_id, reason: e.into_failure() },
                Err(panic) => Frame::Fault {
                    rpc_id,
                    reason: FailureReason::Exception(panic_exception(panic)),
                },
            };
            send_reply(&reply_to, frame).await;
        });
        self.queues.submit(dispatch, &interface, &method, object_id, job);
    }
}

async fn accept_loop(weak: Weak<EndpointInner>, listener: TcpListener) {
    loop {
        let accepted = listener.accept().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => {
                let endpoint = RemotingEndpoint { inner };
                let transport = TcpTransport::new(stream, endpoint.settings().max_frame_len);
                tokio::spawn(async move {
                    if let Err(e) = endpoint.accept_transport(Box::new(transport)).await {
                        warn!(%peer, "rejected incoming connection: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn recv_handshake(transport: &Arc<dyn Transport>, timeout: Duration) -> Result<Frame, ConnectError> {
    let bytes = tokio::time::timeout(timeout, transport.recv())
        .await
        .map_err(|_| ConnectError::Timeout(timeout))??
        .ok_or_else(|| ConnectError::Handshake("connection closed during handshake".to_string()))?;
    Frame::decode(&bytes).map_err(|e| ConnectError::Handshake(e.to_string()))
}

async fn send_handshake(transport: &Arc<dyn Transport>, frame: &Frame) -> Result<(), ConnectError> {
    let bytes = frame.encode().map_err(|e| ConnectError::Handshake(e.to_string()))?;
    transport.send(&bytes).await?;
    Ok(())
}

async fn reject(transport: &Arc<dyn Transport>, reason: RejectReason) {
    let _ = send_handshake(transport, &Frame::Rejected { reason }).await;
    transport.close().await;
}

async fn send_reply(transport: &Arc<dyn Transport>, frame: Frame) {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(kind = frame.kind(), "failed to encode reply: {}", e);
            return;
        }
    };
    if let Err(e) = transport.send(&bytes).await {
        debug!(kind = frame.kind(), "reply not delivered: {}", e);
    }
}

fn panic_exception(panic: Box<dyn Any + Send>) -> RemoteException {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "subject panicked".to_string());
    RemoteException::new("Panic", message)
}
