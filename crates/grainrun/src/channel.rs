//! # Call Channel
//!
//! Correlates outgoing calls with incoming responses over the connections of
//! one endpoint.
//!
//! ## Invariants
//! - Every outgoing request registers exactly one pending entry under a fresh
//!   `rpc_id`; the entry is removed by the response, by a timeout, by the loss
//!   of its connection, or when the caller drops the handle.
//! - Losing a connection fails only the calls that were sent on it.
//! - After `close`, no new call is accepted and every waiter has been woken.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use grainrpc::Frame;
use grainrpc::Payload;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tracing::debug;

use crate::error::CallError;
use crate::heartbeat::Heartbeat;
use crate::ids::ConnectionId;
use crate::ids::ObjectId;
use crate::transport::Transport;

type Reply = Result<Payload, CallError>;

/// One attached connection.
pub struct Connection {
    pub id: ConnectionId,
    pub remote_name: String,
    pub transport: Arc<dyn Transport>,
}

impl Connection {
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), CallError> {
        let bytes = frame.encode()?;
        self.transport.send(&bytes).await?;
        Ok(())
    }
}

struct PendingResponse {
    connection: ConnectionId,
    tx: oneshot::Sender<Reply>,
}

pub struct CallChannel {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    pending: Arc<DashMap<u64, PendingResponse>>,
    rpc_gen: AtomicU64,
    call_timeout: Duration,
    runtime: Option<Handle>,
    closed: AtomicBool,
}

impl CallChannel {
    /// Captures the current runtime, if any, for blocking calls.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            pending: Arc::new(DashMap::new()),
            rpc_gen: AtomicU64::new(1),
            call_timeout,
            runtime: Handle::try_current().ok(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn attach(&self, id: ConnectionId, transport: Arc<dyn Transport>, remote_name: String) -> Arc<Connection> {
        let connection = Arc::new(Connection { id, remote_name, transport });
        self.connections.insert(id, connection.clone());
        connection
    }

    /// Removes a connection and fails every call still waiting on it.
    pub fn detach(&self, id: ConnectionId, reason: &str) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(&id)?;
        let orphaned: Vec<u64> = self
            .pending
            .iter()
            .filter(|e| e.value().connection == id)
            .map(|e| *e.key())
            .collect();
        debug!(connection = %id, pending = orphaned.len(), "detaching connection: {}", reason);
        for rpc_id in orphaned {
            if let Some((_, pending)) = self.pending.remove(&rpc_id) {
                let _ = pending.tx.send(Err(CallError::ConnectionLost(reason.to_string())));
            }
        }
        Some(connection)
    }

    /// Detaches every connection and refuses further calls.
    pub fn close(&self, reason: &str) -> Vec<Arc<Connection>> {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        let detached = ids.into_iter().filter_map(|id| self.detach(id, reason)).collect();

        let keys: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, pending)) = self.pending.remove(&key) {
                let _ = pending.tx.send(Err(CallError::ConnectionLost(reason.to_string())));
            }
        }
        detached
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>, CallError> {
        if self.is_closed() {
            return Err(CallError::NotConnected);
        }
        match self.connections.get(&id) {
            Some(connection) => Ok(connection.clone()),
            None => Err(CallError::ConnectionLost(format!("{} is no longer attached", id))),
        }
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }

    pub fn is_connected(&self) -> bool {
        !self.is_closed() && !self.connections.is_empty()
    }

    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Registers a pending response and returns the handle that resolves it.
    pub fn prepare(&self, connection: ConnectionId, timeout: Option<Duration>) -> PendingCall {
        let rpc_id = self.rpc_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(rpc_id, PendingResponse { connection, tx });

        // A detach that ran before the insert did not see this entry.
        if self.is_closed() || !self.connections.contains_key(&connection) {
            if let Some((_, pending)) = self.pending.remove(&rpc_id) {
                let reason = format!("{} is no longer attached", connection);
                let _ = pending.tx.send(Err(CallError::ConnectionLost(reason)));
            }
        }

        PendingCall {
            rpc_id,
            rx,
            deadline: timeout.map(|t| (t, Box::pin(tokio::time::sleep(t)))),
            pending: self.pending.clone(),
        }
    }

    /// Delivers a response. Late or duplicate responses are ignored.
    pub fn complete(&self, rpc_id: u64, reply: Reply) -> bool {
        match self.pending.remove(&rpc_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(reply);
                true
            }
            None => {
                debug!(rpc_id, "dropping response without a waiting caller");
                false
            }
        }
    }

    /// Sends a call and returns a handle to await or poll its response.
    pub async fn call_remote_method_async(
        &self,
        connection: ConnectionId,
        object_id: ObjectId,
        interface: &str,
        method: &str,
        args: Payload,
    ) -> Result<PendingCall, CallError> {
        let target = self.connection(connection)?;
        let call = self.prepare(connection, Some(self.call_timeout));
        let frame = Frame::Call {
            rpc_id: call.rpc_id,
            object_id: object_id.0,
            interface: interface.to_string(),
            method: method.to_string(),
            args,
        };
        target.send_frame(&frame).await?;
        Ok(call)
    }

    pub async fn call_remote_method(
        &self,
        connection: ConnectionId,
        object_id: ObjectId,
        interface: &str,
        method: &str,
        args: Payload,
    ) -> Result<Payload, CallError> {
        self.call_remote_method_async(connection, object_id, interface, method, args)
            .await?
            .await
    }

    /// Blocks the calling thread until the response arrives.
    ///
    /// Must be called from a thread that is not driving an async runtime.
    pub fn call_remote_method_blocking(
        &self,
        connection: ConnectionId,
        object_id: ObjectId,
        interface: &str,
        method: &str,
        args: Payload,
    ) -> Result<Payload, CallError> {
        if Handle::try_current().is_ok() {
            return Err(CallError::BlockingInAsyncContext);
        }
        let runtime = self.runtime.as_ref().ok_or(CallError::NotConnected)?;
        runtime.block_on(self.call_remote_method(connection, object_id, interface, method, args))
    }

    /// A heartbeat probing `connection`.
    pub fn heartbeat(self: &Arc<Self>, connection: ConnectionId) -> ConnectionHeartbeat {
        ConnectionHeartbeat { channel: self.clone(), connection }
    }
}

/// A call that has been sent and not yet answered.
///
/// Resolves to the response, or to `ConnectionLost` when the connection goes
/// away or the deadline passes. Dropping it forgets the call.
pub struct PendingCall {
    rpc_id: u64,
    rx: oneshot::Receiver<Reply>,
    deadline: Option<(Duration, Pin<Box<Sleep>>)>,
    pending: Arc<DashMap<u64, PendingResponse>>,
}

impl PendingCall {
    pub fn rpc_id(&self) -> u64 {
        self.rpc_id
    }

    /// Non-blocking check for a response.
    pub fn try_result(&mut self) -> Option<Reply> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(CallError::ConnectionLost("response channel closed".into())))
            }
        }
    }
}

impl Future for PendingCall {
    type Output = Reply;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Reply> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(reply)) => return Poll::Ready(reply),
            Poll::Ready(Err(_)) => {
                return Poll::Ready(Err(CallError::ConnectionLost("response channel closed".into())));
            }
            Poll::Pending => {}
        }
        if let Some((timeout, sleep)) = this.deadline.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                this.pending.remove(&this.rpc_id);
                return Poll::Ready(Err(CallError::ConnectionLost(format!("call timed out after {:?}", timeout))));
            }
        }
        Poll::Pending
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.pending.remove(&self.rpc_id);
    }
}

/// Checks one connection with heartbeat frames.
pub struct ConnectionHeartbeat {
    channel: Arc<CallChannel>,
    connection: ConnectionId,
}

impl Heartbeat for ConnectionHeartbeat {
    fn beat(&self) -> Result<BoxFuture<'static, Result<(), CallError>>, CallError> {
        let target = self.channel.connection(self.connection)?;
        let call = self.channel.prepare(self.connection, None);
        Ok(Box::pin(async move {
            target.send_frame(&Frame::HeartbeatRequest { rpc_id: call.rpc_id() }).await?;
            call.await.map(|_| ())
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::mock_transport::DuplexChannelTransport;

    fn attached(channel: &CallChannel) -> (ConnectionId, DuplexChannelTransport) {
        let (local, remote) = DuplexChannelTransport::pair();
        let id = ConnectionId::random();
        channel.attach(id, Arc::new(local), "remote".into());
        (id, remote)
    }

    #[tokio::test]
    async fn test_response_resolves_matching_call() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(5)));
        let (id, remote) = attached(&channel);

        let pending = channel
            .call_remote_method_async(id, ObjectId(3), "Echo", "say", Payload::encode(&"hi").unwrap())
            .await
            .unwrap();

        let frame = Frame::decode(&remote.recv().await.unwrap().unwrap()).unwrap();
        let Frame::Call { rpc_id, object_id, method, args, .. } = frame else {
            panic!("expected call, got {:?}", frame);
        };
        assert_eq!(object_id, 3);
        assert_eq!(method, "say");

        assert!(channel.complete(rpc_id, Ok(args)));
        let reply = pending.await.unwrap();
        assert_eq!(reply.decode::<String>().unwrap(), "hi");
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_detach_fails_only_that_connections_calls() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(5)));
        let (first, _first_remote) = attached(&channel);
        let (second, _second_remote) = attached(&channel);

        let lost = channel
            .call_remote_method_async(first, ObjectId(1), "I", "m", Payload::default())
            .await
            .unwrap();
        let mut kept = channel
            .call_remote_method_async(second, ObjectId(1), "I", "m", Payload::default())
            .await
            .unwrap();

        channel.detach(first, "peer went away");

        assert!(matches!(lost.await, Err(CallError::ConnectionLost(reason)) if reason == "peer went away"));
        assert!(kept.try_result().is_none());
        assert!(matches!(
            channel.call_remote_method(first, ObjectId(1), "I", "m", Payload::default()).await,
            Err(CallError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_connection_lost() {
        let channel = Arc::new(CallChannel::new(Duration::from_millis(50)));
        let (id, _remote) = attached(&channel);

        let result = channel
            .call_remote_method(id, ObjectId(1), "I", "m", Payload::default())
            .await;

        assert!(matches!(result, Err(CallError::ConnectionLost(reason)) if reason.contains("timed out")));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_close_refuses_new_calls() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(5)));
        let (id, _remote) = attached(&channel);
        let pending = channel
            .call_remote_method_async(id, ObjectId(1), "I", "m", Payload::default())
            .await
            .unwrap();

        channel.close("disposed");

        assert!(matches!(pending.await, Err(CallError::ConnectionLost(_))));
        assert!(matches!(
            channel.call_remote_method(id, ObjectId(1), "I", "m", Payload::default()).await,
            Err(CallError::NotConnected)
        ));
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_call_prepared_after_detach_fails_fast() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(30)));
        let (id, _remote) = attached(&channel);
        channel.detach(id, "peer went away");

        let pending = channel.prepare(id, Some(channel.call_timeout()));
        let result = tokio::time::timeout(Duration::from_secs(1), pending).await.unwrap();

        assert!(matches!(result, Err(CallError::ConnectionLost(_))));
        assert_eq!(channel.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_blocking_call_from_runtime_is_refused() {
        let channel = CallChannel::new(Duration::from_secs(5));
        let result = channel.call_remote_method_blocking(
            ConnectionId(1),
            ObjectId(1),
            "I",
            "m",
            Payload::default(),
        );
        assert!(matches!(result, Err(CallError::BlockingInAsyncContext)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_call_from_plain_thread() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(5)));
        let (id, remote) = attached(&channel);

        let responder = channel.clone();
        tokio::spawn(async move {
            let bytes = remote.recv().await.unwrap().unwrap();
            if let Frame::Call { rpc_id, .. } = Frame::decode(&bytes).unwrap() {
                responder.complete(rpc_id, Ok(Payload::encode(&7u32).unwrap()));
            }
        });

        let (tx, rx) = oneshot::channel();
        let caller = channel.clone();
        std::thread::spawn(move || {
            let result = caller.call_remote_method_blocking(id, ObjectId(1), "I", "m", Payload::default());
            let _ = tx.send(result);
        });

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.decode::<u32>().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_heartbeat_on_missing_connection_rejects_immediately() {
        let channel = Arc::new(CallChannel::new(Duration::from_secs(5)));
        let heartbeat = channel.heartbeat(ConnectionId(99));
        assert!(matches!(heartbeat.beat(), Err(CallError::ConnectionLost(_))));
    }
}
