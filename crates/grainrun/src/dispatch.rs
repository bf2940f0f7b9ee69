//! # Dispatch Queues
//!
//! Routes inbound invocations to an execution context according to the
//! method's [`Dispatch`] strategy.
//!
//! ## Invariants
//! - A serial queue runs its jobs strictly in submission order and never two
//!   at a time.
//! - Jobs under different queue keys, and concurrent jobs, run in parallel.
//! - Queues belong to one endpoint and die with it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::ids::ObjectId;
use crate::interface::Dispatch;

pub type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueKey {
    Method { interface: String, method: String },
    Object { interface: String, object: ObjectId },
    Type { interface: String },
}

impl QueueKey {
    pub fn for_call(dispatch: Dispatch, interface: &str, method: &str, object: ObjectId) -> Option<Self> {
        match dispatch {
            Dispatch::Concurrent => None,
            Dispatch::PerMethod => Some(Self::Method {
                interface: interface.to_string(),
                method: method.to_string(),
            }),
            Dispatch::PerObject => Some(Self::Object { interface: interface.to_string(), object }),
            Dispatch::PerType => Some(Self::Type { interface: interface.to_string() }),
        }
    }
}

/// A single-worker pipeline.
struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    fn spawn(key: QueueKey) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(?key, "dispatch queue drained");
        });
        Self { tx }
    }
}

#[derive(Default)]
pub struct DispatchQueues {
    queues: Mutex<HashMap<QueueKey, SerialQueue>>,
}

impl DispatchQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<QueueKey, SerialQueue>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, dispatch: Dispatch, interface: &str, method: &str, object: ObjectId, job: Job) {
        let Some(key) = QueueKey::for_call(dispatch, interface, method, object) else {
            tokio::spawn(job);
            return;
        };

        let mut queues = self.lock();
        let queue = queues
            .entry(key.clone())
            .or_insert_with(|| SerialQueue::spawn(key.clone()));
        if let Err(rejected) = queue.tx.send(job) {
            // The worker is gone; start a fresh one for this key.
            warn!(?key, "dispatch queue worker vanished, restarting it");
            let fresh = SerialQueue::spawn(key.clone());
            let _ = fresh.tx.send(rejected.0);
            queues.insert(key, fresh);
        }
    }

    /// Drops the per-object queues of `object`, letting their workers finish.
    pub fn forget_object(&self, object: ObjectId) {
        self.lock()
            .retain(|key, _| !matches!(key, QueueKey::Object { object: o, .. } if *o == object));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every queue. Already submitted jobs still run to completion.
    pub fn close(&self) {
        self.lock().clear();
    }
}
