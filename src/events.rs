//! Event bus — topic subscribers plus a broadcast channel for stream consumers.
//!
//! Subscribers are plain callbacks keyed by topic. `dispatch` calls them in
//! registration order on the caller's task; `dispatch_async` spawns one tokio
//! task per subscriber. A panicking subscriber is contained and logged.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, warn};

use crate::tasks::TaskSnapshot;
use crate::worker::WorkerHandle;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Published topics.
pub mod topics {
    pub const WORKER_ADD_REMOVE: &str = "worker.add_remove";
    pub const WORKERS_LOAD: &str = "workers.load";
    pub const TASK_STATUS: &str = "task.status";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerChange {
    Added,
    Removed,
}

/// Events published by the worker registry and task chains.
#[derive(Debug, Clone)]
pub enum Event {
    /// A worker was registered or retired.
    WorkerChanged {
        change: WorkerChange,
        worker: WorkerHandle,
    },
    /// A `load` finished; carries the full registry.
    WorkersLoaded { workers: Vec<WorkerHandle> },
    /// A task in a worker's chain changed status.
    TaskStatus {
        worker_id: String,
        task: TaskSnapshot,
    },
}

impl Event {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::WorkerChanged { .. } => topics::WORKER_ADD_REMOVE,
            Self::WorkersLoaded { .. } => topics::WORKERS_LOAD,
            Self::TaskStatus { .. } => topics::TASK_STATUS,
        }
    }
}

/// Topic subscriber callback.
pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

struct BusInner {
    handlers: RwLock<HashMap<String, Vec<Subscriber>>>,
    tx: broadcast::Sender<Event>,
}

/// Cheaply cloneable publish/subscribe hub.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                handlers: RwLock::new(HashMap::new()),
                tx,
            }),
        }
    }

    /// Subscribe a callback to a topic.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Drop every subscriber of a topic.
    pub fn unsubscribe(&self, topic: &str) {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic);
    }

    pub fn subscribers_count(&self, topic: &str) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .map_or(0, Vec::len)
    }

    /// Receive every published event, regardless of topic.
    pub fn listen(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    /// `listen` as a `Stream`.
    pub fn stream(&self) -> BroadcastStream<Event> {
        BroadcastStream::new(self.listen())
    }

    fn handlers_for(&self, topic: &str) -> Vec<Subscriber> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Call the topic's subscribers on the current task, then broadcast.
    pub fn dispatch(&self, event: Event) {
        let topic = event.topic();
        for handler in self.handlers_for(topic) {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(topic, "Event subscriber panicked");
            }
        }

        // Broadcast — ok if no receivers are listening
        let _ = self.inner.tx.send(event);
    }

    /// Run each subscriber on its own tokio task, then broadcast. Falls back
    /// to `dispatch` outside a runtime.
    pub fn dispatch_async(&self, event: Event) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(topic = event.topic(), "No tokio runtime, dispatching synchronously");
                self.dispatch(event);
                return;
            }
        };

        let topic = event.topic();
        for handler in self.handlers_for(topic) {
            let event = event.clone();
            runtime.spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                    error!(topic, "Event subscriber panicked");
                }
            });
        }

        let _ = self.inner.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
