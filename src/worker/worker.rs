//! Worker contract and the collaborators the registry attaches to it.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::Cache;
use crate::error::WorkerError;
use crate::events::EventBus;
use crate::logger::WorkerLogger;
use crate::tasks::{ChainHandle, TaskManager};

/// Collaborators owned by one registered worker.
///
/// Built by `WorkerManager::add` after `init` returns the worker's id.
/// Cloning shares the same task manager, cache, logger and client.
#[derive(Clone)]
pub struct WorkerContext {
    id: String,
    index: usize,
    tasks: Arc<Mutex<TaskManager>>,
    chain: ChainHandle,
    cache: Arc<Cache>,
    logger: Arc<WorkerLogger>,
    client: reqwest::Client,
    events: EventBus,
}

impl WorkerContext {
    pub(crate) fn new(
        id: String,
        index: usize,
        tasks: TaskManager,
        cache: Cache,
        logger: WorkerLogger,
        client: reqwest::Client,
        events: EventBus,
    ) -> Self {
        let chain = tasks.handle();
        Self {
            id,
            index,
            tasks: Arc::new(Mutex::new(tasks)),
            chain,
            cache: Arc::new(cache),
            logger: Arc::new(logger),
            client,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The worker's task chain. Held locked for the duration of a run.
    pub fn tasks(&self) -> &Arc<Mutex<TaskManager>> {
        &self.tasks
    }

    /// Stop/inspect the chain without taking the task lock.
    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn logger(&self) -> &Arc<WorkerLogger> {
        &self.logger
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// One configured automation unit.
///
/// Lifecycle, driven by `WorkerManager::add`: `init` → `register_listeners`
/// → `boot`. After registration the worker is shared and only `start`,
/// `stop` and `details` are called.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Parse the raw config and return the worker's stable id.
    fn init(&mut self, config: &[u8], source: Option<&Path>) -> Result<String, WorkerError>;

    /// Hook up chain callbacks and event subscriptions before boot.
    fn register_listeners(&mut self, _ctx: &WorkerContext) {}

    /// Prepare the worker, typically by adding tasks to its chain.
    async fn boot(&mut self, _ctx: &WorkerContext) -> Result<(), WorkerError> {
        Ok(())
    }

    /// Run the task chain to completion (or failure/stop).
    async fn start(&self, ctx: &WorkerContext) {
        ctx.tasks().lock().await.start().await;
    }

    /// Prevent the chain's next hop. Does not interrupt a running task.
    async fn stop(&self, ctx: &WorkerContext) {
        ctx.chain().stop();
    }

    /// Free-form description for observers.
    fn details(&self) -> serde_json::Value {
        serde_json::Value::Null
    }
}

/// Builds an uninitialized worker for every `add`.
pub type WorkerFactory = Arc<dyn Fn() -> Box<dyn Worker> + Send + Sync>;

/// A registered worker together with its context.
#[derive(Clone)]
pub struct WorkerHandle {
    ctx: WorkerContext,
    worker: Arc<dyn Worker>,
}

impl WorkerHandle {
    pub(crate) fn new(ctx: WorkerContext, worker: Box<dyn Worker>) -> Self {
        Self {
            ctx,
            worker: Arc::from(worker),
        }
    }

    pub fn id(&self) -> &str {
        self.ctx.id()
    }

    pub fn index(&self) -> usize {
        self.ctx.index()
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub async fn start(&self) {
        tracing::info!(worker_id = %self.id(), "Worker starting");
        self.worker.start(&self.ctx).await;
    }

    pub async fn stop(&self) {
        tracing::info!(worker_id = %self.id(), "Worker stopping");
        self.worker.stop(&self.ctx).await;
    }

    pub fn details(&self) -> serde_json::Value {
        self.worker.details()
    }

    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            id: self.id().to_string(),
            index: self.index(),
            running: self.ctx.chain().is_started(),
            details: self.details(),
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id())
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}

/// Serializable view of a registered worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSummary {
    pub id: String,
    pub index: usize,
    pub running: bool,
    pub details: serde_json::Value,
}

/// Derive a stable worker id: the config's `id` field, else the source file
/// stem, else a UUID v5 of the raw config bytes.
pub fn stable_id(config: &serde_json::Value, source: Option<&Path>, raw: &[u8]) -> String {
    if let Some(id) = config
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_string();
    }

    if let Some(stem) = source
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
    {
        return stem.to_string();
    }

    Uuid::new_v5(&Uuid::NAMESPACE_OID, raw).to_string()
}

/// Ids name the worker's cache directory, so they must be a single plain
/// path component.
pub(crate) fn validate_id(id: &str) -> Result<(), WorkerError> {
    if id.trim().is_empty() {
        return Err(WorkerError::MissingId);
    }
    if id == "." || id == ".." || id.contains(['/', '\\']) {
        return Err(WorkerError::InvalidConfig(format!(
            "worker id {id:?} is not a valid directory name"
        )));
    }
    Ok(())
}
