//! Worker registry.
//!
//! Builds workers from on-disk config files through a registered factory,
//! wires each one to its own task chain, cache, log and HTTP client, and
//! publishes registry changes on the event bus.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::Cache;
use crate::client;
use crate::config::{ClientConfig, LoggerConfig, ManagerConfig};
use crate::error::{LoggerError, ManagerError};
use crate::events::{Event, EventBus, WorkerChange};
use crate::logger::WorkerLogger;
use crate::tasks::TaskManager;
use crate::worker::worker::{
    Worker, WorkerContext, WorkerFactory, WorkerHandle, validate_id,
};

const CACHE_DIR: &str = "cache";
const WORKERS_CACHE_DIR: &str = "_workers";

pub struct WorkerManager {
    config: ManagerConfig,
    logger_config: LoggerConfig,
    client_config: ClientConfig,
    events: EventBus,
    factory: Option<WorkerFactory>,
    workers: RwLock<Vec<WorkerHandle>>,
    /// Ids with an `add` in progress.
    pending: Mutex<HashSet<String>>,
    cursor: AtomicUsize,
    selected: Mutex<Option<WorkerHandle>>,
}

/// Holds an id in `WorkerManager::pending` until dropped.
struct Reservation<'a> {
    pending: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl WorkerManager {
    pub fn new(config: ManagerConfig, events: EventBus) -> Self {
        Self {
            config,
            logger_config: LoggerConfig::default(),
            client_config: ClientConfig::default(),
            events,
            factory: None,
            workers: RwLock::new(Vec::new()),
            pending: Mutex::new(HashSet::new()),
            cursor: AtomicUsize::new(0),
            selected: Mutex::new(None),
        }
    }

    /// Register the constructor used by `add`.
    pub fn with_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Worker> + Send + Sync + 'static,
    {
        self.factory = Some(std::sync::Arc::new(factory));
        self
    }

    pub fn with_logger_config(mut self, config: LoggerConfig) -> Self {
        self.logger_config = config;
        self
    }

    pub fn with_client_config(mut self, config: ClientConfig) -> Self {
        self.client_config = config;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_debug(&self) -> bool {
        self.config.debug
    }

    pub fn root_path(&self) -> &Path {
        &self.config.root_path
    }

    pub fn cache_path(&self) -> PathBuf {
        self.config.root_path.join(CACHE_DIR)
    }

    /// Cache and log directory of one worker.
    pub fn worker_cache_path(&self, id: &str) -> PathBuf {
        self.cache_path().join(WORKERS_CACHE_DIR).join(id)
    }

    pub fn workers_path(&self) -> PathBuf {
        self.config.root_path.join(&self.config.workers_dir)
    }

    /// Where the config file of worker `id` lives by convention.
    pub fn worker_file_path(&self, id: &str) -> PathBuf {
        self.workers_path()
            .join(format!("{id}.{}", self.config.extension))
    }

    /// Build, boot and register a worker from raw config.
    pub async fn add(
        &self,
        index: usize,
        config: &[u8],
        source: Option<&Path>,
    ) -> Result<WorkerHandle, ManagerError> {
        let factory = self.factory.as_ref().ok_or(ManagerError::MissingFactory)?;
        let mut worker = factory();

        let id = worker.init(config, source)?;
        validate_id(&id)?;
        // Reserve before checking the registry: a racing add either still
        // holds the id or has already registered it.
        let _reservation = self.reserve(&id)?;
        if self.contains(&id).await {
            return Err(ManagerError::Duplicate { id });
        }

        let ctx = self.build_context(&id, index).await?;
        worker.register_listeners(&ctx);
        worker.boot(&ctx).await?;
        let handle = WorkerHandle::new(ctx, worker);

        {
            let mut workers = self.workers.write().await;
            if workers.iter().any(|w| w.id() == id) {
                return Err(ManagerError::Duplicate { id });
            }
            workers.push(handle.clone());
        }

        info!(worker_id = %id, index, "Worker added");
        self.events.dispatch(Event::WorkerChanged {
            change: WorkerChange::Added,
            worker: handle.clone(),
        });
        Ok(handle)
    }

    fn reserve(&self, id: &str) -> Result<Reservation<'_>, ManagerError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if !pending.insert(id.to_string()) {
            return Err(ManagerError::Duplicate { id: id.to_string() });
        }
        Ok(Reservation {
            pending: &self.pending,
            id: id.to_string(),
        })
    }

    async fn build_context(&self, id: &str, index: usize) -> Result<WorkerContext, ManagerError> {
        let dir = self.worker_cache_path(id);

        let mut tasks = TaskManager::new();
        let events = self.events.clone();
        let worker_id = id.to_string();
        // Inline dispatch keeps one task's statuses in order.
        tasks.on_status_change(move |task| {
            events.dispatch(Event::TaskStatus {
                worker_id: worker_id.clone(),
                task: task.snapshot(),
            });
        });

        let cache = Cache::new(&dir);
        let logger_config = self.logger_config.clone();
        let log_dir = dir.clone();
        // Opening the appender creates the directory and file.
        let logger = tokio::task::spawn_blocking(move || WorkerLogger::new(log_dir, logger_config))
            .await
            .map_err(|e| LoggerError::Appender(format!("log setup task failed: {e}")))??;
        let client = client::build(&self.client_config)?;

        Ok(WorkerContext::new(
            id.to_string(),
            index,
            tasks,
            cache,
            logger,
            client,
            self.events.clone(),
        ))
    }

    async fn contains(&self, id: &str) -> bool {
        self.workers.read().await.iter().any(|w| w.id() == id)
    }

    /// Unregister and stop a worker.
    pub async fn remove(&self, id: &str) -> Result<WorkerHandle, ManagerError> {
        let handle = {
            let mut workers = self.workers.write().await;
            let pos = workers
                .iter()
                .position(|w| w.id() == id)
                .ok_or_else(|| ManagerError::NotFound { id: id.to_string() })?;
            workers.remove(pos)
        };

        handle.stop().await;

        let mut selected = self.selected.lock().unwrap_or_else(PoisonError::into_inner);
        if selected.as_ref().is_some_and(|w| w.id() == id) {
            *selected = None;
        }
        drop(selected);

        info!(worker_id = %id, "Worker removed");
        self.events.dispatch(Event::WorkerChanged {
            change: WorkerChange::Removed,
            worker: handle.clone(),
        });
        Ok(handle)
    }

    pub async fn get(&self, id: &str) -> Option<WorkerHandle> {
        self.workers
            .read()
            .await
            .iter()
            .find(|w| w.id() == id)
            .cloned()
    }

    /// Registered workers, in registry order.
    pub async fn workers(&self) -> Vec<WorkerHandle> {
        self.workers.read().await.clone()
    }

    pub async fn workers_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Config files in the workers directory, in lexical order.
    async fn worker_files(&self) -> Result<Vec<PathBuf>, ManagerError> {
        let dir = self.workers_path();
        let no_files = || ManagerError::NoWorkerFiles {
            dir: dir.clone(),
            extension: self.config.extension.clone(),
        };

        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(no_files()),
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let matches = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == self.config.extension);
            if matches && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(no_files());
        }
        files.sort();
        Ok(files)
    }

    async fn add_file(&self, index: usize, path: &Path) -> Result<WorkerHandle, ManagerError> {
        let contents = fs::read(path)
            .await
            .map_err(|source| ManagerError::ReadFile {
                path: path.to_path_buf(),
                source,
            })?;
        self.add(index, &contents, Some(path)).await
    }

    /// Register a worker for every config file in the workers directory.
    ///
    /// Aborts on the first failing file and removes the workers this call
    /// already added.
    pub async fn load(&self) -> Result<Vec<WorkerHandle>, ManagerError> {
        let files = self.worker_files().await?;
        info!(dir = %self.workers_path().display(), files = files.len(), "Loading workers");

        let mut added: Vec<String> = Vec::with_capacity(files.len());
        for (index, path) in files.iter().enumerate() {
            match self.add_file(index, path).await {
                Ok(handle) => added.push(handle.id().to_string()),
                Err(e) => {
                    warn!(file = %path.display(), "Worker load failed, rolling back: {}", e);
                    for id in added.iter().rev() {
                        if let Err(e) = self.remove(id).await {
                            warn!(worker_id = %id, "Rollback failed: {}", e);
                        }
                    }
                    return Err(e);
                }
            }
        }

        let workers = {
            let mut workers = self.workers.write().await;
            workers.sort_by_key(|w| w.index());
            workers.clone()
        };

        info!(workers = workers.len(), "Workers loaded");
        self.events.dispatch(Event::WorkersLoaded {
            workers: workers.clone(),
        });
        Ok(workers)
    }

    /// Stop and remove every worker, then `load`.
    pub async fn reload(&self) -> Result<Vec<WorkerHandle>, ManagerError> {
        let ids: Vec<String> = self
            .workers
            .read()
            .await
            .iter()
            .map(|w| w.id().to_string())
            .collect();

        for id in ids {
            if let Err(e) = self.remove(&id).await {
                debug!(worker_id = %id, "Already removed during reload: {}", e);
            }
        }
        self.cursor.store(0, Ordering::SeqCst);

        self.load().await
    }

    /// Round-robin over the registry. Records the pick for `selected_worker`.
    pub async fn next(&self) -> Option<WorkerHandle> {
        let workers = self.workers.read().await;
        if workers.is_empty() {
            return None;
        }

        let pos = self.cursor.fetch_add(1, Ordering::SeqCst) % workers.len();
        let handle = workers[pos].clone();
        drop(workers);

        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle.clone());
        Some(handle)
    }

    /// Last worker returned by `next`.
    pub fn selected_worker(&self) -> Option<WorkerHandle> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("config", &self.config)
            .field("has_factory", &self.factory.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::worker::stable_id;
    use tempfile::TempDir;

    struct PlainWorker;

    #[async_trait::async_trait]
    impl Worker for PlainWorker {
        fn init(&mut self, config: &[u8], source: Option<&Path>) -> Result<String, WorkerError> {
            let value: serde_json::Value = serde_json::from_slice(config)?;
            Ok(stable_id(&value, source, config))
        }
    }

    fn manager(dir: &TempDir) -> WorkerManager {
        WorkerManager::new(
            ManagerConfig::default().with_root(dir.path()),
            EventBus::new(),
        )
        .with_factory(|| Box::new(PlainWorker))
    }

    #[test]
    fn paths_follow_layout() {
        let m = WorkerManager::new(
            ManagerConfig::default().with_root("/srv/hub").with_extension(".cfg"),
            EventBus::new(),
        );
        assert_eq!(m.cache_path(), PathBuf::from("/srv/hub/cache"));
        assert_eq!(
            m.worker_cache_path("w1"),
            PathBuf::from("/srv/hub/cache/_workers/w1")
        );
        assert_eq!(m.workers_path(), PathBuf::from("/srv/hub/workers"));
        assert_eq!(
            m.worker_file_path("w1"),
            PathBuf::from("/srv/hub/workers/w1.cfg")
        );
        assert!(!m.is_debug());
    }

    #[tokio::test]
    async fn add_without_factory_fails() {
        let dir = TempDir::new().unwrap();
        let m = WorkerManager::new(
            ManagerConfig::default().with_root(dir.path()),
            EventBus::new(),
        );
        let err = m.add(0, br#"{"id":"a"}"#, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::MissingFactory));
    }

    #[tokio::test]
    async fn rejects_unsafe_ids() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let err = m.add(0, br#"{"id":"../escape"}"#, None).await.unwrap_err();
        assert!(matches!(err, ManagerError::Worker(WorkerError::InvalidConfig(_))));
        assert_eq!(m.workers_count().await, 0);
    }

    #[tokio::test]
    async fn invalid_json_is_worker_error() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        let err = m.add(0, b"not json", None).await.unwrap_err();
        assert!(matches!(err, ManagerError::Worker(WorkerError::Json(_))));
    }

    #[tokio::test]
    async fn next_on_empty_registry() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        assert!(m.next().await.is_none());
        assert!(m.selected_worker().is_none());
    }

    #[tokio::test]
    async fn removing_selected_worker_clears_selection() {
        let dir = TempDir::new().unwrap();
        let m = manager(&dir);
        m.add(0, br#"{"id":"only"}"#, None).await.unwrap();

        assert_eq!(m.next().await.unwrap().id(), "only");
        m.remove("only").await.unwrap();

        assert!(m.selected_worker().is_none());
    }
}
