//! Integration tests for the worker registry.
//!
//! Each test writes worker configs into a temp directory and drives a real
//! `WorkerManager` with a stub worker whose tasks succeed or fail on demand.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::time::timeout;

use worker_hub::config::ManagerConfig;
use worker_hub::error::{ManagerError, WorkerError};
use worker_hub::events::{Event, EventBus, WorkerChange, topics};
use worker_hub::tasks::{Outcome, Task, TaskStatus};
use worker_hub::worker::{Worker, WorkerContext, WorkerManager, stable_id};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Deserialize)]
struct StubTask {
    name: String,
    #[serde(default)]
    order: i32,
    #[serde(default)]
    fail: bool,
}

#[derive(Debug, Default, Deserialize)]
struct StubConfig {
    #[serde(default)]
    tasks: Vec<StubTask>,
    #[serde(default)]
    boot_error: bool,
}

/// Worker whose tasks are described entirely by its config.
#[derive(Default)]
struct StubWorker {
    config: StubConfig,
}

#[async_trait]
impl Worker for StubWorker {
    fn init(&mut self, config: &[u8], source: Option<&Path>) -> Result<String, WorkerError> {
        let value: serde_json::Value = serde_json::from_slice(config)?;
        self.config = serde_json::from_value(value.clone())?;
        Ok(stable_id(&value, source, config))
    }

    async fn boot(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        if self.config.boot_error {
            return Err(WorkerError::BootFailed {
                id: ctx.id().to_string(),
                reason: "configured to fail".into(),
            });
        }

        let mut tasks = ctx.tasks().lock().await;
        for cfg in &self.config.tasks {
            let fail = cfg.fail;
            tasks.add(
                Task::new(cfg.name.clone(), move || async move {
                    if fail {
                        Outcome::failure("stub failure")
                    } else {
                        Outcome::Success
                    }
                })
                .with_order(cfg.order),
            );
        }
        Ok(())
    }
}

fn manager_at(root: &Path, events: EventBus) -> WorkerManager {
    WorkerManager::new(ManagerConfig::default().with_root(root), events)
        .with_factory(|| Box::new(StubWorker::default()))
}

fn write_worker(root: &Path, file: &str, body: &str) {
    let dir = root.join("workers");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(file), body).unwrap();
}

fn record_changes(events: &EventBus) -> Arc<Mutex<Vec<(WorkerChange, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    events.subscribe(topics::WORKER_ADD_REMOVE, move |event| {
        if let Event::WorkerChanged { change, worker } = event {
            seen_in.lock().unwrap().push((*change, worker.id().to_string()));
        }
    });
    seen
}

#[tokio::test]
async fn duplicate_id_is_rejected_and_registry_unchanged() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());

    manager.add(0, br#"{"id":"alpha"}"#, None).await.unwrap();
    let err = manager.add(1, br#"{"id":"alpha"}"#, None).await.unwrap_err();

    assert!(matches!(err, ManagerError::Duplicate { id } if id == "alpha"));
    assert_eq!(manager.workers_count().await, 1);
}

#[tokio::test]
async fn concurrent_adds_of_same_id_register_once() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(manager_at(dir.path(), EventBus::new()));

    let mut joins = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        joins.push(tokio::spawn(async move {
            manager.add(i, br#"{"id":"same"}"#, None).await.is_ok()
        }));
    }

    let mut ok = 0;
    for join in joins {
        if join.await.unwrap() {
            ok += 1;
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(manager.workers_count().await, 1);
}

/// Counts boots and yields inside `boot` so racing adds interleave.
struct CountingWorker {
    boots: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for CountingWorker {
    fn init(&mut self, config: &[u8], source: Option<&Path>) -> Result<String, WorkerError> {
        let value: serde_json::Value = serde_json::from_slice(config)?;
        Ok(stable_id(&value, source, config))
    }

    async fn boot(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        tokio::task::yield_now().await;
        self.boots.fetch_add(1, Ordering::SeqCst);
        ctx.logger().info("booted", None);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_concurrent_add_never_boots() {
    let dir = TempDir::new().unwrap();
    let boots = Arc::new(AtomicUsize::new(0));
    let boots_in = boots.clone();
    let manager = Arc::new(
        WorkerManager::new(ManagerConfig::default().with_root(dir.path()), EventBus::new())
            .with_factory(move || {
                Box::new(CountingWorker {
                    boots: boots_in.clone(),
                })
            }),
    );

    let mut joins = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        joins.push(tokio::spawn(async move {
            manager.add(i, br#"{"id":"shared"}"#, None).await
        }));
    }

    let mut ok = 0;
    for join in joins {
        match join.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, ManagerError::Duplicate { .. })),
        }
    }

    assert_eq!(ok, 1);
    assert_eq!(boots.load(Ordering::SeqCst), 1);
    let worker = manager.get("shared").await.unwrap();
    let page = worker.context().logger().get(0, 0, None).await.unwrap();
    assert_eq!(page.size, 1);
}

#[tokio::test]
async fn id_is_free_again_after_failed_add() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());

    let err = manager
        .add(0, br#"{"id":"retry","boot_error":true}"#, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Worker(WorkerError::BootFailed { .. })));

    manager.add(0, br#"{"id":"retry"}"#, None).await.unwrap();
    assert_eq!(manager.workers_count().await, 1);
}

#[tokio::test]
async fn empty_directory_load_fails_without_touching_registry() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());
    manager.add(0, br#"{"id":"existing"}"#, None).await.unwrap();

    std::fs::create_dir_all(dir.path().join("workers")).unwrap();
    std::fs::write(dir.path().join("workers/readme.txt"), "not a worker").unwrap();

    let err = manager.load().await.unwrap_err();
    assert!(matches!(err, ManagerError::NoWorkerFiles { .. }));
    assert_eq!(manager.workers_count().await, 1);
    assert!(manager.get("existing").await.is_some());
}

#[tokio::test]
async fn missing_directory_load_fails() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());

    let err = manager.load().await.unwrap_err();
    assert!(matches!(err, ManagerError::NoWorkerFiles { .. }));
}

#[tokio::test]
async fn load_registers_files_in_lexical_order() {
    let dir = TempDir::new().unwrap();
    write_worker(dir.path(), "b.json", "{}");
    write_worker(dir.path(), "a.json", "{}");
    write_worker(dir.path(), "c.json", r#"{"id":"custom"}"#);
    write_worker(dir.path(), "ignored.yaml", "{}");

    let events = EventBus::new();
    let loaded = Arc::new(Mutex::new(Vec::new()));
    let loaded_in = loaded.clone();
    events.subscribe(topics::WORKERS_LOAD, move |event| {
        if let Event::WorkersLoaded { workers } = event {
            let ids: Vec<String> = workers.iter().map(|w| w.id().to_string()).collect();
            loaded_in.lock().unwrap().push(ids);
        }
    });

    let manager = manager_at(dir.path(), events);
    let workers = manager.load().await.unwrap();

    let ids: Vec<_> = workers.iter().map(|w| (w.id().to_string(), w.index())).collect();
    assert_eq!(
        ids,
        vec![
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("custom".to_string(), 2)
        ]
    );
    assert_eq!(*loaded.lock().unwrap(), vec![vec!["a", "b", "custom"]]);
}

#[tokio::test]
async fn failed_load_rolls_back_added_workers() {
    let dir = TempDir::new().unwrap();
    write_worker(dir.path(), "a.json", "{}");
    write_worker(dir.path(), "b.json", "{}");
    write_worker(dir.path(), "c.json", r#"{"boot_error": true}"#);

    let events = EventBus::new();
    let changes = record_changes(&events);
    let manager = manager_at(dir.path(), events);

    let err = manager.load().await.unwrap_err();

    assert!(matches!(
        err,
        ManagerError::Worker(WorkerError::BootFailed { id, .. }) if id == "c"
    ));
    assert_eq!(manager.workers_count().await, 0);
    assert_eq!(
        *changes.lock().unwrap(),
        vec![
            (WorkerChange::Added, "a".to_string()),
            (WorkerChange::Added, "b".to_string()),
            (WorkerChange::Removed, "b".to_string()),
            (WorkerChange::Removed, "a".to_string()),
        ]
    );
}

#[tokio::test]
async fn remove_publishes_and_unknown_id_errors() {
    let dir = TempDir::new().unwrap();
    let events = EventBus::new();
    let changes = record_changes(&events);
    let manager = manager_at(dir.path(), events);

    manager.add(0, br#"{"id":"gone"}"#, None).await.unwrap();
    let removed = manager.remove("gone").await.unwrap();

    assert_eq!(removed.id(), "gone");
    assert_eq!(manager.workers_count().await, 0);
    assert_eq!(changes.lock().unwrap().last(), Some(&(WorkerChange::Removed, "gone".to_string())));

    let err = manager.remove("gone").await.unwrap_err();
    assert!(matches!(err, ManagerError::NotFound { id } if id == "gone"));
}

#[tokio::test]
async fn reload_replaces_registry() {
    let dir = TempDir::new().unwrap();
    write_worker(dir.path(), "one.json", "{}");

    let manager = manager_at(dir.path(), EventBus::new());
    manager.load().await.unwrap();

    std::fs::remove_file(dir.path().join("workers/one.json")).unwrap();
    write_worker(dir.path(), "two.json", "{}");
    write_worker(dir.path(), "three.json", "{}");

    let workers = manager.reload().await.unwrap();

    let ids: Vec<_> = workers.iter().map(|w| w.id().to_string()).collect();
    assert_eq!(ids, vec!["three", "two"]);
    assert!(manager.get("one").await.is_none());
}

#[tokio::test]
async fn next_cycles_round_robin() {
    let dir = TempDir::new().unwrap();
    write_worker(dir.path(), "a.json", "{}");
    write_worker(dir.path(), "b.json", "{}");
    write_worker(dir.path(), "c.json", "{}");

    let manager = manager_at(dir.path(), EventBus::new());
    manager.load().await.unwrap();

    let mut picks = Vec::new();
    for _ in 0..4 {
        picks.push(manager.next().await.unwrap().id().to_string());
    }

    assert_eq!(picks, vec!["a", "b", "c", "a"]);
    assert_eq!(manager.selected_worker().unwrap().id(), "a");
}

#[tokio::test]
async fn worker_output_lives_under_cache_dir() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());

    let worker = manager.add(0, br#"{"id":"writer"}"#, None).await.unwrap();
    let ctx = worker.context();
    ctx.cache().write("page.html", b"<p/>", false).await.unwrap();
    ctx.logger().info("hello", None);

    let root = dir.path().join("cache/_workers/writer");
    assert_eq!(ctx.cache().root(), root);
    assert!(root.join("page.html").exists());
    assert_eq!(ctx.logger().get(0, 0, None).await.unwrap().logs[0].message, "hello");
}

#[tokio::test]
async fn task_statuses_are_forwarded_to_bus() {
    let dir = TempDir::new().unwrap();
    let events = EventBus::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    events.subscribe(topics::TASK_STATUS, move |event| {
        if let Event::TaskStatus { worker_id, task } = event {
            seen_in
                .lock()
                .unwrap()
                .push((worker_id.clone(), task.name.clone(), task.status));
        }
    });

    let manager = manager_at(dir.path(), events);
    let worker = manager
        .add(
            0,
            br#"{"id":"w","tasks":[{"name":"second","order":2},{"name":"first","order":1}]}"#,
            None,
        )
        .await
        .unwrap();

    timeout(TEST_TIMEOUT, worker.start()).await.unwrap();

    let seen = seen.lock().unwrap();
    let statuses: Vec<_> = seen.iter().map(|(_, n, s)| (n.as_str(), *s)).collect();
    assert_eq!(
        statuses,
        vec![
            ("first", TaskStatus::Start),
            ("first", TaskStatus::Success),
            ("second", TaskStatus::Start),
            ("second", TaskStatus::Success),
        ]
    );
    assert!(seen.iter().all(|(w, _, _)| w == "w"));
}

#[tokio::test]
async fn failing_task_halts_worker_chain() {
    let dir = TempDir::new().unwrap();
    let manager = manager_at(dir.path(), EventBus::new());
    let worker = manager
        .add(
            0,
            br#"{"id":"w","tasks":[{"name":"ok","order":1},{"name":"bad","order":2,"fail":true},{"name":"never","order":3}]}"#,
            None,
        )
        .await
        .unwrap();

    timeout(TEST_TIMEOUT, worker.start()).await.unwrap();

    let tasks = worker.context().tasks().lock().await;
    assert!(!tasks.is_started());
    assert!(tasks.get("bad").unwrap().is_error());
    assert_eq!(tasks.get("never").unwrap().status(), TaskStatus::Pending);
}

#[tokio::test]
async fn stop_on_removal_prevents_next_hop() {
    let dir = TempDir::new().unwrap();
    let manager = Arc::new(manager_at(dir.path(), EventBus::new()));
    let worker = manager.add(0, br#"{"id":"w"}"#, None).await.unwrap();

    let ran = Arc::new(Mutex::new(Vec::new()));
    {
        let mut tasks = worker.context().tasks().lock().await;
        let remover = manager.clone();
        let ran_first = ran.clone();
        tasks.add(Task::new("first", move || {
            let remover = remover.clone();
            let ran = ran_first.clone();
            async move {
                ran.lock().unwrap().push("first");
                remover.remove("w").await.map_or_else(
                    |e| Outcome::failure(e.to_string()),
                    |_| Outcome::Success,
                )
            }
        }));
        let ran_second = ran.clone();
        tasks.add(
            Task::new("second", move || {
                let ran = ran_second.clone();
                async move {
                    ran.lock().unwrap().push("second");
                    Outcome::Success
                }
            })
            .with_order(1),
        );
    }

    timeout(TEST_TIMEOUT, worker.start()).await.unwrap();

    assert_eq!(*ran.lock().unwrap(), vec!["first"]);
    assert_eq!(manager.workers_count().await, 0);
}
