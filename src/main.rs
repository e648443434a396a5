use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::task::JoinSet;

use worker_hub::config::{ClientConfig, LoggerConfig, ManagerConfig};
use worker_hub::events::{Event, EventBus, WorkerChange, topics};
use worker_hub::tasks::TaskSnapshot;
use worker_hub::worker::{HttpWorker, WorkerManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ManagerConfig::from_env().context("Invalid configuration")?;

    eprintln!("Worker Hub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Root: {}", config.root_path.display());
    eprintln!(
        "   Workers: {}/*.{}",
        config.root_path.join(&config.workers_dir).display(),
        config.extension
    );

    // ── Event bus ────────────────────────────────────────────────────────
    let events = EventBus::new();
    events.subscribe(topics::WORKER_ADD_REMOVE, |event| {
        if let Event::WorkerChanged { change, worker } = event {
            match change {
                WorkerChange::Added => tracing::info!(worker_id = %worker.id(), "Worker registered"),
                WorkerChange::Removed => tracing::info!(worker_id = %worker.id(), "Worker retired"),
            }
        }
    });
    events.subscribe(topics::WORKERS_LOAD, |event| {
        if let Event::WorkersLoaded { workers } = event {
            tracing::info!(count = workers.len(), "Worker registry ready");
        }
    });
    // Last terminal status of every task, keyed by (worker, task position)
    let results: Arc<Mutex<BTreeMap<(String, usize), TaskSnapshot>>> = Arc::default();
    let results_in = results.clone();
    events.subscribe(topics::TASK_STATUS, move |event| {
        if let Event::TaskStatus { worker_id, task } = event {
            if task.status.is_done() {
                results_in
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert((worker_id.clone(), task.index), task.clone());
            }
            tracing::info!(
                worker_id = %worker_id,
                task = %task.name,
                status = %task.status,
                attempts = task.attempts,
                "{}",
                task.message.as_deref().unwrap_or("")
            );
        }
    });

    // ── Workers ──────────────────────────────────────────────────────────
    let manager = Arc::new(
        WorkerManager::new(config, events)
            .with_logger_config(LoggerConfig::from_env()?)
            .with_client_config(ClientConfig::from_env()?)
            .with_factory(|| Box::new(HttpWorker::new())),
    );

    let workers = manager
        .load()
        .await
        .context("Failed to load workers")?;

    let mut runs = JoinSet::new();
    for worker in workers.iter().cloned() {
        runs.spawn(async move {
            worker.start().await;
            worker
        });
    }

    while let Some(joined) = runs.join_next().await {
        match joined {
            Ok(worker) => tracing::debug!(worker_id = %worker.id(), "Worker run finished"),
            Err(e) => tracing::error!("Worker run panicked: {}", e),
        }
    }

    let mut failed = 0usize;
    let results = results.lock().unwrap_or_else(|e| e.into_inner());
    for ((worker_id, _), task) in results.iter() {
        match &task.error {
            Some(reason) => {
                failed += 1;
                eprintln!(
                    "[{}] {} failed after {} attempt(s): {}",
                    worker_id, task.label, task.attempts, reason
                );
            }
            None => eprintln!("[{}] {} {}", worker_id, task.label, task.status),
        }
    }
    drop(results);

    if manager.is_debug() {
        for worker in manager.workers().await {
            eprintln!("{}", serde_json::to_string_pretty(&worker.summary())?);
        }
    }

    if failed > 0 {
        anyhow::bail!("{failed} task(s) failed");
    }
    Ok(())
}
