//! JSON-configured worker that fetches a list of URLs in order.
//!
//! ```json
//! {
//!   "id": "status-pages",
//!   "name": "Status pages",
//!   "tasks": [
//!     { "name": "home", "order": 1, "url": "https://example.com/", "cache_as": "home.html" },
//!     { "name": "api", "order": 2, "url": "https://example.com/api", "retries": 3, "retry_delay_ms": 500 }
//!   ]
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache;
use crate::client;
use crate::error::WorkerError;
use crate::tasks::{Outcome, Task};
use crate::worker::worker::{Worker, WorkerContext, stable_id};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskConfig {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub order: i32,
    pub url: String,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    /// Cache entry name for the response body. Defaults to the task name.
    #[serde(default)]
    pub cache_as: Option<String>,
}

impl HttpTaskConfig {
    /// Cache entry the response body is written to.
    pub fn cache_entry(&self) -> &str {
        self.cache_as.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpWorkerConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<HttpTaskConfig>,
}

#[derive(Debug, Default)]
pub struct HttpWorker {
    id: String,
    config: HttpWorkerConfig,
}

impl HttpWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &HttpWorkerConfig {
        &self.config
    }

    fn build_task(&self, cfg: &HttpTaskConfig, ctx: &WorkerContext) -> Task {
        let client = ctx.client().clone();
        let cache = ctx.cache().clone();
        let url = cfg.url.clone();
        let entry = cfg.cache_entry().to_string();

        let mut task = Task::new(cfg.name.clone(), move || {
            let client = client.clone();
            let cache = cache.clone();
            let url = url.clone();
            let entry = entry.clone();
            async move {
                match client::get_bytes(&client, &url).await {
                    Ok(body) => {
                        cache.write_async(&entry, body, false);
                        Outcome::Success
                    }
                    Err(e) => Outcome::failure(e.to_string()),
                }
            }
        })
        .with_order(cfg.order);

        if let Some(label) = &cfg.label {
            task = task.with_label(label.clone());
        }
        if let Some(retries) = cfg.retries {
            task = task.with_retries(retries);
        }
        if let Some(ms) = cfg.retry_delay_ms {
            task = task.with_retry_delay(Duration::from_millis(ms));
        }

        let (start_log, retry_log, error_log, success_log) = (
            ctx.logger().clone(),
            ctx.logger().clone(),
            ctx.logger().clone(),
            ctx.logger().clone(),
        );
        let name = cfg.name.clone();
        let url = cfg.url.clone();
        let (n1, n2, n3, n4) = (name.clone(), name.clone(), name.clone(), name);

        task.on_start(move || {
            start_log.info(format!("{n1} started"), Some(json!({ "url": url })));
        })
        .on_retry(move |reason, attempt| {
            retry_log.debug(
                format!("{n2} retrying"),
                Some(json!({ "attempt": attempt, "reason": reason })),
            );
        })
        .on_error(move |reason| {
            error_log.error(format!("{n3} failed"), Some(json!({ "reason": reason })));
        })
        .on_success(move || {
            success_log.success(format!("{n4} done"), None);
        })
    }
}

#[async_trait]
impl Worker for HttpWorker {
    fn init(&mut self, config: &[u8], source: Option<&Path>) -> Result<String, WorkerError> {
        let value: serde_json::Value = serde_json::from_slice(config)?;
        let parsed: HttpWorkerConfig = serde_json::from_value(value.clone())?;

        for task in &parsed.tasks {
            if task.name.trim().is_empty() {
                return Err(WorkerError::InvalidConfig("task name is empty".into()));
            }
            if task.url.trim().is_empty() {
                return Err(WorkerError::InvalidConfig(format!(
                    "task {} has no url",
                    task.name
                )));
            }
            let entry = task.cache_entry();
            if cache::validate_name(entry).is_err() {
                return Err(WorkerError::InvalidConfig(format!(
                    "task {} has an invalid cache entry name {entry:?}",
                    task.name
                )));
            }
        }

        self.id = stable_id(&value, source, config);
        self.config = parsed;
        Ok(self.id.clone())
    }

    async fn boot(&mut self, ctx: &WorkerContext) -> Result<(), WorkerError> {
        let mut tasks = ctx.tasks().lock().await;
        for cfg in &self.config.tasks {
            tasks.add(self.build_task(cfg, ctx));
        }
        ctx.logger().info(
            "Worker booted",
            Some(json!({ "tasks": self.config.tasks.len() })),
        );
        tracing::debug!(worker_id = %ctx.id(), tasks = self.config.tasks.len(), "HTTP worker booted");
        Ok(())
    }

    fn details(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "name": self.config.name,
            "tasks": self.config.tasks.iter().map(|t| &t.name).collect::<Vec<_>>(),
        })
    }
}
