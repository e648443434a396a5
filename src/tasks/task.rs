//! Retryable unit of work.
//!
//! A `Task` wraps an async handler with a bounded retry policy, an optional
//! veto predicate for retries, and synchronous lifecycle hooks. Status moves
//! monotonically within one run: Pending → Start → Retry* → Fail | Success.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be started.
    Pending,
    /// Start hooks have run, first attempt pending.
    Start,
    /// A retry attempt is being prepared.
    Retry,
    /// The last attempt failed.
    Fail,
    /// The handler succeeded.
    Success,
}

impl TaskStatus {
    /// Check if this is a terminal state.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Success | Self::Fail)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Start => "start",
            Self::Retry => "retry",
            Self::Fail => "fail",
            Self::Success => "success",
        };
        write!(f, "{s}")
    }
}

/// Result of a single handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
}

impl Outcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure(reason.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<E: fmt::Display> From<Result<(), E>> for Outcome {
    fn from(result: Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e.to_string()),
        }
    }
}

/// Async work performed on every attempt.
pub type Handler = Arc<dyn Fn() -> BoxFuture<'static, Outcome> + Send + Sync>;

/// Decides whether another attempt may run, given the prior failure reason
/// and the index of the attempt about to run.
pub type RetryCondition = Arc<dyn Fn(&str, u32) -> bool + Send + Sync>;

type Hook = Arc<dyn Fn() + Send + Sync>;
type RetryHook = Arc<dyn Fn(&str, u32) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;
type MessageFn = Arc<dyn Fn(&Task) -> String + Send + Sync>;
type RetryMessageFn = Arc<dyn Fn(&Task, &str, u32) -> String + Send + Sync>;
type ErrorMessageFn = Arc<dyn Fn(&Task, &str) -> String + Send + Sync>;

/// Status sink supplied by a manager driving the task.
pub(crate) type Notify<'a> = &'a (dyn Fn(&Task) + Send + Sync);

#[derive(Clone, Default)]
struct TaskHooks {
    on_start: Option<Hook>,
    on_retry: Option<RetryHook>,
    on_error: Option<ErrorHook>,
    on_success: Option<Hook>,
    start_message: Option<MessageFn>,
    retry_message: Option<RetryMessageFn>,
    error_message: Option<ErrorMessageFn>,
    success_message: Option<MessageFn>,
}

/// Serializable view of a task, used as event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub name: String,
    pub label: String,
    pub order: i32,
    pub index: usize,
    pub status: TaskStatus,
    pub message: Option<String>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// A retryable unit of work.
pub struct Task {
    name: String,
    label: String,
    order: i32,
    /// Post-sort position, assigned by the manager.
    pub(crate) index: usize,
    /// Insertion key, assigned by the manager.
    pub(crate) key: u64,
    handler: Handler,
    retries: u32,
    retry_delay: Duration,
    retry_condition: Option<RetryCondition>,
    hooks: TaskHooks,
    message: Option<String>,
    status: TaskStatus,
    error: Option<String>,
    pub(crate) chain_next: bool,
    attempts: u32,
}

impl Task {
    /// Create a task that runs `handler` on every attempt.
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            order: 0,
            index: 0,
            key: 0,
            handler: Arc::new(move || handler().boxed()),
            retries: 1,
            retry_delay: Duration::ZERO,
            retry_condition: None,
            hooks: TaskHooks::default(),
            message: None,
            status: TaskStatus::Pending,
            error: None,
            chain_next: true,
            attempts: 0,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    /// Maximum attempts. Zero is treated as one.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Veto further attempts: returning `false` abandons the remaining retries.
    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&str, u32) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_start = Some(Arc::new(hook));
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, u32) + Send + Sync + 'static,
    {
        self.hooks.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hooks.on_error = Some(Arc::new(hook));
        self
    }

    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks.on_success = Some(Arc::new(hook));
        self
    }

    pub fn start_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task) -> String + Send + Sync + 'static,
    {
        self.hooks.start_message = Some(Arc::new(f));
        self
    }

    pub fn retry_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task, &str, u32) -> String + Send + Sync + 'static,
    {
        self.hooks.retry_message = Some(Arc::new(f));
        self
    }

    pub fn error_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task, &str) -> String + Send + Sync + 'static,
    {
        self.hooks.error_message = Some(Arc::new(f));
        self
    }

    pub fn success_message<F>(mut self, f: F) -> Self
    where
        F: Fn(&Task) -> String + Send + Sync + 'static,
    {
        self.hooks.success_message = Some(Arc::new(f));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn order(&self) -> i32 {
        self.order
    }

    /// Position in the manager's sorted list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Failure reason of the last attempt, if the task failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }

    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            name: self.name.clone(),
            label: self.label.clone(),
            order: self.order,
            index: self.index,
            status: self.status,
            message: self.message.clone(),
            attempts: self.attempts,
            error: self.error.clone(),
        }
    }

    /// Clear transient run state.
    pub(crate) fn reset(&mut self) {
        self.error = None;
        self.status = TaskStatus::Pending;
        self.chain_next = true;
        self.attempts = 0;
    }

    /// Run the task standalone. A task that already succeeded is not re-run.
    pub async fn start(&mut self) {
        self.run(None).await;
    }

    /// Run the task. When driven by a manager, `notify` receives the task on
    /// start, before each retry hook and once at the end of the run.
    pub(crate) async fn run(&mut self, notify: Option<Notify<'_>>) {
        if self.is_success() {
            if let Some(notify) = notify {
                notify(self);
            }
            return;
        }

        self.attempts = 0;
        if notify.is_some() || self.hooks.on_start.is_some() {
            self.status = TaskStatus::Start;
            if let Some(f) = self.hooks.start_message.clone() {
                self.message = Some(f(self));
            }
            if let Some(notify) = notify {
                notify(self);
            }
            if let Some(hook) = self.hooks.on_start.clone() {
                hook();
            }
        }

        self.retries = self.retries.max(1);
        for attempt in 0..self.retries {
            if attempt > 0 {
                self.status = TaskStatus::Retry;
                let prior = self.error.clone().unwrap_or_default();
                if let Some(f) = self.hooks.retry_message.clone() {
                    self.message = Some(f(self, &prior, attempt));
                }

                if let Some(condition) = &self.retry_condition
                    && self.error.is_some()
                    && !condition(&prior, attempt)
                {
                    tracing::debug!(task = %self.name, attempt, "Retry vetoed by condition");
                    break;
                }

                if !self.retry_delay.is_zero() {
                    tokio::time::sleep(self.retry_delay).await;
                }
                if let Some(notify) = notify {
                    notify(self);
                }
                if let Some(hook) = self.hooks.on_retry.clone() {
                    hook(&prior, attempt);
                }
            }

            self.attempts += 1;
            match (self.handler)().await {
                Outcome::Success => {
                    self.error = None;
                    break;
                }
                Outcome::Failure(reason) => {
                    tracing::debug!(
                        task = %self.name,
                        attempt = self.attempts,
                        max = self.retries,
                        "Task attempt failed: {}",
                        reason
                    );
                    self.status = TaskStatus::Fail;
                    if let Some(f) = self.hooks.error_message.clone() {
                        self.message = Some(f(self, &reason));
                    }
                    self.error = Some(reason);
                }
            }
        }

        match self.error.clone() {
            Some(reason) => {
                if let Some(hook) = self.hooks.on_error.clone() {
                    hook(&reason);
                }
                self.status = TaskStatus::Fail;
                if let Some(f) = self.hooks.error_message.clone() {
                    self.message = Some(f(self, &reason));
                }
            }
            None => {
                if let Some(hook) = self.hooks.on_success.clone() {
                    hook();
                }
                self.status = TaskStatus::Success;
                if let Some(f) = self.hooks.success_message.clone() {
                    self.message = Some(f(self));
                }
            }
        }

        if let Some(notify) = notify {
            notify(self);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("label", &self.label)
            .field("order", &self.order)
            .field("index", &self.index)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}
