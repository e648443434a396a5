//! Sequential task chain.
//!
//! `TaskManager` sorts its tasks once by `order` and runs them one at a time.
//! Each finished task either advances the chain to the next position, or
//! stops it (failure, suppressed chaining, or an external stop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::error::TaskError;
use crate::tasks::task::Task;

/// Receives every status change of a task driven by the manager.
pub type StatusObserver = Arc<dyn Fn(&Task) + Send + Sync>;

type Callback = Arc<dyn Fn() + Send + Sync>;

/// Chain state shared between the manager and its handles.
struct ChainState {
    started: AtomicBool,
    on_stop: RwLock<Option<Callback>>,
}

/// Cloneable control over a running chain.
///
/// Stopping only prevents the next hop; a task already running finishes its
/// current attempt loop.
#[derive(Clone)]
pub struct ChainHandle {
    state: Arc<ChainState>,
}

impl ChainHandle {
    pub fn is_started(&self) -> bool {
        self.state.started.load(Ordering::SeqCst)
    }

    /// Stop the chain and fire the stop callback.
    pub fn stop(&self) {
        self.state.started.store(false, Ordering::SeqCst);
        let callback = self
            .state
            .on_stop
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn set_started(&self, started: bool) {
        self.state.started.store(started, Ordering::SeqCst);
    }
}

/// One step of the chain loop.
enum Step {
    Run(usize),
    Advance(Option<usize>),
}

/// Orders a set of tasks and drives them one at a time.
pub struct TaskManager {
    tasks: Vec<Task>,
    current: Option<usize>,
    sorted: bool,
    next_key: u64,
    chain: ChainHandle,
    observers: Vec<StatusObserver>,
    on_start: Option<Callback>,
    on_complete: Option<Callback>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            current: None,
            sorted: false,
            next_key: 0,
            chain: ChainHandle {
                state: Arc::new(ChainState {
                    started: AtomicBool::new(false),
                    on_stop: RwLock::new(None),
                }),
            },
            observers: Vec::new(),
            on_start: None,
            on_complete: None,
        }
    }

    /// Handle for stopping the chain while it runs.
    pub fn handle(&self) -> ChainHandle {
        self.chain.clone()
    }

    pub fn is_started(&self) -> bool {
        self.chain.is_started()
    }

    /// The task the chain is on, if any.
    pub fn current(&self) -> Option<&Task> {
        self.current.and_then(|pos| self.tasks.get(pos))
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Append a task. The list is re-sorted on the next `start`.
    pub fn add(&mut self, mut task: Task) {
        task.reset();
        task.key = self.next_key;
        self.next_key += 1;
        debug!(task = %task.name(), order = task.order(), "Task added");
        self.tasks.push(task);
        self.sorted = false;
    }

    /// First task with the given name.
    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.name() == name)
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.name() == name)
    }

    /// Designate the task `start` resumes from. Returns false if no task has
    /// that name.
    pub fn set_current(&mut self, name: &str) -> bool {
        self.sort();
        match self.position(name) {
            Some(pos) => {
                self.current = Some(pos);
                true
            }
            None => false,
        }
    }

    /// Register a status observer. Observers run in registration order,
    /// before the task's own start/retry hooks.
    pub fn on_status_change<F>(&mut self, observer: F)
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.observers.push(Arc::new(observer));
    }

    pub fn on_start<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(callback));
    }

    pub fn on_stop<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .chain
            .state
            .on_stop
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    pub fn on_complete<F>(&mut self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
    }

    /// Sort by ascending order (stable) and assign positions. No-op until a
    /// task is added.
    fn sort(&mut self) {
        if self.sorted {
            return;
        }

        let current_key = self.current.map(|pos| self.tasks[pos].key);
        self.tasks.sort_by_key(|t| t.order());
        for (index, task) in self.tasks.iter_mut().enumerate() {
            task.index = index;
        }
        self.current = current_key.and_then(|key| self.tasks.iter().position(|t| t.key == key));
        self.sorted = true;
    }

    fn notifier(&self) -> impl Fn(&Task) + Send + Sync + use<> {
        let observers = self.observers.clone();
        move |task: &Task| {
            for observer in &observers {
                observer(task);
            }
        }
    }

    /// Run the chain: resume the current task if one is designated, otherwise
    /// start from the first position. Returns when the chain completes, a
    /// task fails, or the chain is stopped.
    pub async fn start(&mut self) {
        self.sort();
        if self.tasks.is_empty() {
            return;
        }

        self.chain.set_started(true);
        if let Some(callback) = &self.on_start {
            callback();
        }
        info!(tasks = self.tasks.len(), "Task chain started");

        let mut step = match self.current {
            Some(pos) => Step::Run(pos),
            None => Step::Advance(None),
        };

        loop {
            step = match step {
                Step::Run(pos) => {
                    if !self.run_at(pos).await {
                        break;
                    }
                    Step::Advance(Some(pos))
                }
                Step::Advance(prev) => match self.advance(prev) {
                    Some(next) => Step::Run(next),
                    None => break,
                },
            };
        }
    }

    /// Run the task at `pos`. Returns whether the chain may advance.
    async fn run_at(&mut self, pos: usize) -> bool {
        let notify = self.notifier();
        let task = &mut self.tasks[pos];
        task.run(Some(&notify)).await;

        if let Some(reason) = task.error() {
            warn!(
                task = %task.name(),
                attempts = task.attempts(),
                "Task failed, stopping chain: {}",
                reason
            );
            self.chain.set_started(false);
            return false;
        }

        if !task.chain_next {
            self.chain.set_started(false);
            return false;
        }

        true
    }

    /// Pick the position after `prev` and make it current. Returns `None`
    /// when the chain stops or completes.
    fn advance(&mut self, prev: Option<usize>) -> Option<usize> {
        if let Some(pos) = prev
            && self.tasks[pos].is_error()
        {
            self.chain.set_started(false);
            return None;
        }

        if !self.is_started() {
            debug!("Task chain stopped before next hop");
            return None;
        }

        let next = prev.map_or(0, |pos| self.tasks[pos].index + 1);
        if next >= self.tasks.len() {
            self.chain.set_started(false);
            info!(tasks = self.tasks.len(), "Task chain complete");
            if let Some(callback) = &self.on_complete {
                callback();
            }
            return None;
        }

        self.tasks[next].reset();
        if let Some(pos) = prev {
            self.tasks[pos].reset();
        }
        self.current = Some(next);
        Some(next)
    }

    /// Stop chaining after the running task and fire the stop callback.
    pub fn stop(&self) {
        self.chain.stop();
    }

    /// Clear started/current and reset every task's run state.
    pub fn reset(&mut self) {
        self.chain.set_started(false);
        self.current = None;
        for task in &mut self.tasks {
            task.reset();
        }
    }

    /// Run the first task named `name` in isolation. The chain does not
    /// advance and `current` is left untouched.
    pub async fn once(&mut self, name: &str) -> Result<(), TaskError> {
        let pos = self.position(name).ok_or_else(|| TaskError::NotFound {
            name: name.to_string(),
        })?;
        let notify = self.notifier();

        let task = &mut self.tasks[pos];
        task.reset();
        task.chain_next = false;
        task.run(Some(&notify)).await;
        task.chain_next = true;

        // A suppressed hop ends the chain, same as in `run_at`.
        self.chain.set_started(false);

        let task = &self.tasks[pos];
        match task.error() {
            Some(reason) => Err(TaskError::Failed {
                name: task.name().to_string(),
                attempts: task.attempts(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
