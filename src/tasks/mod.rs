//! Task chains.
//!
//! - `task` — retryable unit of work with lifecycle hooks
//! - `manager` — ordered, single-flight chain over a set of tasks

pub mod manager;
pub mod task;

pub use manager::{ChainHandle, StatusObserver, TaskManager};
pub use task::{Outcome, Task, TaskSnapshot, TaskStatus};
