//! Workers and their registry.
//!
//! - `worker` — the `Worker` trait, per-worker context and handle
//! - `manager` — `WorkerManager`, builds and tracks workers from config files
//! - `http` — bundled worker that fetches URLs as a task chain

pub mod http;
pub mod manager;
pub mod worker;

pub use http::{HttpTaskConfig, HttpWorker, HttpWorkerConfig};
pub use manager::WorkerManager;
pub use worker::{Worker, WorkerContext, WorkerFactory, WorkerHandle, WorkerSummary, stable_id};
