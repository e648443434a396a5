//! Error types for worker-hub.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Task chain errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task {name} not found")]
    NotFound { name: String },

    #[error("Task {name} failed after {attempts} attempt(s): {reason}")]
    Failed {
        name: String,
        attempts: u32,
        reason: String,
    },
}

/// Errors raised by a worker implementation while initializing or booting.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Invalid worker config: {0}")]
    InvalidConfig(String),

    #[error("Worker config has no usable id")]
    MissingId,

    #[error("Worker {id} failed to boot: {reason}")]
    BootFailed { id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Worker registry errors.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("No worker factory registered")]
    MissingFactory,

    #[error("Worker {id} already exists")]
    Duplicate { id: String },

    #[error("Worker {id} not found")]
    NotFound { id: String },

    #[error("No worker file matching *.{extension} found in {}", dir.display())]
    NoWorkerFiles { dir: PathBuf, extension: String },

    #[error("Failed to read worker file {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Logger error: {0}")]
    Logger(#[from] LoggerError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// File cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Invalid cache entry name: {0:?}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker log errors.
#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("Log file not found: {0}")]
    FileNotFound(String),

    #[error("Offset {offset} is out of range ({size} records)")]
    OutOfRange { offset: usize, size: usize },

    #[error("Failed to initialize log appender: {0}")]
    Appender(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// HTTP client errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to build HTTP client: {0}")]
    Build(String),

    #[error("Request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    #[error("Request to {url} returned status {status}")]
    Status { url: String, status: u16 },
}
