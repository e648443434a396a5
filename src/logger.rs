//! Per-worker structured log.
//!
//! Records are appended as one JSON object per line to a daily rolling file
//! (`log.YYYY-MM-DD.txt`, UTC) under the worker's directory, and can be read
//! back a page at a time.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

use crate::config::LoggerConfig;
use crate::error::LoggerError;

const FILE_PREFIX: &str = "log";
const FILE_SUFFIX: &str = "txt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Success,
    Error,
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub time: DateTime<Utc>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(rename = "type")]
    pub level: LogLevel,
}

/// A page of records from one day's file.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub offset: usize,
    pub limit: usize,
    /// Total records in the file.
    pub size: usize,
    /// Records in this page.
    pub count: usize,
    pub logs: Vec<LogRecord>,
}

pub struct WorkerLogger {
    root: PathBuf,
    config: LoggerConfig,
    appender: Mutex<RollingFileAppender>,
}

impl WorkerLogger {
    /// Open (creating if needed) the log directory at `root`.
    pub fn new(root: impl Into<PathBuf>, config: LoggerConfig) -> Result<Self, LoggerError> {
        let root = root.into();
        let appender = RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(FILE_PREFIX)
            .filename_suffix(FILE_SUFFIX)
            .build(&root)
            .map_err(|e| LoggerError::Appender(e.to_string()))?;

        Ok(Self {
            root,
            config,
            appender: Mutex::new(appender),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Append a record.
    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<(), LoggerError> {
        let record = LogRecord {
            time: Utc::now(),
            message: message.into(),
            data,
            level,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut appender = self.appender.lock().unwrap_or_else(PoisonError::into_inner);
        appender.write_all(&line)?;
        appender.flush()?;
        Ok(())
    }

    pub fn debug(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.log_or_warn(LogLevel::Debug, message.into(), data);
    }

    pub fn info(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.log_or_warn(LogLevel::Info, message.into(), data);
    }

    pub fn success(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.log_or_warn(LogLevel::Success, message.into(), data);
    }

    pub fn error(&self, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.log_or_warn(LogLevel::Error, message.into(), data);
    }

    fn log_or_warn(&self, level: LogLevel, message: String, data: Option<serde_json::Value>) {
        if let Err(e) = self.log(level, message, data) {
            tracing::warn!(root = %self.root.display(), "Could not write worker log: {}", e);
        }
    }

    fn file_name(day: &str) -> String {
        format!("{FILE_PREFIX}.{day}.{FILE_SUFFIX}")
    }

    /// Read a page of records. `day` defaults to today (UTC); `size == 0`
    /// uses the configured page size.
    pub async fn get(
        &self,
        offset: usize,
        size: usize,
        day: Option<&str>,
    ) -> Result<LogPage, LoggerError> {
        let day = day
            .map(str::to_string)
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string());
        let file_name = Self::file_name(&day);

        let content = match fs::read_to_string(self.root.join(&file_name)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoggerError::FileNotFound(file_name));
            }
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(file = %file_name, "Skipping undecodable log line: {}", e),
            }
        }

        let total = records.len();
        if offset >= total {
            return Err(LoggerError::OutOfRange {
                offset,
                size: total,
            });
        }

        let limit = if size > 0 { size } else { self.config.page_size };
        let end = offset.saturating_add(limit).min(total);
        let logs: Vec<LogRecord> = records.drain(offset..end).collect();

        Ok(LogPage {
            offset,
            limit,
            size: total,
            count: logs.len(),
            logs,
        })
    }

    /// Days with a log file, oldest first.
    pub async fn log_files(&self) -> Result<Vec<String>, LoggerError> {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let prefix = format!("{FILE_PREFIX}.");
        let suffix = format!(".{FILE_SUFFIX}");
        let mut days = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(day) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                days.push(day.to_string());
            }
        }
        days.sort();
        Ok(days)
    }
}

impl std::fmt::Debug for WorkerLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLogger")
            .field("root", &self.root)
            .field("page_size", &self.config.page_size)
            .finish()
    }
}
