//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Parse a raw env value, naming the variable on failure.
fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

/// Accepts `1/true/yes/on` and `0/false/no/off`, case-insensitively.
fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?} is not a boolean"),
        }),
    }
}

/// Unset variables yield `None`; set but unparsable ones are errors.
fn env_value<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .map(|raw| parse_value(key, &raw))
        .transpose()
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    std::env::var(key)
        .ok()
        .map(|raw| parse_bool(key, &raw))
        .transpose()
}

/// Worker registry configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root directory; worker configs and cache output live below it.
    pub root_path: PathBuf,
    /// Directory (relative to `root_path`) holding worker config files.
    pub workers_dir: String,
    /// Worker config file extension, without the leading dot.
    pub extension: String,
    /// Debug mode flag, surfaced to workers through `WorkerManager::is_debug`.
    pub debug: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("."),
            workers_dir: "workers".to_string(),
            extension: "json".to_string(),
            debug: false,
        }
    }
}

impl ManagerConfig {
    /// Build from `WORKER_HUB_*` environment variables, falling back to
    /// defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let root_path = std::env::var("WORKER_HUB_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.root_path);

        let workers_dir =
            std::env::var("WORKER_HUB_WORKERS_DIR").unwrap_or(defaults.workers_dir);

        let extension = std::env::var("WORKER_HUB_EXTENSION")
            .map(|ext| normalize_extension(&ext))
            .unwrap_or(defaults.extension);
        if extension.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "WORKER_HUB_EXTENSION".into(),
                message: "extension is empty".into(),
            });
        }

        let debug = env_bool("WORKER_HUB_DEBUG")?.unwrap_or(defaults.debug);

        Ok(Self {
            root_path,
            workers_dir,
            extension,
            debug,
        })
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_path = root.into();
        self
    }

    pub fn with_workers_dir(mut self, dir: impl Into<String>) -> Self {
        self.workers_dir = dir.into();
        self
    }

    pub fn with_extension(mut self, ext: &str) -> Self {
        self.extension = normalize_extension(ext);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Strip whitespace and leading dots: `" .json"` → `"json"`.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_string()
}

/// Per-worker log configuration.
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// Records returned by `WorkerLogger::get` when no size is requested.
    pub page_size: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self { page_size: 20 }
    }
}

impl LoggerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let page_size = match env_value::<usize>("WORKER_HUB_LOG_PAGE_SIZE")? {
            Some(0) => {
                return Err(ConfigError::InvalidValue {
                    key: "WORKER_HUB_LOG_PAGE_SIZE".into(),
                    message: "page size must be positive".into(),
                });
            }
            Some(size) => size,
            None => Self::default().page_size,
        };

        Ok(Self { page_size })
    }
}

/// Per-worker HTTP client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fixed user agent. A random desktop agent is picked when unset.
    pub user_agent: Option<String>,
    /// Request timeout.
    pub timeout: Duration,
    /// Accept invalid TLS certificates.
    pub accept_invalid_certs: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout: Duration::from_secs(30),
            accept_invalid_certs: true,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let timeout = env_value::<u64>("WORKER_HUB_HTTP_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        let user_agent = std::env::var("WORKER_HUB_USER_AGENT")
            .ok()
            .filter(|ua| !ua.trim().is_empty());

        let accept_invalid_certs =
            env_bool("WORKER_HUB_INSECURE")?.unwrap_or(defaults.accept_invalid_certs);

        Ok(Self {
            user_agent,
            timeout,
            accept_invalid_certs,
        })
    }
}
