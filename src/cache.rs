//! File-backed cache rooted at a per-worker directory.
//!
//! Entry names may contain `/` to address subdirectories. The file extension
//! comes from the entry name when it has one, otherwise from the cache's
//! configured extension.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tokio::task::JoinHandle;

use crate::error::CacheError;

/// Default entry extension.
const DEFAULT_EXTENSION: &str = "txt";

#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
    extension: String,
    file_prefix: Option<String>,
}

impl Cache {
    /// Create a cache rooted at `root`. Nothing is created on disk until the
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            file_prefix: None,
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn with_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.file_prefix = Some(prefix.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an entry name to `(directory, file)`. Names that would leave
    /// the cache root are rejected.
    pub fn path(&self, name: &str, timestamp: bool) -> Result<(PathBuf, PathBuf), CacheError> {
        validate_name(name)?;
        let mut parts: Vec<&str> = name.split('/').filter(|p| !p.is_empty()).collect();
        let file_name = parts.pop().unwrap_or_default();

        let mut dir = self.root.clone();
        for part in parts {
            dir.push(part);
        }

        let (stem, extension) = match Path::new(file_name).extension().and_then(|e| e.to_str()) {
            Some(ext) => (&file_name[..file_name.len() - ext.len() - 1], ext),
            None => (file_name, self.extension.as_str()),
        };

        let prefix = self
            .file_prefix
            .as_ref()
            .map(|p| format!("{p}-"))
            .unwrap_or_default();
        let stamp = if timestamp {
            format!("-{}", Utc::now().timestamp_millis())
        } else {
            String::new()
        };

        let file = dir.join(format!("{prefix}{stem}{stamp}.{extension}"));
        Ok((dir, file))
    }

    /// Write an entry, creating parent directories. Returns the file written.
    pub async fn write(
        &self,
        name: &str,
        data: &[u8],
        timestamp: bool,
    ) -> Result<PathBuf, CacheError> {
        let (dir, file) = self.path(name, timestamp)?;
        fs::create_dir_all(&dir).await?;
        fs::write(&file, data).await?;
        tracing::debug!(path = %file.display(), bytes = data.len(), "Cache entry written");
        Ok(file)
    }

    /// Fire-and-forget `write`; failures are logged.
    pub fn write_async(&self, name: &str, data: Vec<u8>, timestamp: bool) -> JoinHandle<()> {
        let cache = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = cache.write(&name, &data, timestamp).await {
                tracing::error!(entry = %name, "Could not write cache file: {}", e);
            }
        })
    }

    pub async fn get(&self, name: &str) -> Result<Vec<u8>, CacheError> {
        let (_, file) = self.path(name, false)?;
        fs::read(&file).await.map_err(|e| not_found_or(e, name))
    }

    pub async fn remove(&self, name: &str) -> Result<(), CacheError> {
        let (_, file) = self.path(name, false)?;
        fs::remove_file(&file).await.map_err(|e| not_found_or(e, name))
    }

    /// Remove root-level entries with the cache extension. Returns the number
    /// of entries removed.
    pub async fn clear(&self) -> Result<usize, CacheError> {
        let mut read_dir = match fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.extension.as_str()) {
                continue;
            }
            if entry.file_type().await?.is_dir() {
                fs::remove_dir_all(&path).await?;
            } else {
                fs::remove_file(&path).await?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

/// Check that an entry name stays below the cache root: `/`-separated plain
/// components with a non-empty final part.
pub fn validate_name(name: &str) -> Result<(), CacheError> {
    let parts: Vec<&str> = name.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty()
        || parts
            .iter()
            .any(|p| *p == "." || *p == ".." || p.contains('\\') || p.contains(':'))
    {
        return Err(CacheError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn not_found_or(e: std::io::Error, name: &str) -> CacheError {
    if e.kind() == std::io::ErrorKind::NotFound {
        CacheError::NotFound(name.to_string())
    } else {
        CacheError::Io(e)
    }
}
