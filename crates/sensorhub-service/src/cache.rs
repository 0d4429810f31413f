//! Response cache for measurement pages.
//!
//! Entries are keyed by request path plus page cursor (see [`page_key`]) and
//! never expire. Callers only store full pages, whose contents can no longer
//! change once written.
//!
//! Two concurrent misses for the same key may both compute and store the
//! entry. The last write wins; both writers produce the same bytes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::{CacheBackend, CacheConfig};

/// A serialized HTTP response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// JSON body.
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Corrupt cache entry {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Key of one page of a paged listing.
pub fn page_key(path: &str, start: u64) -> String {
    format!("{path}[start_{start}]")
}

/// Keyed store of serialized responses.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError>;
    async fn set(&self, key: &str, response: &CachedResponse) -> Result<(), CacheError>;
}

/// Build the cache selected by the configuration.
pub fn from_config(config: &CacheConfig) -> Result<Box<dyn ResponseCache>, CacheError> {
    Ok(match config.backend {
        CacheBackend::File => Box::new(FileCache::new(&config.dir)?),
        CacheBackend::Memory => Box::new(MemoryCache::new()),
    })
}

/// One JSON file per entry, named by the SHA-256 of the key.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    /// Use `dir` for entries, creating it if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::Io {
            path: dir.clone(),
            source: e,
        })?;
        debug!("Response cache at {}", dir.display());
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.dir.join(format!("{}.json", hex::encode(digest)))
    }
}

#[async_trait]
impl ResponseCache for FileCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| CacheError::Decode { path, source: e })
    }

    async fn set(&self, key: &str, response: &CachedResponse) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let bytes = serde_json::to_vec(response).map_err(|e| CacheError::Decode {
            path: path.clone(),
            source: e,
        })?;

        // Readers never see a half-written entry.
        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| CacheError::Io {
                path: tmp.clone(),
                source: e,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CacheError::Io { path, source: e })
    }
}

/// In-process cache, lost on restart.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CachedResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CachedResponse>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, response: &CachedResponse) -> Result<(), CacheError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), response.clone());
        Ok(())
    }
}
