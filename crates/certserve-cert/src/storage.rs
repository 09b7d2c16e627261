//! Key material storage
//!
//! A small key-value cache used by the ACME issuer to persist account
//! credentials and issued certificates across restarts. A miss is reported as
//! [`StorageError::NotFound`], which issuers treat as "issue fresh material".

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Key material storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Cache entry not found: {0}")]
    NotFound(String),

    #[error("Cache value for {0} is not valid UTF-8")]
    NonUtf8Value(String),

    #[error("Cache file is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    StorageError(String),
}

/// Cache collaborator for certificate issuers
#[async_trait]
pub trait CertCache: Send + Sync {
    /// Fetch a value, failing with [`StorageError::NotFound`] when absent
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store a value, replacing any previous one
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Remove a value; removing an absent key is not an error
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Cache backed by a single JSON file holding a flat string → string object
///
/// Every operation loads the whole file, applies one change and writes the
/// whole file back. Operations are serialized across every instance opened
/// on the same path in this process; separate processes sharing the file are
/// not coordinated.
pub struct JsonFileCache {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

/// One lock per cache file, shared by all instances in the process
fn path_lock(path: &Path) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();

    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match LOCKS.get_or_init(Default::default).lock() {
        Ok(mut locks) => locks.entry(key).or_default().clone(),
        Err(_) => Arc::new(Mutex::new(())),
    }
}

impl JsonFileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            lock: path_lock(&path),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, String>) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(entries)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        // Write next to the target and rename so readers never see a partial file
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;

        Ok(())
    }
}

#[async_trait]
impl CertCache for JsonFileCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let _guard = self.lock.lock().await;
        trace!("Cache get {} from {:?}", key, self.path);

        let entries = self.load().await?;
        entries
            .get(key)
            .map(|value| value.as_bytes().to_vec())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let value = std::str::from_utf8(data)
            .map_err(|_| StorageError::NonUtf8Value(key.to_string()))?
            .to_string();

        let _guard = self.lock.lock().await;
        debug!("Cache put {} into {:?}", key, self.path);

        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value);
        self.save(&entries).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock.lock().await;

        let mut entries = self.load().await?;
        if entries.remove(key).is_none() {
            return Ok(());
        }

        debug!("Cache delete {} from {:?}", key, self.path);
        self.save(&entries).await
    }
}

/// In-memory cache, for tests and for running without persistence
pub struct MemoryCache {
    entries: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get number of stored entries
    pub fn count(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CertCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|_| StorageError::StorageError("cache lock poisoned".to_string()))?;
        entries
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::StorageError("cache lock poisoned".to_string()))?;
        entries.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::StorageError("cache lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}
