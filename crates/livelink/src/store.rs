//! Persistence port for state that must survive restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use crate::error::{LinkError, Result};

/// Key/value store for small JSON documents.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn save(&self, key: &str, value: Value) -> Result<()>;

    /// Load the value stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Value>>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn save(&self, key: &str, value: Value) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON document on disk.
///
/// Every write rewrites the whole document through a temp file and a rename,
/// so a crash never leaves a half-written file behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<BTreeMap<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                LinkError::persistence(format!(
                    "state file {} is corrupt: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, document: &BTreeMap<String, Value>) -> Result<()> {
        let json = serde_json::to_vec_pretty(document)?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                LinkError::persistence(format!("failed to create state directory: {}", e))
            })?;
        }

        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|e| LinkError::persistence(format!("failed to write state file: {}", e)))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| LinkError::persistence(format!("failed to rename state file: {}", e)))?;

        debug!(path = %self.path.display(), keys = document.len(), "State file written");
        Ok(())
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn save(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        document.insert(key.to_string(), value);
        self.write_document(&document).await
    }

    async fn load(&self, key: &str) -> Result<Option<Value>> {
        let mut document = self.read_document().await?;
        Ok(document.remove(key))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        if document.remove(key).is_some() {
            self.write_document(&document).await?;
        }
        Ok(())
    }
}
