//! Key-value persistence collaborator
//!
//! The registry only needs `get`/`set` over JSON values. [`JsonFileStore`]
//! keeps everything in a single JSON object on disk; [`InMemoryStore`] is for
//! tests and embedders that persist elsewhere.

use crate::error::{HearthError, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};

/// Durable key-value store used to save the worker catalog between runs
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Read `key`, returning `default` when absent
    async fn get(&self, key: &str, default: Value) -> Result<Value>;

    /// Write `key`
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn get(&self, key: &str, default: Value) -> Result<Value> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or(default))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

/// Store backed by one JSON object file
///
/// Writes go to a sibling temp file and are renamed into place so a crash
/// mid-write never leaves a truncated catalog behind.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Open (or lazily create) the store at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Map::new()),
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)? {
                Value::Object(map) => Ok(map),
                _ => Err(HearthError::Storage(format!(
                    "{} does not contain a JSON object",
                    self.path.display()
                ))),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(HearthError::Storage(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn get(&self, key: &str, default: Value) -> Result<Value> {
        let mut all = self.read_all().await?;
        Ok(all.remove(key).unwrap_or(default))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut all = self.read_all().await?;
        all.insert(key.to_string(), value);
        let bytes = serde_json::to_vec_pretty(&Value::Object(all))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HearthError::Storage(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| HearthError::Storage(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            HearthError::Storage(format!(
                "Failed to move {} into place: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
