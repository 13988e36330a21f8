//! In-memory worker catalog mirrored to a persistence store
//!
//! Every worker lives behind its own lock, so a read-validate-write on one
//! worker ([`ProcessRegistry::modify`]) is atomic without blocking any other.

use crate::error::{HearthError, Result};
use crate::store::PersistenceStore;
use crate::worker::{Worker, WorkerConfig, WorkerPatch};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Store key for the worker catalog
pub const SERVERS_KEY: &str = "servers";

/// Durable record of every known worker
pub struct ProcessRegistry {
    workers: RwLock<HashMap<String, Arc<Mutex<Worker>>>>,
    store: Arc<dyn PersistenceStore>,
    persist_lock: Mutex<()>,
}

impl ProcessRegistry {
    /// Create an empty registry over `store`
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            store,
            persist_lock: Mutex::new(()),
        }
    }

    /// Create a registry and populate it from `store`.
    ///
    /// Runtime fields are reset on every record: no process handle survives a
    /// restart of the supervising program.
    pub async fn load(store: Arc<dyn PersistenceStore>) -> Result<Self> {
        let registry = Self::new(store);
        let raw = registry.store.get(SERVERS_KEY, Value::Array(Vec::new())).await?;

        let entries = match raw {
            Value::Array(entries) => entries,
            other => {
                return Err(HearthError::Storage(format!(
                    "expected an array under '{}', found {}",
                    SERVERS_KEY, other
                )));
            }
        };

        let mut workers = registry.workers.write().await;
        for entry in entries {
            match serde_json::from_value::<Worker>(entry) {
                Ok(mut worker) => {
                    worker.reset_runtime();
                    workers.insert(worker.id.clone(), Arc::new(Mutex::new(worker)));
                }
                Err(e) => warn!(error = %e, "Skipping unreadable worker record"),
            }
        }
        info!("Loaded {} workers", workers.len());
        drop(workers);

        Ok(registry)
    }

    /// Validate a deploy config and register a new stopped worker
    pub async fn create(&self, config: WorkerConfig) -> Result<Worker> {
        validate_deploy(&config)?;

        let worker = Worker::from_config(config);
        worker.validate_fields()?;

        self.workers
            .write()
            .await
            .insert(worker.id.clone(), Arc::new(Mutex::new(worker.clone())));
        self.persist().await?;

        info!(worker_id = %worker.id, game = %worker.game_type, "Worker deployed");
        Ok(worker)
    }

    /// Snapshot of one worker
    pub async fn get(&self, id: &str) -> Result<Worker> {
        let slot = self.slot(id).await?;
        let worker = slot.lock().await;
        Ok(worker.clone())
    }

    /// Whether `id` is registered
    pub async fn contains(&self, id: &str) -> bool {
        self.workers.read().await.contains_key(id)
    }

    /// Snapshot of every worker, oldest first
    pub async fn list(&self) -> Vec<Worker> {
        let slots: Vec<_> = self.workers.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(slot.lock().await.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Apply a config patch
    pub async fn update(&self, id: &str, patch: WorkerPatch) -> Result<Worker> {
        let updated = self
            .modify_inner(id, |worker| {
                worker.apply(patch);
                worker.validate_fields()?;
                Ok(worker.clone())
            })
            .await?;
        self.persist().await?;
        debug!(worker_id = %id, "Worker updated");
        Ok(updated)
    }

    /// Remove a worker; refused while it has a live process
    pub async fn delete(&self, id: &str) -> Result<Worker> {
        let removed = {
            let mut workers = self.workers.write().await;
            let slot = workers.get(id).cloned().ok_or_else(|| HearthError::not_found(id))?;
            let worker = slot.lock().await;
            if worker.status.is_live() {
                return Err(HearthError::InvalidState {
                    worker_id: id.to_string(),
                    status: worker.status,
                    operation: "delete",
                });
            }
            let snapshot = worker.clone();
            drop(worker);
            workers.remove(id);
            snapshot
        };
        self.persist().await?;
        info!(worker_id = %id, "Worker deleted");
        Ok(removed)
    }

    /// Atomically read, validate and write one worker.
    ///
    /// `f` runs on a copy under the worker's lock; the copy is committed only
    /// if `f` returns `Ok`. Persistence afterwards is best-effort.
    pub async fn modify<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Worker) -> Result<T>,
    {
        let out = self.modify_inner(id, f).await?;
        crate::best_effort::soft(id, "persist worker catalog", self.persist().await);
        Ok(out)
    }

    async fn modify_inner<T, F>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Worker) -> Result<T>,
    {
        let slot = self.slot(id).await?;
        let mut worker = slot.lock().await;
        let mut draft = worker.clone();
        let out = f(&mut draft)?;
        *worker = draft;
        Ok(out)
    }

    async fn slot(&self, id: &str) -> Result<Arc<Mutex<Worker>>> {
        self.workers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| HearthError::not_found(id))
    }

    /// Write the full catalog to the store
    pub async fn persist(&self) -> Result<()> {
        // Snapshot under the lock so the last write always carries the newest state.
        let _guard = self.persist_lock.lock().await;
        let workers = self.list().await;
        self.store
            .set(SERVERS_KEY, serde_json::to_value(&workers)?)
            .await
    }
}

fn validate_deploy(config: &WorkerConfig) -> Result<()> {
    let subject = if config.name.trim().is_empty() {
        "new worker".to_string()
    } else {
        config.name.clone()
    };

    if config.install_path.as_os_str().is_empty() {
        return Err(HearthError::validation(subject, "install_path is required"));
    }
    if !config.install_path.is_absolute() {
        return Err(HearthError::validation(
            subject,
            format!("install_path must be absolute: {}", config.install_path.display()),
        ));
    }
    if !config.install_path.is_dir() {
        return Err(HearthError::validation(
            subject,
            format!("install_path is not a directory: {}", config.install_path.display()),
        ));
    }

    let definition = config.game_type.definition();
    if definition.resolve_executable(&config.install_path).is_none() {
        return Err(HearthError::validation(
            subject,
            format!(
                "no {} executable ({}) under {}",
                definition.display_name,
                definition.executables.join(", "),
                config.install_path.display()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::GameType;
    use crate::store::InMemoryStore;
    use crate::worker::WorkerStatus;
    use tempfile::TempDir;

    fn install_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("valheim_server.x86_64"), b"#!/bin/sh\n").unwrap();
        dir
    }

    fn config(dir: &TempDir) -> WorkerConfig {
        WorkerConfig {
            game_type: GameType::Valheim,
            name: "Viking Hall".to_string(),
            install_path: dir.path().to_path_buf(),
            port: 2456,
            max_players: None,
            password: String::new(),
            world_name: None,
        }
    }

    #[tokio::test]
    async fn test_create_rejects_missing_install_path() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let dir = install_dir();
        let mut cfg = config(&dir);
        cfg.install_path = Default::default();

        let err = registry.create(cfg).await.unwrap_err();
        assert!(matches!(err, HearthError::Validation { .. }));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_missing_executable() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let dir = TempDir::new().unwrap();

        let err = registry.create(config(&dir)).await.unwrap_err();
        assert!(matches!(err, HearthError::Validation { .. }));
        assert!(err.to_string().contains("valheim_server"));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_get_update_delete() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let dir = install_dir();

        let worker = registry.create(config(&dir)).await.unwrap();
        assert_eq!(worker.status, WorkerStatus::Stopped);
        assert_eq!(registry.get(&worker.id).await.unwrap(), worker);

        let updated = registry
            .update(
                &worker.id,
                WorkerPatch {
                    port: Some(2470),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.port, 2470);

        let bad = registry
            .update(
                &worker.id,
                WorkerPatch {
                    port: Some(0),
                    ..Default::default()
                },
            )
            .await;
        assert!(bad.is_err());
        assert_eq!(registry.get(&worker.id).await.unwrap().port, 2470);

        registry.delete(&worker.id).await.unwrap();
        assert!(matches!(
            registry.get(&worker.id).await,
            Err(HearthError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_while_running() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let dir = install_dir();
        let worker = registry.create(config(&dir)).await.unwrap();

        registry
            .modify(&worker.id, |w| {
                w.transition(WorkerStatus::Starting, "start")?;
                w.transition(WorkerStatus::Running, "start")
            })
            .await
            .unwrap();

        let err = registry.delete(&worker.id).await.unwrap_err();
        assert!(matches!(err, HearthError::InvalidState { .. }));
        assert!(registry.contains(&worker.id).await);
    }

    #[tokio::test]
    async fn test_modify_failure_leaves_record_untouched() {
        let registry = ProcessRegistry::new(Arc::new(InMemoryStore::new()));
        let dir = install_dir();
        let worker = registry.create(config(&dir)).await.unwrap();

        let result = registry
            .modify(&worker.id, |w| {
                w.current_players = 7;
                w.transition(WorkerStatus::Stopping, "stop")
            })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.get(&worker.id).await.unwrap().current_players, 0);
    }

    #[tokio::test]
    async fn test_load_resets_runtime_fields() {
        let store: Arc<dyn PersistenceStore> = Arc::new(InMemoryStore::new());
        let dir = install_dir();

        let registry = ProcessRegistry::new(store.clone());
        let worker = registry.create(config(&dir)).await.unwrap();
        registry
            .modify(&worker.id, |w| {
                w.transition(WorkerStatus::Starting, "start")?;
                w.transition(WorkerStatus::Running, "start")?;
                w.pid = Some(999);
                w.current_players = 4;
                w.last_started = Some(chrono::Utc::now());
                Ok(())
            })
            .await
            .unwrap();

        let reloaded = ProcessRegistry::load(store).await.unwrap();
        let w = reloaded.get(&worker.id).await.unwrap();
        assert_eq!(w.status, WorkerStatus::Stopped);
        assert_eq!(w.pid, None);
        assert_eq!(w.current_players, 0);
        assert_eq!(w.last_started, None);
        assert_eq!(w.port, 2456);
    }
}
