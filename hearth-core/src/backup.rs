//! Point-in-time backups of a worker's important files
//!
//! Layout: `<install_path>/<backups dir>/<name>/` holds a copy of every
//! catalog backup item that existed at the time, plus a `backup.json`
//! metadata sidecar. Individual item failures are logged and skipped.

use crate::best_effort;
use crate::config::BackupConfig;
use crate::error::{HearthError, Result};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Metadata sidecar file name inside each backup directory
pub const METADATA_FILE: &str = "backup.json";

/// A completed backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    pub name: String,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    /// Relative paths copied into the backup
    pub item_paths: Vec<String>,
    pub size_bytes: u64,
}

/// Creates, lists and restores backups
#[derive(Debug, Clone, Default)]
pub struct BackupManager {
    config: BackupConfig,
}

impl BackupManager {
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// Directory holding all backups of a worker
    pub fn backups_dir(&self, worker: &Worker) -> PathBuf {
        worker.install_path.join(&self.config.directory)
    }

    /// Copy the game's backup items into a new named backup
    pub async fn create_backup(&self, worker: &Worker, name: Option<&str>) -> Result<Backup> {
        let name = match name {
            Some(name) => validate_name(worker, name)?.to_string(),
            None => format!("backup-{}", Utc::now().format("%Y%m%d-%H%M%S")),
        };
        let target = self.backups_dir(worker).join(&name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Err(HearthError::validation(
                &worker.id,
                format!("backup '{name}' already exists"),
            ));
        }
        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| HearthError::io(&worker.id, format!("create {}", target.display()), e))?;

        let mut item_paths = Vec::new();
        let mut size_bytes = 0;
        for item in worker.game_type.definition().backup_items {
            let source = worker.install_path.join(item);
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                debug!(worker_id = %worker.id, item = %item, "Backup item not present, skipping");
                continue;
            }
            let copied = best_effort::soft(
                &worker.id,
                "copy backup item",
                copy_blocking(source, target.join(item)).await,
            );
            if let Some(bytes) = copied {
                item_paths.push((*item).to_string());
                size_bytes += bytes;
            }
        }

        let backup = Backup {
            name,
            worker_id: worker.id.clone(),
            created_at: Utc::now(),
            item_paths,
            size_bytes,
        };

        let metadata = serde_json::to_vec_pretty(&backup)?;
        best_effort::soft_async(
            &worker.id,
            "write backup metadata",
            tokio::fs::write(target.join(METADATA_FILE), metadata),
        )
        .await;

        info!(
            worker_id = %worker.id,
            backup = %backup.name,
            items = backup.item_paths.len(),
            size_bytes = backup.size_bytes,
            "Backup created"
        );
        Ok(backup)
    }

    /// Every backup of a worker, newest first
    pub async fn list_backups(&self, worker: &Worker) -> Result<Vec<Backup>> {
        let dir = self.backups_dir(worker);
        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HearthError::io(&worker.id, "list backups", e)),
        };

        let mut backups = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| HearthError::io(&worker.id, "list backups", e))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            backups.push(self.describe(worker, &entry.path()).await);
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.name.cmp(&a.name)));
        Ok(backups)
    }

    /// Copy a backup's items back over the install directory
    pub async fn restore_backup(&self, worker: &Worker, name: &str) -> Result<Vec<String>> {
        let name = validate_name(worker, name)?;
        let source_dir = self.backups_dir(worker).join(name);
        if !tokio::fs::metadata(&source_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(HearthError::validation(
                &worker.id,
                format!("no backup named '{name}'"),
            ));
        }

        let backup = self.describe(worker, &source_dir).await;
        let mut restored = Vec::new();
        for item in &backup.item_paths {
            if !is_plain_relative(item) {
                best_effort::soft::<(), _>(
                    &worker.id,
                    "restore backup item",
                    Err(format!("refusing item path {item:?}")),
                );
                continue;
            }
            let source = source_dir.join(item);
            let target = worker.install_path.join(item);
            let result = async {
                remove_existing(&target).await?;
                copy_blocking(source, target).await
            }
            .await;
            if best_effort::soft(&worker.id, "restore backup item", result).is_some() {
                restored.push(item.clone());
            }
        }

        info!(worker_id = %worker.id, backup = %name, items = restored.len(), "Backup restored");
        Ok(restored)
    }

    /// Read the sidecar, or reconstruct what we can from the filesystem
    async fn describe(&self, worker: &Worker, dir: &Path) -> Backup {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if let Ok(bytes) = tokio::fs::read(dir.join(METADATA_FILE)).await {
            match serde_json::from_slice::<Backup>(&bytes) {
                Ok(mut backup) => {
                    backup.name = name;
                    return backup;
                }
                Err(e) => debug!(worker_id = %worker.id, backup = %name, error = %e, "Unreadable backup metadata"),
            }
        }

        let created_at = tokio::fs::metadata(dir)
            .await
            .ok()
            .and_then(|m| m.created().or_else(|_| m.modified()).ok())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        let dir_owned = dir.to_path_buf();
        let (item_paths, size_bytes) = tokio::task::spawn_blocking(move || scan_backup_dir(&dir_owned))
            .await
            .unwrap_or_default();

        Backup {
            name,
            worker_id: worker.id.clone(),
            created_at,
            item_paths,
            size_bytes,
        }
    }
}

fn validate_name<'a>(worker: &Worker, name: &'a str) -> Result<&'a str> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || trimmed.contains(['/', '\\'])
        || trimmed.contains('\0')
    {
        return Err(HearthError::validation(
            &worker.id,
            format!("invalid backup name {name:?}"),
        ));
    }
    Ok(trimmed)
}

fn is_plain_relative(item: &str) -> bool {
    let path = Path::new(item);
    !item.is_empty()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

async fn remove_existing(path: &Path) -> std::io::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

async fn copy_blocking(source: PathBuf, target: PathBuf) -> std::io::Result<u64> {
    tokio::task::spawn_blocking(move || copy_recursive(&source, &target))
        .await
        .map_err(std::io::Error::other)?
}

/// Copy a file or directory tree; symlinks are not followed
fn copy_recursive(source: &Path, target: &Path) -> std::io::Result<u64> {
    let meta = std::fs::symlink_metadata(source)?;
    if meta.file_type().is_symlink() {
        return Ok(0);
    }
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if meta.is_dir() {
        std::fs::create_dir_all(target)?;
        let mut total = 0;
        for entry in std::fs::read_dir(source)? {
            let entry = entry?;
            total += copy_recursive(&entry.path(), &target.join(entry.file_name()))?;
        }
        Ok(total)
    } else {
        std::fs::copy(source, target)
    }
}

fn scan_backup_dir(dir: &Path) -> (Vec<String>, u64) {
    fn size_of(path: &Path) -> u64 {
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => std::fs::read_dir(path)
                .map(|rd| rd.filter_map(|e| e.ok()).map(|e| size_of(&e.path())).sum())
                .unwrap_or(0),
            Ok(meta) if meta.is_file() => meta.len(),
            _ => 0,
        }
    }

    let mut items = Vec::new();
    let mut total = 0;
    if let Ok(rd) = std::fs::read_dir(dir) {
        for entry in rd.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == METADATA_FILE {
                continue;
            }
            total += size_of(&entry.path());
            items.push(name);
        }
    }
    items.sort();
    (items, total)
}
