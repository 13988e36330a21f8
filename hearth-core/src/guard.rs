//! Config file access confined to a worker's install directory
//!
//! [`ConfigFileGuard::resolve`] is the only security boundary in the
//! subsystem. Every read and write goes through it; a path whose canonical
//! form is not strictly below the canonical install path is rejected with
//! [`HearthError::AccessDenied`] before any file is opened.

use crate::best_effort;
use crate::error::{HearthError, Result};
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

/// A catalog config file that currently exists on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigFileDescriptor {
    pub name: String,
    pub relative_path: String,
    pub absolute_path: PathBuf,
    pub editable: bool,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Result of a successful config write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigWrite {
    pub path: PathBuf,
    /// Copy of the previous content, if there was any and the copy succeeded
    pub backup: Option<PathBuf>,
    pub bytes_written: usize,
}

/// Resolves and guards config file paths
#[derive(Debug, Clone, Default)]
pub struct ConfigFileGuard;

impl ConfigFileGuard {
    pub fn new() -> Self {
        Self
    }

    /// Catalog config files for the worker's game that exist right now
    pub async fn list_config_files(&self, worker: &Worker) -> Vec<ConfigFileDescriptor> {
        let mut out = Vec::new();
        for spec in worker.game_type.definition().config_files {
            let absolute_path = worker.install_path.join(spec.relative_path);
            let Ok(meta) = tokio::fs::metadata(&absolute_path).await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            out.push(ConfigFileDescriptor {
                name: spec.name.to_string(),
                relative_path: spec.relative_path.to_string(),
                absolute_path,
                editable: spec.editable,
                size: meta.len(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        out
    }

    /// Canonicalize `requested` and require it to live below the install path.
    ///
    /// Relative paths are taken from the install path. The file itself need
    /// not exist: the deepest existing ancestor is canonicalized and the rest
    /// re-appended, and that rest may only contain plain names.
    pub async fn resolve(&self, worker: &Worker, requested: impl AsRef<Path>) -> Result<PathBuf> {
        let requested = requested.as_ref();
        let root = tokio::fs::canonicalize(&worker.install_path)
            .await
            .map_err(|e| HearthError::io(&worker.id, "resolve install path", e))?;

        let candidate = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            root.join(requested)
        };

        let resolved = canonicalize_partial(&candidate).await;
        match resolved {
            Some(path) if path != root && path.starts_with(&root) => Ok(path),
            _ => {
                warn!(
                    target: "hearth::security",
                    worker_id = %worker.id,
                    requested = %requested.display(),
                    "Rejected config path outside install directory"
                );
                Err(HearthError::AccessDenied {
                    worker_id: worker.id.clone(),
                    path: requested.to_path_buf(),
                })
            }
        }
    }

    /// Read a config file as text
    pub async fn read(&self, worker: &Worker, requested: impl AsRef<Path>) -> Result<String> {
        let path = self.resolve(worker, requested).await?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| HearthError::io(&worker.id, format!("read {}", path.display()), e))
    }

    /// Overwrite a config file, keeping a timestamped copy of the old content
    pub async fn write(
        &self,
        worker: &Worker,
        requested: impl AsRef<Path>,
        content: &str,
    ) -> Result<ConfigWrite> {
        let path = self.resolve(worker, requested).await?;
        self.ensure_editable(worker, &path).await?;

        let existed = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        let backup = if existed {
            best_effort::soft_async(&worker.id, "back up config before write", backup_sibling(&path)).await
        } else {
            None
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HearthError::io(&worker.id, format!("create {}", parent.display()), e))?;
        }
        tokio::fs::write(&path, content.as_bytes())
            .await
            .map_err(|e| HearthError::io(&worker.id, format!("write {}", path.display()), e))?;

        info!(worker_id = %worker.id, path = %path.display(), "Config file written");
        Ok(ConfigWrite {
            path,
            backup,
            bytes_written: content.len(),
        })
    }

    /// Catalog files flagged read-only refuse writes
    async fn ensure_editable(&self, worker: &Worker, path: &Path) -> Result<()> {
        let Ok(root) = tokio::fs::canonicalize(&worker.install_path).await else {
            return Ok(());
        };
        let Ok(relative) = path.strip_prefix(&root) else {
            return Ok(());
        };
        let locked = worker
            .game_type
            .definition()
            .config_files
            .iter()
            .any(|spec| !spec.editable && Path::new(spec.relative_path) == relative);
        if locked {
            return Err(HearthError::validation(
                &worker.id,
                format!("{} is read-only", relative.display()),
            ));
        }
        Ok(())
    }
}

/// Canonicalize a path whose tail may not exist yet.
///
/// Returns `None` when nothing along the path exists or the missing tail
/// contains anything other than plain names. A tail entry that exists on
/// disk without canonicalizing is a dangling symlink (or a loop), and a write
/// through it would land wherever it points, so that is `None` too.
async fn canonicalize_partial(candidate: &Path) -> Option<PathBuf> {
    for ancestor in candidate.ancestors() {
        let Ok(base) = tokio::fs::canonicalize(ancestor).await else {
            continue;
        };
        let rest = candidate.strip_prefix(ancestor).ok()?;
        let mut resolved = base;
        for component in rest.components() {
            match component {
                Component::Normal(name) => {
                    resolved.push(name);
                    if tokio::fs::symlink_metadata(&resolved).await.is_ok() {
                        return None;
                    }
                }
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        return Some(resolved);
    }
    None
}

/// Copy `path` to `<file>.backup.<unix-millis>` next to it
async fn backup_sibling(path: &Path) -> std::io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut stamp = Utc::now().timestamp_millis();
    let mut target = path.with_file_name(format!("{file_name}.backup.{stamp}"));
    while tokio::fs::try_exists(&target).await? {
        stamp += 1;
        target = path.with_file_name(format!("{file_name}.backup.{stamp}"));
    }

    tokio::fs::copy(path, &target).await?;
    Ok(target)
}
