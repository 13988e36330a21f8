//! Process-based supervisor implementation
//!
//! One OS process per running worker. Commands against the same worker ID are
//! serialized through a per-ID operation lock; different workers never wait on
//! each other. Each spawned child is owned by a waiter task, which is the only
//! place a process exit is reconciled into the registry.

use crate::launch::LaunchPlan;
use crate::monitor::{Monitor, NoopMonitor};
use crate::process_tree::{self, TreeSignal};
use crate::supervisor::WorkerSupervisor;
use crate::telemetry;
use async_trait::async_trait;
use chrono::Utc;
use hearth_core::backup::{Backup, BackupManager};
use hearth_core::best_effort;
use hearth_core::config::{HearthConfig, SupervisorConfig};
use hearth_core::error::{HearthError, Result};
use hearth_core::events::{EventBus, WorkerEvent};
use hearth_core::guard::{ConfigFileDescriptor, ConfigFileGuard, ConfigWrite};
use hearth_core::output::{LogEntry, LogFileInfo, LogStream, OutputCapture};
use hearth_core::registry::ProcessRegistry;
use hearth_core::store::{JsonFileStore, PersistenceStore};
use hearth_core::worker::{Worker, WorkerConfig, WorkerPatch, WorkerStatus};
use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long the exit waiter lets output readers drain before the exit entry.
/// Orphaned grandchildren can hold the pipes open indefinitely.
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);

/// A live process owned by the supervisor
struct RuntimeHandle {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    exited: watch::Receiver<bool>,
}

struct Inner {
    config: SupervisorConfig,
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    output: OutputCapture,
    guard: ConfigFileGuard,
    backups: BackupManager,
    monitor: Arc<dyn Monitor>,
    handles: Mutex<HashMap<String, Arc<RuntimeHandle>>>,
    op_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Supervisor for game server worker processes
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// Create a supervisor over an already loaded registry
    pub fn new(config: HearthConfig, registry: ProcessRegistry, monitor: Arc<dyn Monitor>) -> Self {
        let events = EventBus::new(config.events.buffer_size);
        Self {
            inner: Arc::new(Inner {
                config: config.supervisor,
                registry: Arc::new(registry),
                output: OutputCapture::new(config.logs, events.clone()),
                events,
                guard: ConfigFileGuard::new(),
                backups: BackupManager::new(config.backups),
                monitor,
                handles: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Open the JSON catalog at `config.storage.path` and build a supervisor with no monitor
    pub async fn open(config: HearthConfig) -> Result<Self> {
        Self::open_with_monitor(config, Arc::new(NoopMonitor)).await
    }

    /// Open the JSON catalog at `config.storage.path` and build a supervisor
    pub async fn open_with_monitor(config: HearthConfig, monitor: Arc<dyn Monitor>) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn PersistenceStore> = Arc::new(JsonFileStore::new(config.storage.path.clone()));
        let registry = ProcessRegistry::load(store).await?;
        info!(path = %config.storage.path.display(), "Supervisor ready");
        Ok(Self::new(config, registry, monitor))
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Validate and register a new stopped worker. Nothing is started.
    pub async fn deploy(&self, config: WorkerConfig) -> Result<Worker> {
        let worker = self.inner.registry.create(config).await?;
        info!(worker_id = %worker.id, game = %worker.game_type, "Worker deployed");
        Ok(worker)
    }

    /// Change configuration fields; a running process picks them up on next start
    pub async fn update_worker(&self, worker_id: &str, patch: WorkerPatch) -> Result<Worker> {
        let _op = self.inner.lock_worker(worker_id).await;
        self.inner.registry.update(worker_id, patch).await
    }

    /// Stop the worker if it is running, then forget it
    pub async fn delete_worker(&self, worker_id: &str) -> Result<Worker> {
        let _op = self.inner.lock_worker(worker_id).await;
        if self.inner.handle(worker_id).await.is_some() {
            self.inner.stop_locked(worker_id).await?;
        }
        let removed = self.inner.registry.delete(worker_id).await?;
        self.inner.output.forget(worker_id).await;
        self.inner.op_locks.lock().await.remove(worker_id);
        Ok(removed)
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Worker> {
        self.inner.registry.get(worker_id).await
    }

    /// The most recent `limit` in-memory log entries, oldest first
    pub async fn get_logs(&self, worker_id: &str, limit: usize) -> Result<Vec<LogEntry>> {
        self.inner.registry.get(worker_id).await?;
        Ok(self.inner.output.recent(worker_id, limit).await)
    }

    /// Empty the in-memory log buffer
    pub async fn clear_logs(&self, worker_id: &str) -> Result<()> {
        self.inner.registry.get(worker_id).await?;
        self.inner.output.clear(worker_id).await;
        Ok(())
    }

    pub async fn list_log_files(&self, worker_id: &str) -> Result<Vec<LogFileInfo>> {
        let worker = self.inner.registry.get(worker_id).await?;
        self.inner.output.list_log_files(&worker).await
    }

    pub async fn list_config_files(&self, worker_id: &str) -> Result<Vec<ConfigFileDescriptor>> {
        let worker = self.inner.registry.get(worker_id).await?;
        Ok(self.inner.guard.list_config_files(&worker).await)
    }

    pub async fn read_config_file(&self, worker_id: &str, path: &str) -> Result<String> {
        let worker = self.inner.registry.get(worker_id).await?;
        self.inner.guard.read(&worker, path).await
    }

    pub async fn write_config_file(&self, worker_id: &str, path: &str, content: &str) -> Result<ConfigWrite> {
        let worker = self.inner.registry.get(worker_id).await?;
        self.inner.guard.write(&worker, path, content).await
    }

    pub async fn create_backup(&self, worker_id: &str, name: Option<&str>) -> Result<Backup> {
        let _op = self.inner.lock_worker(worker_id).await;
        let worker = self.inner.registry.get(worker_id).await?;
        self.inner.backups.create_backup(&worker, name).await
    }

    pub async fn list_backups(&self, worker_id: &str) -> Result<Vec<Backup>> {
        let worker = self.inner.registry.get(worker_id).await?;
        self.inner.backups.list_backups(&worker).await
    }

    /// Copy a backup's items back over the install directory.
    ///
    /// Refused while the worker has a live process.
    pub async fn restore_backup(&self, worker_id: &str, name: &str) -> Result<Vec<String>> {
        let _op = self.inner.lock_worker(worker_id).await;
        let worker = self.inner.registry.get(worker_id).await?;
        if self.inner.handle(worker_id).await.is_some() || worker.status.is_live() {
            return Err(HearthError::InvalidState {
                worker_id: worker_id.to_string(),
                status: worker.status,
                operation: "restore a backup",
            });
        }
        let restored = self.inner.backups.restore_backup(&worker, name).await?;
        self.inner
            .output
            .record(&worker, LogStream::System, format!("Restored backup '{name}'"))
            .await;
        Ok(restored)
    }

    /// Stop every worker that still has a live process
    pub async fn shutdown(&self) {
        let live: Vec<String> = self.inner.handles.lock().await.keys().cloned().collect();
        info!("Shutting down {} running workers", live.len());
        for worker_id in live {
            best_effort::soft(&worker_id, "stop during shutdown", self.stop(&worker_id).await);
        }
    }
}

#[async_trait]
impl WorkerSupervisor for ProcessSupervisor {
    async fn start(&self, worker_id: &str) -> Result<Worker> {
        let _op = self.inner.lock_worker(worker_id).await;
        self.inner.start_locked(worker_id).await
    }

    async fn stop(&self, worker_id: &str) -> Result<Worker> {
        let _op = self.inner.lock_worker(worker_id).await;
        self.inner.stop_locked(worker_id).await
    }

    async fn restart(&self, worker_id: &str) -> Result<Worker> {
        let _op = self.inner.lock_worker(worker_id).await;
        let stopped = self.inner.stop_locked(worker_id).await?;
        if stopped.status.is_live() {
            return Err(HearthError::InvalidState {
                worker_id: worker_id.to_string(),
                status: stopped.status,
                operation: "restart",
            });
        }
        self.inner.start_locked(worker_id).await
    }

    async fn send_command(&self, worker_id: &str, command: &str) -> Result<()> {
        let _op = self.inner.lock_worker(worker_id).await;
        let worker = self.inner.registry.get(worker_id).await?;
        let handle = match self.inner.handle(worker_id).await {
            Some(handle) if worker.status == WorkerStatus::Running => handle,
            _ => {
                return Err(HearthError::InvalidState {
                    worker_id: worker_id.to_string(),
                    status: worker.status,
                    operation: "send a command",
                });
            }
        };

        let line = command.trim_end_matches(['\r', '\n']);
        {
            let mut stdin = handle.stdin.lock().await;
            let pipe = stdin.as_mut().ok_or_else(|| {
                HearthError::io(
                    worker_id,
                    "send command",
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "console input is closed"),
                )
            })?;
            pipe.write_all(format!("{line}\n").as_bytes())
                .await
                .map_err(|e| HearthError::io(worker_id, "send command", e))?;
            pipe.flush()
                .await
                .map_err(|e| HearthError::io(worker_id, "send command", e))?;
        }

        self.inner
            .output
            .record(&worker, LogStream::System, format!("> {line}"))
            .await;
        debug!(worker_id = %worker_id, pid = handle.pid, "Console command sent");
        Ok(())
    }

    async fn get_status(&self, worker_id: &str) -> Result<WorkerStatus> {
        Ok(self.inner.registry.get(worker_id).await?.status)
    }

    async fn list_workers(&self) -> Vec<Worker> {
        self.inner.registry.list().await
    }
}

impl Inner {
    /// Serialize operations on one worker ID
    async fn lock_worker(&self, worker_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .op_locks
            .lock()
            .await
            .entry(worker_id.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    async fn handle(&self, worker_id: &str) -> Option<Arc<RuntimeHandle>> {
        self.handles.lock().await.get(worker_id).cloned()
    }

    async fn start_locked(self: &Arc<Self>, worker_id: &str) -> Result<Worker> {
        if self.handle(worker_id).await.is_some() {
            let status = self.registry.get(worker_id).await?.status;
            return Err(HearthError::InvalidState {
                worker_id: worker_id.to_string(),
                status,
                operation: "start",
            });
        }

        let (from, worker) = self
            .registry
            .modify(worker_id, |w| {
                let from = w.status;
                w.transition(WorkerStatus::Starting, "start")?;
                Ok((from, w.clone()))
            })
            .await?;
        self.events.status_changed(worker_id, from, WorkerStatus::Starting);

        let plan = match LaunchPlan::for_worker(&worker) {
            Ok(plan) => plan,
            Err(e) => {
                self.fail_start(&worker, &e).await;
                return Err(e);
            }
        };

        info!(
            worker_id = %worker_id,
            executable = %plan.executable.display(),
            args = ?plan.args,
            "Starting worker"
        );

        let mut command = Command::new(&plan.executable);
        command
            .args(&plan.args)
            .current_dir(&plan.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = HearthError::Spawn {
                    worker_id: worker_id.to_string(),
                    reason: format!("{}: {e}", plan.executable.display()),
                };
                self.fail_start(&worker, &err).await;
                return Err(err);
            }
        };

        let Some(pid) = child.id() else {
            // Already reaped; there is no process to supervise.
            let status = child.wait().await.ok();
            let err = HearthError::Spawn {
                worker_id: worker_id.to_string(),
                reason: format!("process exited before it could be tracked ({status:?})"),
            };
            self.fail_start(&worker, &err).await;
            return Err(err);
        };

        let stdin = child.stdin.take();
        let (entries, readers) = self
            .output
            .attach(&worker, child.stdout.take(), child.stderr.take())
            .await;
        telemetry::spawn_telemetry(
            worker_id.to_string(),
            worker.game_type,
            self.registry.clone(),
            self.events.clone(),
            entries,
        );

        let (exit_tx, exit_rx) = watch::channel(false);
        self.handles.lock().await.insert(
            worker_id.to_string(),
            Arc::new(RuntimeHandle {
                pid,
                stdin: Mutex::new(stdin),
                exited: exit_rx,
            }),
        );

        let running = self
            .registry
            .modify(worker_id, |w| {
                // The ready marker may already have confirmed the process.
                let confirmed = w.status == WorkerStatus::Starting;
                if confirmed {
                    w.transition(WorkerStatus::Running, "start")?;
                }
                w.pid = Some(pid);
                w.last_started = Some(Utc::now());
                Ok((confirmed, w.clone()))
            })
            .await;

        if let Ok((confirmed, snapshot)) = &running {
            if *confirmed {
                self.events
                    .status_changed(worker_id, WorkerStatus::Starting, WorkerStatus::Running);
            }
            self.output
                .record(&worker, LogStream::System, format!("Server started (pid {pid})"))
                .await;
            best_effort::soft(
                worker_id,
                "start monitoring",
                self.monitor.start_monitoring(worker_id, pid, snapshot).await,
            );
            info!(worker_id = %worker_id, pid, "Worker running");
        }

        // Spawned last so exit reconciliation never races the running transition.
        tokio::spawn(self.clone().watch_exit(worker.clone(), pid, child, exit_tx, readers));

        running.map(|(_, worker)| worker)
    }

    /// Reconcile a start that never produced a process
    async fn fail_start(&self, worker: &Worker, err: &HearthError) {
        warn!(worker_id = %worker.id, error = %err, "Worker failed to start");
        let settled = self
            .registry
            .modify(&worker.id, |w| {
                let from = w.status;
                w.settle(WorkerStatus::Error);
                Ok(from)
            })
            .await;
        if let Some(from) = best_effort::soft(&worker.id, "record start failure", settled) {
            self.events.status_changed(&worker.id, from, WorkerStatus::Error);
        }
        self.output
            .record(worker, LogStream::System, format!("Failed to start: {err}"))
            .await;
        best_effort::soft(
            &worker.id,
            "stop monitoring",
            self.monitor.stop_monitoring(&worker.id).await,
        );
    }

    /// Own the child until it exits, then reconcile exactly once
    async fn watch_exit(
        self: Arc<Self>,
        worker: Worker,
        pid: u32,
        mut child: Child,
        exit_tx: watch::Sender<bool>,
        readers: Vec<JoinHandle<()>>,
    ) {
        let outcome = child.wait().await;

        let (status, code, signal, message) = match &outcome {
            Ok(exit) => (
                WorkerStatus::Stopped,
                exit.code(),
                exit_signal(exit),
                describe_exit(exit),
            ),
            Err(e) => (
                WorkerStatus::Error,
                None,
                None,
                format!("Lost track of server process: {e}"),
            ),
        };

        // The pid is reaped from here on. Drop the handle and settle the record
        // under the handles lock so a new start sees both or neither.
        let settled = {
            let mut handles = self.handles.lock().await;
            if handles.get(&worker.id).is_some_and(|h| h.pid == pid) {
                handles.remove(&worker.id);
            }
            self.registry
                .modify(&worker.id, |w| Ok(reconcile_exit(w, pid, status)))
                .await
        };
        let settled = best_effort::soft(&worker.id, "reconcile exit", settled);
        if let Some(None) = settled {
            debug!(worker_id = %worker.id, pid, "Record already belongs to a newer process");
        } else {
            best_effort::soft(
                &worker.id,
                "stop monitoring",
                self.monitor.stop_monitoring(&worker.id).await,
            );
        }
        exit_tx.send_replace(true);

        // Let trailing output land in the buffer before the exit entry.
        let drained = tokio::time::timeout(OUTPUT_DRAIN, async {
            for reader in readers {
                let _ = reader.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!(worker_id = %worker.id, "Output still open after exit; a descendant may hold the pipes");
        }

        self.output.record(&worker, LogStream::System, message).await;

        if let Some(Some(from)) = settled {
            self.events.status_changed(&worker.id, from, status);
        }
        self.events.publish(WorkerEvent::Exited {
            worker_id: worker.id.clone(),
            code,
            signal,
        });
        info!(worker_id = %worker.id, pid, ?code, ?signal, %status, "Worker process exited");
    }

    async fn stop_locked(&self, worker_id: &str) -> Result<Worker> {
        let Some(handle) = self.handle(worker_id).await else {
            let (from, worker) = self
                .registry
                .modify(worker_id, |w| {
                    let from = w.status;
                    w.settle(WorkerStatus::Stopped);
                    Ok((from, w.clone()))
                })
                .await?;
            self.events.status_changed(worker_id, from, WorkerStatus::Stopped);
            return Ok(worker);
        };

        let stopping = self
            .registry
            .modify(worker_id, |w| {
                if w.status != WorkerStatus::Running {
                    return Ok(None);
                }
                w.transition(WorkerStatus::Stopping, "stop")?;
                Ok(Some(w.clone()))
            })
            .await?;
        if let Some(worker) = &stopping {
            self.events
                .status_changed(worker_id, WorkerStatus::Running, WorkerStatus::Stopping);
            self.output
                .record(worker, LogStream::System, "Stopping server")
                .await;
        }

        let mut exited = handle.exited.clone();
        info!(worker_id = %worker_id, pid = handle.pid, "Stopping worker");

        if !terminate(worker_id, handle.pid, TreeSignal::Terminate, self.config.shutdown_timeout, &mut exited).await {
            warn!(
                worker_id = %worker_id,
                pid = handle.pid,
                timeout = ?self.config.shutdown_timeout,
                "Worker ignored SIGTERM, killing process tree"
            );
            if !terminate(worker_id, handle.pid, TreeSignal::Kill, self.config.kill_timeout, &mut exited).await {
                warn!(
                    worker_id = %worker_id,
                    pid = handle.pid,
                    "Worker survived SIGKILL; leaving it in stopping"
                );
            }
        }

        self.registry.get(worker_id).await
    }
}

/// Signal the tree and wait up to `grace` for the waiter to report the exit
async fn terminate(
    worker_id: &str,
    pid: u32,
    signal: TreeSignal,
    grace: Duration,
    exited: &mut watch::Receiver<bool>,
) -> bool {
    if *exited.borrow() {
        return true;
    }
    let id = worker_id.to_string();
    best_effort::soft(
        worker_id,
        "signal process tree",
        tokio::task::spawn_blocking(move || process_tree::signal_tree(&id, pid, signal)).await,
    );
    match tokio::time::timeout(grace, exited.wait_for(|done| *done)).await {
        Ok(_) => true,
        Err(_) => false,
    }
}

/// Settle `worker` after process `pid` exited, unless the record has moved on
/// to another process. Returns the status it settled from.
fn reconcile_exit(worker: &mut Worker, pid: u32, status: WorkerStatus) -> Option<WorkerStatus> {
    let owns = match worker.pid {
        Some(current) => current == pid,
        None => worker.status.is_live(),
    };
    if !owns {
        return None;
    }
    let from = worker.status;
    worker.settle(status);
    Some(from)
}

fn describe_exit(exit: &ExitStatus) -> String {
    match (exit.code(), exit_signal(exit)) {
        (Some(code), _) => format!("Server exited with code {code}"),
        (None, Some(signal)) => format!("Server terminated by signal {signal}"),
        (None, None) => "Server exited".to_string(),
    }
}

#[cfg(unix)]
fn exit_signal(exit: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    exit.signal()
}

#[cfg(not(unix))]
fn exit_signal(_exit: &ExitStatus) -> Option<i32> {
    None
}
