//! Supervisor trait

use async_trait::async_trait;
use hearth_core::error::Result;
use hearth_core::worker::{Worker, WorkerStatus};

/// Lifecycle control over game server workers
#[async_trait]
pub trait WorkerSupervisor: Send + Sync {
    /// Spawn the worker's server process
    async fn start(&self, worker_id: &str) -> Result<Worker>;

    /// Terminate the worker's process tree and wait for it to exit
    async fn stop(&self, worker_id: &str) -> Result<Worker>;

    /// Stop then start, as one operation
    async fn restart(&self, worker_id: &str) -> Result<Worker>;

    /// Write one line to the server console
    async fn send_command(&self, worker_id: &str, command: &str) -> Result<()>;

    /// Current status of a worker
    async fn get_status(&self, worker_id: &str) -> Result<WorkerStatus>;

    /// Every known worker
    async fn list_workers(&self) -> Vec<Worker>;
}
