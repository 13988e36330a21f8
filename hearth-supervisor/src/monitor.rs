//! Monitor collaborator interface

use async_trait::async_trait;
use hearth_core::error::Result;
use hearth_core::worker::Worker;

/// Notified when a worker process starts and when it goes away, so it can
/// poll live metrics for the process in between.
///
/// Failures are logged by the supervisor and never change worker state.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// A process was spawned for `worker_id`
    async fn start_monitoring(&self, worker_id: &str, pid: u32, worker: &Worker) -> Result<()>;

    /// The worker's process exited or errored
    async fn stop_monitoring(&self, worker_id: &str) -> Result<()>;
}

/// Monitor that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitor;

#[async_trait]
impl Monitor for NoopMonitor {
    async fn start_monitoring(&self, _worker_id: &str, _pid: u32, _worker: &Worker) -> Result<()> {
        Ok(())
    }

    async fn stop_monitoring(&self, _worker_id: &str) -> Result<()> {
        Ok(())
    }
}
