//! Worker event bus
//!
//! Observers (monitors, UIs, the CLI's log tail) subscribe to a broadcast
//! channel instead of being called into directly. Publishing never fails:
//! an event with no subscribers is simply dropped.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut rx = bus.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         if let WorkerEvent::StatusChanged { worker_id, to, .. } = event {
//!             println!("{worker_id} is now {to}");
//!         }
//!     }
//! });
//! ```

use crate::output::LogEntry;
use crate::worker::WorkerStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while supervising workers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// A log entry was captured
    Log { worker_id: String, entry: LogEntry },

    /// The worker's status changed
    StatusChanged {
        worker_id: String,
        from: WorkerStatus,
        to: WorkerStatus,
        timestamp: DateTime<Utc>,
    },

    /// Player count parsed from output
    PlayersChanged {
        worker_id: String,
        current: u32,
        max: u32,
    },

    /// The game's ready marker was seen
    Ready { worker_id: String },

    /// The process exited (any cause)
    Exited {
        worker_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl WorkerEvent {
    /// Worker this event concerns
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Log { worker_id, .. }
            | WorkerEvent::StatusChanged { worker_id, .. }
            | WorkerEvent::PlayersChanged { worker_id, .. }
            | WorkerEvent::Ready { worker_id }
            | WorkerEvent::Exited { worker_id, .. } => worker_id,
        }
    }
}

/// Clonable publisher over a broadcast channel
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    /// Create a bus with the given buffer size
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size.max(1));
        Self { sender }
    }

    /// Register a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn publish(&self, event: WorkerEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    /// Publish a status change
    pub fn status_changed(&self, worker_id: &str, from: WorkerStatus, to: WorkerStatus) {
        if from != to {
            self.publish(WorkerEvent::StatusChanged {
                worker_id: worker_id.to_string(),
                from,
                to,
                timestamp: Utc::now(),
            });
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
