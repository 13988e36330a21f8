//! # Hearth core
//!
//! Building blocks for supervising long-lived game server processes:
//! - A durable worker registry with per-worker atomic updates
//! - Output capture into bounded ring buffers and daily log files
//! - Config file access confined to each worker's install directory
//! - Point-in-time backups of save data and configs
//! - A broadcast event bus for observers
//!
//! Process spawning, reconciliation and tree termination live in
//! `hearth-supervisor`, which wires these pieces together.

pub mod backup;
pub mod best_effort;
pub mod catalog;
pub mod config;
pub mod error;
pub mod events;
pub mod guard;
pub mod output;
pub mod registry;
pub mod store;
pub mod worker;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backup::{Backup, BackupManager};
    pub use crate::catalog::{GameDefinition, GameType};
    pub use crate::config::HearthConfig;
    pub use crate::error::{HearthError, Result};
    pub use crate::events::{EventBus, WorkerEvent};
    pub use crate::guard::{ConfigFileDescriptor, ConfigFileGuard, ConfigWrite};
    pub use crate::output::{LogEntry, LogFileInfo, LogStream, OutputCapture};
    pub use crate::registry::ProcessRegistry;
    pub use crate::store::{InMemoryStore, JsonFileStore, PersistenceStore};
    pub use crate::worker::{Worker, WorkerConfig, WorkerPatch, WorkerStatus};
}
