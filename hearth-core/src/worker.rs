//! Worker records and the per-worker state machine

use crate::catalog::GameType;
use crate::error::{HearthError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// No process; initial state
    Stopped,
    /// Spawn requested, not yet confirmed
    Starting,
    /// Process alive
    Running,
    /// Termination signalled, waiting for exit
    Stopping,
    /// Spawn failed or the process reported an error
    Error,
    /// Recorded by older catalogs; restartable like `Error`
    Crashed,
}

impl WorkerStatus {
    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Stopped | Error | Crashed, Starting)
                | (Starting, Running | Error | Stopped)
                | (Running, Stopping | Stopped | Error)
                | (Stopping, Stopped | Error)
        )
    }

    /// Whether a process handle may exist in this state
    pub fn is_live(self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Stopping
        )
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Error => "error",
            WorkerStatus::Crashed => "crashed",
        };
        f.write_str(s)
    }
}

/// Deploy-time configuration of a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Game type (key into the launch catalog)
    pub game_type: GameType,
    /// Display name, also passed to the server
    pub name: String,
    /// Absolute install directory
    pub install_path: PathBuf,
    /// Game port
    pub port: u16,
    /// Player cap; defaults per game type
    #[serde(default)]
    pub max_players: Option<u32>,
    /// Server password (may be empty)
    #[serde(default)]
    pub password: String,
    /// World or map name; defaults per game type
    #[serde(default)]
    pub world_name: Option<String>,
}

/// Partial update of a worker's configuration
///
/// `install_path` and `game_type` are fixed at deploy time and cannot be patched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub max_players: Option<u32>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub world_name: Option<String>,
}

/// A managed game server and its last-known runtime status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub game_type: GameType,
    pub name: String,
    pub install_path: PathBuf,
    pub port: u16,
    pub max_players: u32,
    pub password: String,
    pub world_name: String,
    pub status: WorkerStatus,
    /// Set only while a process is live
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub last_started: Option<DateTime<Utc>>,
    /// Best-effort, parsed from output
    #[serde(default)]
    pub current_players: u32,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    /// Build a fresh, stopped worker from a validated config
    pub fn from_config(config: WorkerConfig) -> Self {
        let definition = config.game_type.definition();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            game_type: config.game_type,
            name: config.name,
            install_path: config.install_path,
            port: config.port,
            max_players: config.max_players.unwrap_or(definition.default_max_players),
            password: config.password,
            world_name: config
                .world_name
                .unwrap_or_else(|| definition.default_world.to_string()),
            status: WorkerStatus::Stopped,
            pid: None,
            last_started: None,
            current_players: 0,
            created_at: Utc::now(),
        }
    }

    /// Move to `next`, refusing any edge the state machine does not have
    pub fn transition(&mut self, next: WorkerStatus, operation: &'static str) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HearthError::InvalidState {
                worker_id: self.id.clone(),
                status: self.status,
                operation,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Drop to a quiescent status and clear runtime-only fields
    pub fn settle(&mut self, status: WorkerStatus) {
        self.status = status;
        self.pid = None;
        self.current_players = 0;
    }

    /// Clear every runtime field, as after a restart of the supervising program
    pub fn reset_runtime(&mut self) {
        self.settle(WorkerStatus::Stopped);
        self.last_started = None;
    }

    /// Apply a patch in place
    pub fn apply(&mut self, patch: WorkerPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
        if let Some(port) = patch.port {
            self.port = port;
        }
        if let Some(max_players) = patch.max_players {
            self.max_players = max_players;
        }
        if let Some(password) = patch.password {
            self.password = password;
        }
        if let Some(world_name) = patch.world_name {
            self.world_name = world_name;
        }
    }

    /// Field-level checks shared by deploy and update
    pub fn validate_fields(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(HearthError::validation(&self.id, "name must not be empty"));
        }
        if self.port == 0 {
            return Err(HearthError::validation(&self.id, "port must be non-zero"));
        }
        if self.max_players == 0 {
            return Err(HearthError::validation(
                &self.id,
                "max_players must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::from_config(WorkerConfig {
            game_type: GameType::Valheim,
            name: "Viking Hall".to_string(),
            install_path: PathBuf::from("/srv/valheim"),
            port: 2456,
            max_players: None,
            password: "secret".to_string(),
            world_name: None,
        })
    }

    #[test]
    fn test_defaults_from_catalog() {
        let w = worker();
        assert_eq!(w.status, WorkerStatus::Stopped);
        assert_eq!(w.max_players, 10);
        assert_eq!(w.world_name, "Dedicated");
        assert!(w.pid.is_none());
    }

    #[test]
    fn test_state_machine_edges() {
        use WorkerStatus::*;
        assert!(Stopped.can_transition_to(Starting));
        assert!(Error.can_transition_to(Starting));
        assert!(Crashed.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Error));
        assert!(Stopping.can_transition_to(Stopped));

        // No skipping states
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Stopped.can_transition_to(Stopping));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopping.can_transition_to(Running));
        assert!(!Error.can_transition_to(Running));
    }

    #[test]
    fn test_transition_rejects_illegal_edge() {
        let mut w = worker();
        let err = w.transition(WorkerStatus::Running, "start").unwrap_err();
        assert!(matches!(err, HearthError::InvalidState { .. }));
        assert_eq!(w.status, WorkerStatus::Stopped);

        w.transition(WorkerStatus::Starting, "start").unwrap();
        w.transition(WorkerStatus::Running, "start").unwrap();
        assert_eq!(w.status, WorkerStatus::Running);
    }

    #[test]
    fn test_reset_runtime_clears_fields() {
        let mut w = worker();
        w.status = WorkerStatus::Running;
        w.pid = Some(4242);
        w.current_players = 3;
        w.last_started = Some(Utc::now());

        w.reset_runtime();
        assert_eq!(w.status, WorkerStatus::Stopped);
        assert_eq!(w.pid, None);
        assert_eq!(w.current_players, 0);
        assert_eq!(w.last_started, None);
    }

    #[test]
    fn test_patch_and_validate() {
        let mut w = worker();
        w.apply(WorkerPatch {
            port: Some(2460),
            name: Some("  ".to_string()),
            ..Default::default()
        });
        assert_eq!(w.port, 2460);
        assert!(w.validate_fields().is_err());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&WorkerStatus::Stopping).unwrap();
        assert_eq!(json, "\"stopping\"");
    }
}
