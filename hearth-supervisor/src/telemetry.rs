//! Best-effort telemetry scraped from server output
//!
//! Lines are matched against the catalog's player-count patterns and ready
//! marker. Nothing here can fail a worker: unparsable lines are ignored.

use hearth_core::catalog::GameType;
use hearth_core::events::{EventBus, WorkerEvent};
use hearth_core::output::LogEntry;
use hearth_core::registry::ProcessRegistry;
use hearth_core::worker::WorkerStatus;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static PATTERNS: Lazy<HashMap<GameType, Vec<Regex>>> = Lazy::new(|| {
    GameType::ALL
        .into_iter()
        .map(|game| {
            let compiled = game
                .definition()
                .player_patterns
                .iter()
                .filter_map(|pattern| match Regex::new(pattern) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!(game = %game, pattern, error = %e, "Skipping invalid player pattern");
                        None
                    }
                })
                .collect();
            (game, compiled)
        })
        .collect()
});

/// What one output line told us
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LineTelemetry {
    /// Current player count, if the line carried one
    pub current_players: Option<u32>,
    /// Player cap, if the line carried one
    pub max_players: Option<u32>,
    /// Line contained the ready marker
    pub ready: bool,
}

impl LineTelemetry {
    pub fn is_empty(&self) -> bool {
        self.current_players.is_none() && !self.ready
    }
}

/// Per-game line parser
#[derive(Debug, Clone, Copy)]
pub struct OutputParser {
    game_type: GameType,
}

impl OutputParser {
    pub fn new(game_type: GameType) -> Self {
        Self { game_type }
    }

    pub fn parse(&self, line: &str) -> LineTelemetry {
        let definition = self.game_type.definition();
        let mut out = LineTelemetry {
            ready: !definition.ready_marker.is_empty() && line.contains(definition.ready_marker),
            ..Default::default()
        };

        let patterns = PATTERNS.get(&self.game_type).map(Vec::as_slice).unwrap_or(&[]);
        for re in patterns {
            let Some(caps) = re.captures(line) else {
                continue;
            };
            let Some(current) = caps.name("current").and_then(|m| m.as_str().parse().ok()) else {
                continue;
            };
            out.current_players = Some(current);
            out.max_players = caps
                .name("max")
                .and_then(|m| m.as_str().parse().ok())
                .filter(|max: &u32| *max > 0);
            break;
        }
        out
    }
}

/// Consume captured entries and fold their telemetry into the registry.
///
/// Ends when the capture channel closes, which happens once both output
/// streams of the process reach EOF.
pub fn spawn_telemetry(
    worker_id: String,
    game_type: GameType,
    registry: Arc<ProcessRegistry>,
    events: EventBus,
    mut entries: mpsc::UnboundedReceiver<LogEntry>,
) -> JoinHandle<()> {
    let parser = OutputParser::new(game_type);
    tokio::spawn(async move {
        while let Some(entry) = entries.recv().await {
            let telemetry = parser.parse(&entry.message);
            if telemetry.is_empty() {
                continue;
            }
            apply(&worker_id, &registry, &events, telemetry).await;
        }
        debug!(worker_id = %worker_id, "Telemetry parser finished");
    })
}

async fn apply(worker_id: &str, registry: &ProcessRegistry, events: &EventBus, telemetry: LineTelemetry) {
    if let Some(current) = telemetry.current_players {
        let changed = registry
            .modify(worker_id, |worker| {
                // Late lines from a process that has already been reconciled are stale.
                if !worker.status.is_live() {
                    return Ok(None);
                }
                let max = telemetry.max_players.unwrap_or(worker.max_players);
                if worker.current_players == current && worker.max_players == max {
                    return Ok(None);
                }
                worker.current_players = current;
                worker.max_players = max;
                Ok(Some(max))
            })
            .await;
        if let Ok(Some(max)) = changed {
            events.publish(WorkerEvent::PlayersChanged {
                worker_id: worker_id.to_string(),
                current,
                max,
            });
        }
    }

    if telemetry.ready {
        events.publish(WorkerEvent::Ready {
            worker_id: worker_id.to_string(),
        });
        let confirmed = registry
            .modify(worker_id, |worker| {
                if worker.status != WorkerStatus::Starting {
                    return Ok(false);
                }
                worker.transition(WorkerStatus::Running, "confirm ready")?;
                Ok(true)
            })
            .await;
        if let Ok(true) = confirmed {
            events.status_changed(worker_id, WorkerStatus::Starting, WorkerStatus::Running);
        }
    }
}
