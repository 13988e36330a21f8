//! Launch plan expansion
//!
//! Turns a worker record plus its game's static argument template into the
//! concrete executable and argv used to spawn the server.

use hearth_core::error::{HearthError, Result};
use hearth_core::worker::Worker;
use std::path::PathBuf;

/// Executable, arguments and working directory for one spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl LaunchPlan {
    /// Resolve the executable and expand the argument template.
    ///
    /// Fails with [`HearthError::Spawn`] when no executable exists under the
    /// install path at start time.
    pub fn for_worker(worker: &Worker) -> Result<Self> {
        let definition = worker.game_type.definition();
        let executable = definition
            .resolve_executable(&worker.install_path)
            .ok_or_else(|| HearthError::Spawn {
                worker_id: worker.id.clone(),
                reason: format!(
                    "no {} executable ({}) under {}",
                    definition.display_name,
                    definition.executables.join(", "),
                    worker.install_path.display()
                ),
            })?;

        Ok(Self {
            executable,
            args: expand_args(definition.args, worker),
            working_dir: worker.install_path.clone(),
        })
    }
}

/// Substitute worker fields into the template.
///
/// An argument that expands to nothing is dropped along with the flag
/// right before it, so an empty password omits `-password` entirely.
pub fn expand_args(template: &[&str], worker: &Worker) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(template.len());
    for raw in template {
        let expanded = substitute(raw, worker);
        if expanded.is_empty() {
            if out.last().is_some_and(|prev| prev.starts_with('-')) {
                out.pop();
            }
            continue;
        }
        out.push(expanded);
    }
    out
}

fn substitute(raw: &str, worker: &Worker) -> String {
    if !raw.contains('{') {
        return raw.to_string();
    }
    raw.replace("{name}", &worker.name)
        .replace("{port}", &worker.port.to_string())
        .replace("{password}", &worker.password)
        .replace("{world}", &worker.world_name)
        .replace("{max_players}", &worker.max_players.to_string())
}
