//! Hearth Supervisor - process lifecycle for game server workers
//!
//! Spawns each worker's dedicated server binary with piped console streams,
//! feeds its output into [`hearth_core::output::OutputCapture`], scrapes
//! player counts and readiness from that output, and reconciles every process
//! exit back into the registry exactly once.
//!
//! ## Stopping
//!
//! Game launchers often fork, so `stop` signals the whole process tree:
//! SIGTERM first, SIGKILL after `shutdown_timeout`. The worker only becomes
//! `stopped` once the OS reports the root process gone.
//!
//! ```no_run
//! use hearth_core::config::HearthConfig;
//! use hearth_supervisor::{ProcessSupervisor, WorkerSupervisor};
//!
//! # async fn demo() -> hearth_core::error::Result<()> {
//! let supervisor = ProcessSupervisor::open(HearthConfig::load()?).await?;
//! for worker in supervisor.list_workers().await {
//!     println!("{} {}", worker.id, worker.status);
//! }
//! supervisor.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod launch;
mod monitor;
mod process;
mod process_tree;
mod supervisor;
mod telemetry;

pub use launch::{expand_args, LaunchPlan};
pub use monitor::{Monitor, NoopMonitor};
pub use process::ProcessSupervisor;
pub use process_tree::{descendants, signal_tree, SignalReport, TreeSignal};
pub use supervisor::WorkerSupervisor;
pub use telemetry::{LineTelemetry, OutputParser};
