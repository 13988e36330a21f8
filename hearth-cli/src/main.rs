//! Hearth CLI - manage game server workers from the command line

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hearth_core::catalog::GameType;
use hearth_core::config::HearthConfig;
use hearth_core::events::WorkerEvent;
use hearth_core::worker::{WorkerConfig, WorkerPatch};
use hearth_supervisor::{ProcessSupervisor, WorkerSupervisor};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "hearth")]
#[command(about = "Hearth game server supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to hearth.toml plus HEARTH_* variables)
    #[arg(long, global = true, env = "HEARTH_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a new game server
    Deploy {
        /// Game type (valheim, minecraft_bedrock, terraria)
        #[arg(short, long)]
        game: GameType,
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Directory holding the dedicated server install
        #[arg(short, long)]
        install_path: PathBuf,
        #[arg(short, long)]
        port: u16,
        #[arg(long)]
        max_players: Option<u32>,
        #[arg(long, default_value = "")]
        password: String,
        #[arg(long)]
        world: Option<String>,
    },
    /// List all workers
    List,
    /// Show one worker
    Show { id: String },
    /// Change a worker's settings
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        max_players: Option<u32>,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        world: Option<String>,
    },
    /// Stop (if running) and remove a worker
    Delete { id: String },
    /// Start a worker and attach to its console until Ctrl-C or EOF
    Run { id: String },
    /// Log file commands
    Logs {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Config file commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Backup commands
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum LogCommands {
    /// List daily log files on disk
    Files { id: String },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// List the game's config files that exist
    List { id: String },
    /// Print a config file
    Read { id: String, path: String },
    /// Overwrite a config file (content from --content or stdin)
    Write {
        id: String,
        path: String,
        #[arg(long)]
        content: Option<String>,
    },
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Snapshot save data and configs
    Create {
        id: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// List backups, newest first
    List { id: String },
    /// Copy a backup back over the install directory
    Restore { id: String, name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("hearth {}", env!("CARGO_PKG_VERSION"));
        println!("hearth-core {}", hearth_core::VERSION);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => HearthConfig::from_file(path)?,
        None => HearthConfig::load()?,
    };
    let supervisor = ProcessSupervisor::open(config)
        .await
        .context("Failed to open worker catalog")?;

    match cli.command {
        Commands::Version => {}
        Commands::Deploy {
            game,
            name,
            install_path,
            port,
            max_players,
            password,
            world,
        } => {
            let worker = supervisor
                .deploy(WorkerConfig {
                    game_type: game,
                    name,
                    install_path,
                    port,
                    max_players,
                    password,
                    world_name: world,
                })
                .await?;
            print_json(&worker)?;
        }
        Commands::List => print_json(&supervisor.list_workers().await)?,
        Commands::Show { id } => print_json(&supervisor.get_worker(&id).await?)?,
        Commands::Update {
            id,
            name,
            port,
            max_players,
            password,
            world,
        } => {
            let patch = WorkerPatch {
                name,
                port,
                max_players,
                password,
                world_name: world,
            };
            print_json(&supervisor.update_worker(&id, patch).await?)?;
        }
        Commands::Delete { id } => print_json(&supervisor.delete_worker(&id).await?)?,
        Commands::Run { id } => run(&supervisor, &id).await?,
        Commands::Logs {
            command: LogCommands::Files { id },
        } => print_json(&supervisor.list_log_files(&id).await?)?,
        Commands::Config { command } => match command {
            ConfigCommands::List { id } => print_json(&supervisor.list_config_files(&id).await?)?,
            ConfigCommands::Read { id, path } => {
                print!("{}", supervisor.read_config_file(&id, &path).await?);
            }
            ConfigCommands::Write { id, path, content } => {
                let content = match content {
                    Some(content) => content,
                    None => {
                        let mut buf = String::new();
                        tokio::io::stdin()
                            .read_to_string(&mut buf)
                            .await
                            .context("Failed to read content from stdin")?;
                        buf
                    }
                };
                print_json(&supervisor.write_config_file(&id, &path, &content).await?)?;
            }
        },
        Commands::Backup { command } => match command {
            BackupCommands::Create { id, name } => {
                print_json(&supervisor.create_backup(&id, name.as_deref()).await?)?;
            }
            BackupCommands::List { id } => print_json(&supervisor.list_backups(&id).await?)?,
            BackupCommands::Restore { id, name } => {
                print_json(&supervisor.restore_backup(&id, &name).await?)?;
            }
        },
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Start `id`, mirror its log to stdout and forward stdin lines as console commands
async fn run(supervisor: &ProcessSupervisor, id: &str) -> Result<()> {
    let mut events = supervisor.subscribe();
    let worker = supervisor.start(id).await?;
    info!(worker_id = %worker.id, pid = ?worker.pid, "Attached; Ctrl-C or EOF stops the server");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line.context("Failed to read stdin")? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    if let Err(e) = supervisor.send_command(id, &line).await {
                        warn!(error = %e, "Command not sent");
                    }
                }
                None => {
                    info!("Input closed");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(WorkerEvent::Log { worker_id, entry }) if worker_id == id => {
                    println!("{}", entry.to_line());
                }
                Ok(WorkerEvent::Exited { worker_id, .. }) if worker_id == id => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Console output dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    supervisor.shutdown().await;
    print_json(&supervisor.get_worker(id).await?)
}
