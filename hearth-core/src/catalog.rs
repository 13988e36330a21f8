//! Static per-game launch catalog
//!
//! Each [`GameType`] maps to a [`GameDefinition`] describing how to find and
//! launch the dedicated server binary, which files are user-editable, what to
//! back up, and which output lines carry telemetry.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Supported game server kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameType {
    Valheim,
    MinecraftBedrock,
    Terraria,
}

impl GameType {
    /// All known game types
    pub const ALL: [GameType; 3] = [
        GameType::Valheim,
        GameType::MinecraftBedrock,
        GameType::Terraria,
    ];

    /// Catalog entry for this game type
    pub fn definition(self) -> &'static GameDefinition {
        match self {
            GameType::Valheim => &VALHEIM,
            GameType::MinecraftBedrock => &MINECRAFT_BEDROCK,
            GameType::Terraria => &TERRARIA,
        }
    }

    /// Stable key, matching the serialized form
    pub fn key(self) -> &'static str {
        match self {
            GameType::Valheim => "valheim",
            GameType::MinecraftBedrock => "minecraft_bedrock",
            GameType::Terraria => "terraria",
        }
    }
}

impl std::fmt::Display for GameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

impl std::str::FromStr for GameType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GameType::ALL
            .into_iter()
            .find(|g| g.key().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown game type: {s}"))
    }
}

/// A config file a game exposes for editing
#[derive(Debug, Clone, Copy)]
pub struct ConfigFileSpec {
    pub name: &'static str,
    pub relative_path: &'static str,
    pub editable: bool,
}

/// Launch template and file layout for one game
#[derive(Debug)]
pub struct GameDefinition {
    pub display_name: &'static str,
    /// Candidate executables relative to the install path; first existing wins
    pub executables: &'static [&'static str],
    /// Argument template with `{name}`, `{port}`, `{password}`, `{world}`, `{max_players}`
    pub args: &'static [&'static str],
    pub default_max_players: u32,
    pub default_world: &'static str,
    pub config_files: &'static [ConfigFileSpec],
    /// Files and directories copied by a backup
    pub backup_items: &'static [&'static str],
    /// Substring signalling the server accepts connections
    pub ready_marker: &'static str,
    /// Regexes with a `current` group and optional `max` group
    pub player_patterns: &'static [&'static str],
}

impl GameDefinition {
    /// Resolve the launch executable under `install_path`
    pub fn resolve_executable(&self, install_path: &Path) -> Option<PathBuf> {
        self.executables
            .iter()
            .map(|exe| install_path.join(exe))
            .find(|path| path.is_file())
    }
}

static VALHEIM: GameDefinition = GameDefinition {
    display_name: "Valheim",
    executables: &["valheim_server.x86_64", "valheim_server.exe"],
    args: &[
        "-nographics",
        "-batchmode",
        "-name",
        "{name}",
        "-port",
        "{port}",
        "-world",
        "{world}",
        "-password",
        "{password}",
        "-savedir",
        "saves",
        "-public",
        "1",
    ],
    default_max_players: 10,
    default_world: "Dedicated",
    config_files: &[
        ConfigFileSpec {
            name: "Admin list",
            relative_path: "saves/adminlist.txt",
            editable: true,
        },
        ConfigFileSpec {
            name: "Ban list",
            relative_path: "saves/bannedlist.txt",
            editable: true,
        },
        ConfigFileSpec {
            name: "Permitted list",
            relative_path: "saves/permittedlist.txt",
            editable: true,
        },
        ConfigFileSpec {
            name: "Start script",
            relative_path: "start_server.sh",
            editable: false,
        },
    ],
    backup_items: &[
        "worlds",
        "saves/worlds_local",
        "saves/adminlist.txt",
        "saves/bannedlist.txt",
        "saves/permittedlist.txt",
    ],
    ready_marker: "Game server connected",
    player_patterns: &[
        r"(?i)players:\s*(?P<current>\d+)\s*/\s*(?P<max>\d+)",
        r"Connections\s+(?P<current>\d+)",
    ],
};

static MINECRAFT_BEDROCK: GameDefinition = GameDefinition {
    display_name: "Minecraft Bedrock",
    executables: &["bedrock_server", "bedrock_server.exe"],
    args: &[],
    default_max_players: 10,
    default_world: "Bedrock level",
    config_files: &[
        ConfigFileSpec {
            name: "Server properties",
            relative_path: "server.properties",
            editable: true,
        },
        ConfigFileSpec {
            name: "Allow list",
            relative_path: "allowlist.json",
            editable: true,
        },
        ConfigFileSpec {
            name: "Permissions",
            relative_path: "permissions.json",
            editable: true,
        },
    ],
    backup_items: &[
        "worlds",
        "server.properties",
        "allowlist.json",
        "permissions.json",
    ],
    ready_marker: "Server started.",
    player_patterns: &[
        r"There are (?P<current>\d+)/(?P<max>\d+) players online",
        r"(?i)players:\s*(?P<current>\d+)\s*/\s*(?P<max>\d+)",
    ],
};

static TERRARIA: GameDefinition = GameDefinition {
    display_name: "Terraria",
    executables: &["TerrariaServer.bin.x86_64", "TerrariaServer.exe"],
    args: &[
        "-port",
        "{port}",
        "-players",
        "{max_players}",
        "-world",
        "worlds/{world}.wld",
        "-password",
        "{password}",
        "-autocreate",
        "2",
    ],
    default_max_players: 8,
    default_world: "world",
    config_files: &[
        ConfigFileSpec {
            name: "Server config",
            relative_path: "serverconfig.txt",
            editable: true,
        },
        ConfigFileSpec {
            name: "Ban list",
            relative_path: "banlist.txt",
            editable: true,
        },
    ],
    backup_items: &["worlds", "serverconfig.txt", "banlist.txt"],
    ready_marker: "Server started",
    player_patterns: &[
        r"(?i)players:\s*(?P<current>\d+)\s*/\s*(?P<max>\d+)",
        r"(?P<current>\d+) players? connected",
    ],
};
