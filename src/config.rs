//! Configuration for the campus-chat command-line front end.
//!
//! Values are resolved in order: CLI flags, then environment variables, then
//! `{data_dir}/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

pub const ENV_HOME: &str = "CAMPUS_CHAT_HOME";
pub const ENV_USER: &str = "CAMPUS_CHAT_USER";
pub const ENV_NAME: &str = "CAMPUS_CHAT_NAME";

const DEFAULT_DIR_NAME: &str = ".campus-chat";

/// Conversation sync engine for the campus marketplace chat.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug)]
#[command(name = "campus-chat", version, about)]
pub struct Cli {
    /// Data directory for the database and media [env: CAMPUS_CHAT_HOME] [default: ~/.campus-chat]
    #[arg(long, short = 'd', global = true)]
    pub data_dir: Option<PathBuf>,

    /// User id to act as [env: CAMPUS_CHAT_USER]
    #[arg(long, short = 'u', global = true)]
    pub user: Option<String>,

    /// Display name attached to sent messages [env: CAMPUS_CHAT_NAME]
    #[arg(long, short = 'n', global = true)]
    pub name: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Find or create the direct conversation with another user
    Start {
        other: String,
        #[arg(long, default_value = "")]
        title: String,
    },
    /// Create a broadcast conversation
    Broadcast {
        title: String,
        #[arg(required = true)]
        participants: Vec<String>,
    },
    /// List conversations, most recent first
    List {
        #[arg(long, short = 'f', default_value = "")]
        filter: String,
    },
    /// Open a conversation, mark it read and print its timeline
    Show { conversation_id: String },
    /// Send a message with an optional attachment
    Send {
        conversation_id: String,
        #[arg(default_value = "")]
        body: String,
        #[arg(long, conflicts_with = "file")]
        image: Option<PathBuf>,
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Toggle the block on a direct conversation
    Block { conversation_id: String },
    /// Delete a direct conversation
    Delete { conversation_id: String },
    /// Mark yourself online
    Online,
    /// Mark yourself offline
    Offline,
    /// Fold legacy inline messages into the message store
    ImportLegacy,
    /// Append a message to a conversation's legacy inline array
    SeedLegacy {
        conversation_id: String,
        body: String,
        /// Store the entry without an id, as the oldest clients did
        #[arg(long)]
        without_id: bool,
    },
}

/// Top-level configuration stored in `{data_dir}/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// User id to act as when none is given on the command line.
    #[serde(default)]
    pub default_user: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(String),
    MissingUser,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "io error: {e}"),
            ConfigError::Toml(e) => write!(f, "config error: {e}"),
            ConfigError::MissingUser => write!(
                f,
                "no user configured: pass --user, set {ENV_USER}, or set default_user in config.toml"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join("config.toml")
}

/// Load the top-level config, returning defaults if it doesn't exist.
pub fn load_config(data_dir: &Path) -> Result<AppConfig, ConfigError> {
    let path = config_path(data_dir);
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let contents = fs::read_to_string(&path)?;
    toml::from_str(&contents).map_err(|e| ConfigError::Toml(e.to_string()))
}

pub fn save_config(data_dir: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    fs::create_dir_all(data_dir)?;
    let contents =
        toml::to_string_pretty(config).map_err(|e| ConfigError::Toml(e.to_string()))?;
    fs::write(config_path(data_dir), contents)?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub user_id: String,
    pub display_name: String,
    /// True when the user came from `config.toml` rather than a flag or env.
    pub user_from_file: bool,
}

impl Config {
    pub fn from_cli_and_env(cli: &Cli) -> Result<Self, ConfigError> {
        Self::resolve(cli, |key| std::env::var(key).ok())
    }

    /// Resolve with an explicit environment lookup.
    pub fn resolve(cli: &Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let data_dir = cli
            .data_dir
            .clone()
            .or_else(|| env(ENV_HOME).map(PathBuf::from))
            .unwrap_or_else(|| {
                env("HOME")
                    .map(|h| PathBuf::from(h).join(DEFAULT_DIR_NAME))
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DIR_NAME))
            });

        let file = load_config(&data_dir)?;

        let explicit_user = cli
            .user
            .clone()
            .or_else(|| env(ENV_USER))
            .filter(|u| !u.trim().is_empty());
        let user_from_file = explicit_user.is_none();
        let user_id = explicit_user
            .or(file.default_user)
            .filter(|u| !u.trim().is_empty())
            .ok_or(ConfigError::MissingUser)?;

        let display_name = cli
            .name
            .clone()
            .or_else(|| env(ENV_NAME))
            .or(file.display_name)
            .unwrap_or_else(|| user_id.clone());

        Ok(Self {
            data_dir,
            user_id,
            display_name,
            user_from_file,
        })
    }

    pub fn db_path(&self) -> PathBuf {
        crate::storage::db_path(&self.data_dir)
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    /// Record the resolved user as the default when `config.toml` has none.
    pub fn remember_user(&self) -> Result<bool, ConfigError> {
        let mut file = load_config(&self.data_dir)?;
        if file.default_user.is_some() {
            return Ok(false);
        }
        file.default_user = Some(self.user_id.clone());
        if file.display_name.is_none() && self.display_name != self.user_id {
            file.display_name = Some(self.display_name.clone());
        }
        save_config(&self.data_dir, &file)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn cli(args: &[&str]) -> Cli {
        let mut full = vec!["campus-chat"];
        full.extend_from_slice(args);
        Cli::parse_from(full)
    }

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_cli_beats_env() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let config = Config::resolve(
            &cli(&["--data-dir", dir, "--user", "alice", "list"]),
            env_of(&[(ENV_USER, "bob"), (ENV_NAME, "Bobby")]),
        )
        .unwrap();
        assert_eq!(config.user_id, "alice");
        assert_eq!(config.display_name, "Bobby");
        assert!(!config.user_from_file);
        assert_eq!(config.db_path(), tmp.path().join("campus-chat.db"));
    }

    #[test]
    fn test_env_home_and_default_dir() {
        let config = Config::resolve(
            &cli(&["online"]),
            env_of(&[(ENV_HOME, "/srv/chat"), (ENV_USER, "carol")]),
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/chat"));
        assert_eq!(config.media_dir(), PathBuf::from("/srv/chat/media"));

        let config =
            Config::resolve(&cli(&["online"]), env_of(&[("HOME", "/home/dan"), (ENV_USER, "dan")]))
                .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/dan/.campus-chat"));
        assert_eq!(config.display_name, "dan");
    }

    #[test]
    fn test_config_file_supplies_default_user() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let err = Config::resolve(&cli(&["--data-dir", dir, "list"]), env_of(&[]));
        assert!(matches!(err, Err(ConfigError::MissingUser)));

        let first = Config::resolve(
            &cli(&["--data-dir", dir, "--user", "erin", "--name", "Erin", "list"]),
            env_of(&[]),
        )
        .unwrap();
        assert!(first.remember_user().unwrap());
        assert!(!first.remember_user().unwrap());

        let second = Config::resolve(&cli(&["--data-dir", dir, "list"]), env_of(&[])).unwrap();
        assert_eq!(second.user_id, "erin");
        assert_eq!(second.display_name, "Erin");
        assert!(second.user_from_file);
    }

    #[test]
    fn test_send_arguments() {
        let parsed = cli(&["send", "c1", "is it still available?", "--image", "/tmp/a.png"]);
        assert_eq!(
            parsed.command,
            Command::Send {
                conversation_id: "c1".to_string(),
                body: "is it still available?".to_string(),
                image: Some(PathBuf::from("/tmp/a.png")),
                file: None,
            }
        );
    }
}
