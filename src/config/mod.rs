use crate::{directive::parse_duration, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;


/// Daemon configuration
///
/// Loaded from `perch.toml` in the data directory, overridden by `PERCH_*`
/// environment variables (`PERCH_DEFAULT_AGENT`, `PERCH_MACHINE_ID`, ...).
/// A `.env` file is honored before either source is read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory: store database, memory documents, skills, socket.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Agent used for tasks that do not name one.
    #[serde(default = "default_agent")]
    pub default_agent: String,

    /// Installation-unique origin tag stamped on thread entries.
    #[serde(default = "default_machine_id")]
    pub machine_id: String,

    /// Poll interval as duration text, e.g. "1s", "2m".
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Retry ceiling applied to submitted tasks that do not set one.
    #[serde(default)]
    pub default_max_retries: u32,

    /// Substitution variables for `$NAME` markers in skill mount specs.
    #[serde(default)]
    pub vars: HashMap<String, String>,

    /// Agents upserted into the store at startup.
    #[serde(default)]
    pub agents: Vec<AgentDecl>,
}

/// One `[[agents]]` table from the configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDecl {
    pub name: String,
    pub adapter: String,
    pub command: String,
    #[serde(default = "default_context_window")]
    pub context_window: i64,
    #[serde(default)]
    pub default_isolation: Option<String>,
}

fn default_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => Path::new(&home).join(".perch"),
        Err(_) => PathBuf::from(".perch"),
    }
}

fn default_agent() -> String {
    "default".to_string()
}

fn default_machine_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string())
}

fn default_poll_interval() -> String {
    format!("{}s", crate::constants::DEFAULT_POLL_INTERVAL_SECS)
}

fn default_context_window() -> i64 {
    crate::constants::FALLBACK_CONTEXT_WINDOW
}

impl Config {
    /// Loads configuration from `<dir>/perch.toml` plus the environment.
    ///
    /// `dir_override` (from the CLI) wins over both sources.
    pub fn load(dir_override: Option<&Path>) -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded .env file from: {:?}", path),
            Err(_) => tracing::debug!("No .env file found"),
        }

        let dir = dir_override
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("PERCH_DIR").ok().map(PathBuf::from))
            .unwrap_or_else(default_dir);

        let mut config: Config = config::Config::builder()
            .add_source(
                config::File::from(dir.join("perch.toml")).required(false),
            )
            .add_source(config::Environment::with_prefix("PERCH").separator("__"))
            .build()?
            .try_deserialize()?;
        config.dir = dir;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.default_agent.trim().is_empty() {
            return Err(crate::PerchError::ConfigurationError(
                "default_agent cannot be empty".to_string(),
            ));
        }
        if self.machine_id.trim().is_empty() {
            return Err(crate::PerchError::ConfigurationError(
                "machine_id cannot be empty".to_string(),
            ));
        }
        // Surface a bad duration at startup instead of on the first tick.
        self.poll_duration()?;
        Ok(())
    }

    /// The poll interval as a parsed [`Duration`].
    pub fn poll_duration(&self) -> Result<Duration> {
        parse_duration(&self.poll_interval).map_err(|e| {
            crate::PerchError::ConfigurationError(format!(
                "invalid poll_interval {:?}: {e}",
                self.poll_interval
            ))
        })
    }

    /// Path of the SQLite database file.
    pub fn store_path(&self) -> PathBuf {
        self.dir.join("perch.db")
    }

    /// Directory holding memory documents.
    pub fn memory_dir(&self) -> PathBuf {
        self.dir.join("memory")
    }

    /// Directory holding skill templates.
    pub fn skills_dir(&self) -> PathBuf {
        self.dir.join("skills")
    }

    /// Filesystem socket the control surface listens on.
    pub fn socket_path(&self) -> PathBuf {
        self.dir.join("perch.sock")
    }

    /// Root for per-task sandbox scratch directories.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.dir.join("sandboxes")
    }
}
