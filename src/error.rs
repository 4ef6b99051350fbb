use thiserror::Error;

/// Convenience type alias for Results with PerchError
pub type Result<T> = std::result::Result<T, PerchError>;

/// Main error type for Perch
///
/// Covers every fault the daemon surfaces. Task-fatal variants feed the
/// engine's failure/retry path; side-effect faults (schedule, memory write,
/// cron) are logged against the task and never propagate through dispatch.
#[derive(Error, Debug)]
pub enum PerchError {
    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Front-matter error: {0}")]
    FrontMatter(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Agent transport error: {0}")]
    AgentTransport(#[from] reqwest::Error),

    #[error("Agent error: {message}")]
    Agent { message: String },

    #[error("Task execution error: {task_id} - {message}")]
    TaskExecution { task_id: String, message: String },

    #[error("Skill error: {0}")]
    Skill(String),

    #[error("Cron error: {0}")]
    Cron(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Timeout error: {message}")]
    Timeout { message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
