use thiserror::Error;

use crate::core::TeamId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    /// Malformed configuration. Always fatal: raised before any cycle runs.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Team not found: {0}")]
    TeamNotFound(TeamId),

    #[error("Board for team {team} is inconsistent: {reason}")]
    InconsistentBoard { team: TeamId, reason: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Advisor error: {0}")]
    Advisor(String),

    #[error("Advisor binary not found: {0}")]
    AdvisorBinaryNotFound(String),

    #[error("Store error: {0}")]
    Store(String),
}

pub type Result<T> = std::result::Result<T, Error>;
