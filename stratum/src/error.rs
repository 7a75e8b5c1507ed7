use thiserror::Error;

#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid identifier: {0}")]
    Identifier(String),

    #[error("Unknown component: {0}")]
    UnknownComponent(String),

    #[error("Unknown archetype: {0}")]
    UnknownArchetype(String),

    #[error("Metadata conflict for '{name}': {detail}")]
    MetadataConflict { name: String, detail: String },

    #[error("Entity not found: {0}")]
    EntityNotFound(uuid::Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Save timed out after {0} ms")]
    SaveTimeout(u64),

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Invalid cron expression '{expr}': {detail}")]
    InvalidCron { expr: String, detail: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StratumError>;
