//! Error types for tasksync-core

use thiserror::Error;

/// Result type alias using tasksync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tasksync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Pending change or conflict not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input rejected before it reached the queue
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A write to durable storage failed; the affected data stays queued
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Invalid runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Shorthand for validation failures surfaced to producers.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}
