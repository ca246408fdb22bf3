use std::io;

use tasksync_core::models::ConnectivityState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tasksync_core::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error("Invalid id '{0}'")]
    InvalidId(String),
    #[error(
        "Sync is not configured. Set server_url in the settings file or TASKSYNC_SERVER_URL."
    )]
    SyncNotConfigured,
    #[error("Sync server unreachable ({0}); changes stay queued")]
    ServerUnreachable(ConnectivityState),
}
