use thiserror::Error;

use crate::connection::{ConnectionId, DispatcherId};

pub type Result<T> = std::result::Result<T, ReactorError>;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Migration already in progress for connection {0}")]
    MigrationConflict(ConnectionId),

    #[error("Migration phase '{phase}' failed: {reason}")]
    MigrationPhase {
        phase: &'static str,
        reason: String,
    },

    #[error("Dispatcher {0} unavailable")]
    DispatcherUnavailable(DispatcherId),

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Socket error: {0}")]
    SocketError(String),
}
