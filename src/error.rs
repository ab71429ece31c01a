//! Error types shared by the device manager, the command bridge and storage.
//!
//! Library code returns these typed errors; `main.rs` and configuration loading
//! use `anyhow` at the edges.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage lock poisoned")]
    Poisoned,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Errors surfaced by the connection manager and command methods.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("device not connected")]
    NotConnected,

    #[error("failed to connect to device: {0}")]
    ConnectFailed(String),

    #[error("device unreachable after {attempts} attempts")]
    Unreachable { attempts: u32 },

    #[error("command {command} timed out after {}s", .after.as_secs_f32())]
    Timeout {
        command: &'static str,
        after: Duration,
    },

    #[error("connection lost while command was in flight")]
    DisconnectedMidFlight,

    #[error("malformed {kind} event: {reason}")]
    MalformedEvent { kind: &'static str, reason: String },

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("device rejected command: {0}")]
    DeviceRejected(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl GatewayError {
    /// Shorthand for transport failures that do not originate from an `io::Error`.
    pub fn transport(msg: impl Into<String>) -> Self {
        GatewayError::Transport(std::io::Error::new(
            std::io::ErrorKind::Other,
            msg.into(),
        ))
    }

    /// True for errors that mean the link itself is gone.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_) | GatewayError::DisconnectedMidFlight
        )
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Storage(StorageError::Database(e))
    }
}

impl From<crate::validation::ValidationError> for GatewayError {
    fn from(e: crate::validation::ValidationError) -> Self {
        GatewayError::InvalidInput(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
