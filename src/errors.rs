use std::io;

use thiserror::Error;

/// Failure reported by the protocol session for a single call.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{operation} failed: {message}")]
pub struct ProtocolError {
    pub operation: String,
    pub message: String,
}

impl ProtocolError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("Migration {version} failed: {source}")]
    Migration {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Protocol session is not connected")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
