//! Error types for Convoy

use thiserror::Error;

/// Result type alias using Convoy Error
pub type Result<T> = std::result::Result<T, Error>;

/// Convoy error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Transport reset by peer")]
    TransportReset,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Invalid agent id: {0:?}")]
    InvalidAgentId(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is a benign connection reset that should be treated
    /// as an ordinary disconnect.
    pub fn is_reset(&self) -> bool {
        match self {
            Error::TransportReset => true,
            Error::Io(e) => is_reset_kind(e.kind()),
            _ => false,
        }
    }
}

/// I/O error kinds that mean the peer went away.
pub fn is_reset_kind(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof
    )
}
