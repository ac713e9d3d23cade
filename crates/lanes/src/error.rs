//! Error types for the lane runtime

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LaneError {
    #[error("Failed to spawn lane worker: {0}")]
    Spawn(String),

    #[error("Lane protocol error: {0}")]
    Protocol(String),

    #[error("Agent transport error: {0}")]
    Transport(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type LaneResult<T> = Result<T, LaneError>;
