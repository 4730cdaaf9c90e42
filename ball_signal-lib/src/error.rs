use thiserror::Error;

use crate::engine::EngineError;
use crate::transport::TransportError;

/// Errors returned by the signaling layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),

    #[error("peer engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("engine returned no local description after answering")]
    MissingLocalDescription,

    #[error("frame error: {0}")]
    Frame(String),
}

pub type Result<T, E = SignalError> = std::result::Result<T, E>;
