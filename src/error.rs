//! Error types for the PetCar link

use std::time::Duration;

use thiserror::Error;

use crate::action::ExecutionError;
use crate::engine::EngineError;
use crate::protocol::{Channel, DecodeError};
use crate::queue::QueueError;

/// Result type alias for PetCar link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the PetCar link
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),

    /// Recognition, generation or synthesis engine failure
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Queue closed underneath an operation
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Every sequence number on an outbound channel has been used
    #[error("sequence numbers exhausted on {0}")]
    SequenceExhausted(Channel),

    /// Outbound audio was not drained by the terminal in time
    #[error("outbound audio stalled for {0:?}")]
    StallTimeout(Duration),

    /// Transport-level failure (connect, send, receive)
    #[error("transport error: {0}")]
    Transport(String),

    /// Action execution failure
    #[error("action error: {0}")]
    Execution(#[from] ExecutionError),

    /// Audio file handling error
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding/decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<axum::Error> for Error {
    fn from(e: axum::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
