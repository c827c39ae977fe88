use thiserror::Error;

use crate::fifo::ItemId;

#[derive(Error, Debug)]
pub enum DroverError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Undecodable payload for item {id}: {message}")]
    Decode { id: ItemId, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DroverError {
    /// Store-level failures end the current pass; the agent retries after its
    /// regular sleep instead of hot looping.
    pub fn is_transient(&self) -> bool {
        matches!(self, DroverError::Backend(_))
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;
