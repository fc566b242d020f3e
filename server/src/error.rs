//! Shared error types for the matchmaking service.

use crate::store::StoreError;
use crate::validation::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The shared store is unavailable or a command failed. Recoverable:
    /// background loops retry on their next tick.
    #[error("shared store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// A participant's state changed under us (e.g. status flipped to
    /// "matched" between enqueue and scan). The losing side aborts.
    #[error("state race for participant {participant_id}: {reason}")]
    Race {
        participant_id: String,
        reason: String,
    },

    /// A pair attempt selected the searching participant as their own
    /// opponent. Fatal for the attempt; the scanner re-runs.
    #[error("refusing to match participant {participant_id} with themselves")]
    SelfMatch { participant_id: String },

    #[error("round {round_number} queue is full")]
    QueueFull { round_number: u32 },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ServiceError {
    /// Whether the caller may retry the operation on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Persistence(_))
    }
}
