//! Typed error handling for queue engine operations.

use sendq_store::{MessageId, StoreError};
use thiserror::Error;

/// Errors surfaced by queue engine operations.
///
/// These map one-to-one onto the control protocol's error taxonomy: client
/// input defects, unknown IDs, state conflicts, and storage failures are
/// all distinguishable by the caller. Delivery outcomes are never surfaced
/// through this type; they are only observable via `status`/`list`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The submitted envelope is malformed (empty sender, no recipients).
    /// Not retried; surfaced to the caller.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// No message with this ID exists.
    #[error("Message not found: {0}")]
    NotFound(MessageId),

    /// The message changed concurrently; the caller may retry the call.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The message's current state does not permit this operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The message store could not be read or written.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl EngineError {
    /// Map a store error onto the engine's taxonomy.
    pub(crate) fn from_store(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::Conflict(id) => Self::Conflict(format!("message {id} changed concurrently")),
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}
