use std::sync::Arc;

use sendq_common::{envelope::Envelope, unix_now};
use serde::{Deserialize, Serialize};

use crate::types::MessageId;

/// Delivery lifecycle state of a queued message
///
/// Transitions follow `Pending -> InFlight -> {Delivered | RetryScheduled |
/// FailedPermanent}` and `RetryScheduled -> InFlight` once the retry is due.
/// `Delivered` and `FailedPermanent` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    /// Awaiting a first delivery attempt
    Pending,
    /// Claimed by a worker; a delivery attempt is running
    InFlight,
    /// Handed to the transport successfully (terminal)
    Delivered,
    /// Abandoned after a permanent failure or exhausted retries (terminal)
    FailedPermanent,
    /// A prior attempt failed transiently; waiting for the retry to come due
    RetryScheduled,
}

impl MessageState {
    /// Every state, in a stable order (used for unfiltered scans)
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InFlight,
        Self::Delivered,
        Self::FailedPermanent,
        Self::RetryScheduled,
    ];

    /// Whether this state admits no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::FailedPermanent)
    }
}

impl std::fmt::Display for MessageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed-permanent",
            Self::RetryScheduled => "retry-scheduled",
        })
    }
}

impl std::str::FromStr for MessageState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-flight" => Ok(Self::InFlight),
            "delivered" => Ok(Self::Delivered),
            "failed-permanent" => Ok(Self::FailedPermanent),
            "retry-scheduled" => Ok(Self::RetryScheduled),
            other => Err(format!("unknown message state: {other}")),
        }
    }
}

/// A queued message: envelope, opaque payload, and delivery bookkeeping
///
/// The envelope and payload are immutable once stored; only the delivery
/// bookkeeping fields change, and only through [`BackingStore::update`]
/// (which bumps `revision` and `updated_at` on every successful write).
///
/// [`BackingStore::update`]: crate::store::BackingStore::update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, assigned at enqueue time
    pub id: MessageId,
    /// The envelope (sender, recipients)
    pub envelope: Envelope,
    /// The raw message bytes, stored separately by the file backend
    #[serde(skip)]
    pub payload: Arc<[u8]>,
    /// Size of the payload in bytes (kept in the metadata so summaries do
    /// not require reading the payload)
    pub payload_size: usize,
    /// Current lifecycle state
    pub state: MessageState,
    /// Number of completed delivery attempts
    pub attempt_count: u32,
    /// When `state == RetryScheduled`, the earliest time (Unix seconds) the
    /// next attempt may run
    pub next_attempt_at: Option<u64>,
    /// Diagnostic text from the most recent failed attempt
    pub last_error: Option<String>,
    /// Unix timestamp when the message was enqueued
    pub created_at: u64,
    /// Unix timestamp of the last store update
    pub updated_at: u64,
    /// Compare-and-swap guard; owned by the backing store
    pub revision: u64,
}

impl Message {
    /// Create a new pending message with a freshly generated ID
    #[must_use]
    pub fn new(envelope: Envelope, payload: Arc<[u8]>) -> Self {
        let now = unix_now();

        Self {
            id: MessageId::generate(),
            envelope,
            payload_size: payload.len(),
            payload,
            state: MessageState::Pending,
            attempt_count: 0,
            next_attempt_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Whether this state admits no further transitions
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether a worker may attempt delivery now
    ///
    /// `Pending` messages are always due; `RetryScheduled` messages are due
    /// once `next_attempt_at` has passed (a missing `next_attempt_at` is
    /// treated as due, never as "wait forever").
    #[must_use]
    pub fn is_due(&self, now: u64) -> bool {
        match self.state {
            MessageState::Pending => true,
            MessageState::RetryScheduled => self.next_attempt_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }
}
