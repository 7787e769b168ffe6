//! Control-plane operations on the queue engine
//!
//! These are the operations the control interface exposes to local
//! clients: enqueue, list, status, remove, forced retry, flush, and the
//! retention purge. Each is a thin, validated bridge onto the store; none
//! of them ever reports a delivery outcome synchronously.

use std::time::Duration;

use sendq_common::envelope::Envelope;
use sendq_store::{Message, MessageId, MessageState, StoreError};
use tracing::{error, info};

use crate::{engine::QueueEngine, error::EngineError};

/// Result of a flush wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Every targeted message reached a terminal state (or was removed).
    Complete,
    /// The deadline expired first; in-flight deliveries are unaffected.
    TimedOut,
}

impl QueueEngine {
    /// Accept a new message into the queue.
    ///
    /// Validates the envelope, persists the message as `Pending`, and
    /// wakes the worker loop. The returned ID is the caller's handle for
    /// all later operations; delivery itself happens asynchronously.
    ///
    /// # Errors
    /// - `InvalidEnvelope` if the sender is empty or there are no
    ///   recipients
    /// - `StorageUnavailable` if the message cannot be persisted
    pub async fn enqueue(
        &self,
        envelope: Envelope,
        payload: std::sync::Arc<[u8]>,
    ) -> Result<MessageId, EngineError> {
        validate_envelope(&envelope)?;

        let message = Message::new(envelope, payload);
        let id = message.id.clone();

        if let Err(e) = self.store.put(&message).await {
            if matches!(e, StoreError::DuplicateId(_)) {
                // Generated IDs must never collide
                error!(id = %id, "duplicate message id on enqueue: {e}");
            }
            return Err(EngineError::StorageUnavailable(e.to_string()));
        }

        info!(id = %id, size = message.payload_size, "message enqueued");

        self.wake.notify_one();

        Ok(id)
    }

    /// All messages, optionally restricted to one state, in FIFO order.
    ///
    /// # Errors
    /// `StorageUnavailable` if the store cannot be read.
    pub async fn list(&self, filter: Option<MessageState>) -> Result<Vec<Message>, EngineError> {
        let states = filter.map_or_else(|| MessageState::ALL.to_vec(), |state| vec![state]);

        self.store
            .scan(&states)
            .await
            .map_err(EngineError::from_store)
    }

    /// Look up one message.
    ///
    /// # Errors
    /// `NotFound` if no message with this ID exists.
    pub async fn status(&self, id: &MessageId) -> Result<Message, EngineError> {
        self.store.get(id).await.map_err(EngineError::from_store)
    }

    /// Remove a message from the queue.
    ///
    /// Permitted in any state except `InFlight`; removing an absent ID is
    /// not an error.
    ///
    /// # Errors
    /// `Conflict` if the message is currently being delivered.
    pub async fn remove(&self, id: &MessageId) -> Result<(), EngineError> {
        match self.store.get(id).await {
            Ok(message) if message.state == MessageState::InFlight => {
                return Err(EngineError::Conflict(format!(
                    "message {id} is in flight; try again once the attempt finishes"
                )));
            }
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(EngineError::from_store(e)),
        }

        self.store
            .delete(id)
            .await
            .map_err(EngineError::from_store)?;

        info!(id = %id, "message removed");

        self.settled.send_modify(|n| *n = n.wrapping_add(1));

        Ok(())
    }

    /// Force a message's next attempt to happen now.
    ///
    /// Applies to `RetryScheduled` messages and to `FailedPermanent`
    /// messages that have attempts remaining (an operator's explicit way
    /// back out of abandonment). A `Pending` message only gets the worker
    /// loop woken.
    ///
    /// # Errors
    /// - `NotFound` if no message with this ID exists
    /// - `InvalidState` if the message is `InFlight`, `Delivered`, or has
    ///   exhausted its attempts
    pub async fn retry_now(&self, id: &MessageId) -> Result<(), EngineError> {
        let message = self.status(id).await?;

        match message.state {
            MessageState::InFlight => {
                return Err(EngineError::InvalidState(format!(
                    "message {id} is currently being delivered"
                )));
            }
            MessageState::Delivered => {
                return Err(EngineError::InvalidState(format!(
                    "message {id} is already delivered"
                )));
            }
            MessageState::FailedPermanent
                if message.attempt_count >= self.policy.max_attempts =>
            {
                return Err(EngineError::InvalidState(format!(
                    "message {id} has exhausted its {} attempts",
                    self.policy.max_attempts
                )));
            }
            MessageState::Pending => {
                self.wake.notify_one();
                return Ok(());
            }
            MessageState::RetryScheduled | MessageState::FailedPermanent => {}
        }

        let now = sendq_common::unix_now();
        self.store
            .update(
                id,
                Box::new(move |m| match m.state {
                    MessageState::RetryScheduled | MessageState::FailedPermanent => {
                        m.state = MessageState::RetryScheduled;
                        m.next_attempt_at = Some(now);
                        Ok(())
                    }
                    _ => Err(StoreError::Conflict(m.id.clone())),
                }),
            )
            .await
            .map_err(EngineError::from_store)?;

        info!(id = %id, "retry forced");

        self.wake.notify_one();

        Ok(())
    }

    /// Wait until every message that was `Pending` or due for retry at
    /// call time has reached a terminal state or been removed.
    ///
    /// With no deadline the wait is unbounded; with one, expiry returns
    /// [`FlushOutcome::TimedOut`] without affecting in-flight deliveries.
    ///
    /// # Errors
    /// `StorageUnavailable` if the store cannot be read.
    pub async fn flush(&self, timeout: Option<Duration>) -> Result<FlushOutcome, EngineError> {
        let now = sendq_common::unix_now();
        let mut settled = self.settled.subscribe();

        let targets: Vec<MessageId> = self
            .store
            .scan(&[MessageState::Pending, MessageState::RetryScheduled])
            .await
            .map_err(EngineError::from_store)?
            .into_iter()
            .filter(|m| m.is_due(now))
            .map(|m| m.id)
            .collect();

        if targets.is_empty() {
            return Ok(FlushOutcome::Complete);
        }

        // Get every idle worker moving on the snapshot
        self.wake.notify_waiters();

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        loop {
            let mut unsettled = false;
            for id in &targets {
                match self.store.get(id).await {
                    Ok(message) if message.is_terminal() => {}
                    Ok(_) => {
                        unsettled = true;
                        break;
                    }
                    Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(EngineError::from_store(e)),
                }
            }

            if !unsettled {
                return Ok(FlushOutcome::Complete);
            }

            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, settled.changed()).await.is_err() {
                        return Ok(FlushOutcome::TimedOut);
                    }
                }
                None => {
                    let _ = settled.changed().await;
                }
            }
        }
    }

    /// Delete terminal messages whose last update is older than
    /// `older_than`.
    ///
    /// Retention is manual-only unless configured: nothing calls this
    /// unless the operator asked for a purge horizon.
    ///
    /// # Errors
    /// `StorageUnavailable` if the store cannot be scanned.
    pub async fn purge_terminal(&self, older_than: Duration) -> Result<usize, EngineError> {
        let cutoff = sendq_common::unix_now().saturating_sub(older_than.as_secs());

        let terminal = self
            .store
            .scan(&[MessageState::Delivered, MessageState::FailedPermanent])
            .await
            .map_err(EngineError::from_store)?;

        let mut purged = 0;

        for message in terminal {
            if message.updated_at > cutoff {
                continue;
            }

            match self.store.delete(&message.id).await {
                Ok(()) => purged += 1,
                Err(e) => {
                    tracing::warn!(id = %message.id, error = %e, "failed to purge terminal message");
                }
            }
        }

        if purged > 0 {
            info!(purged, "purged terminal messages past the retention horizon");
        }

        Ok(purged)
    }
}

fn validate_envelope(envelope: &Envelope) -> Result<(), EngineError> {
    if envelope.sender.trim().is_empty() {
        return Err(EngineError::InvalidEnvelope(
            "sender must not be empty".to_string(),
        ));
    }

    if envelope.recipients.is_empty() {
        return Err(EngineError::InvalidEnvelope(
            "at least one recipient is required".to_string(),
        ));
    }

    if envelope.recipients.iter().any(|r| r.trim().is_empty()) {
        return Err(EngineError::InvalidEnvelope(
            "recipient addresses must not be empty".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_validation() {
        let valid = Envelope::new("a@x", vec!["b@y".to_string()]);
        assert!(validate_envelope(&valid).is_ok());

        let no_sender = Envelope::new("", vec!["b@y".to_string()]);
        assert!(matches!(
            validate_envelope(&no_sender),
            Err(EngineError::InvalidEnvelope(_))
        ));

        let no_recipients = Envelope::new("a@x", vec![]);
        assert!(matches!(
            validate_envelope(&no_recipients),
            Err(EngineError::InvalidEnvelope(_))
        ));

        let blank_recipient = Envelope::new("a@x", vec!["b@y".to_string(), "  ".to_string()]);
        assert!(matches!(
            validate_envelope(&blank_recipient),
            Err(EngineError::InvalidEnvelope(_))
        ));
    }
}
