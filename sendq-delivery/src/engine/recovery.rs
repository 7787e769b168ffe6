//! Crash recovery for interrupted deliveries
//!
//! A message found `InFlight` at startup was being delivered when the
//! previous process died. Whether the transport actually ran is unknowable,
//! so the attempt is conservatively treated as a transient failure: the
//! retry policy either reschedules the message or abandons it, but it is
//! never assumed delivered.

use sendq_store::{MessageState, StoreError};
use tracing::warn;

use crate::{
    engine::QueueEngine,
    error::EngineError,
    retry::Decision,
};

impl QueueEngine {
    /// Reconcile messages left `InFlight` by a previous run.
    ///
    /// Returns the number of messages reverted. Runs before any worker
    /// starts, so no claim can race with it.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let interrupted = self
            .store
            .scan(&[MessageState::InFlight])
            .await
            .map_err(EngineError::from_store)?;

        let mut recovered = 0;

        for message in interrupted {
            let policy = self.policy;
            let now = sendq_common::unix_now();

            let result = self
                .store
                .update(
                    &message.id,
                    Box::new(move |m| {
                        if m.state != MessageState::InFlight {
                            return Err(StoreError::Conflict(m.id.clone()));
                        }

                        // The interrupted attempt counts as one transient
                        // failure
                        m.attempt_count = m.attempt_count.saturating_add(1);
                        m.last_error =
                            Some("delivery interrupted by shutdown or crash".to_string());

                        match policy.decide(m.attempt_count) {
                            Decision::Retry { delay } => {
                                m.state = MessageState::RetryScheduled;
                                m.next_attempt_at = Some(now + delay.as_secs());
                            }
                            Decision::GiveUp => {
                                m.state = MessageState::FailedPermanent;
                                m.next_attempt_at = None;
                            }
                        }

                        Ok(())
                    }),
                )
                .await;

            match result {
                Ok(updated) => {
                    warn!(
                        id = %message.id,
                        state = %updated.state,
                        attempts = updated.attempt_count,
                        "reverted message interrupted mid-delivery"
                    );
                    recovered += 1;
                }
                Err(e) => {
                    warn!(id = %message.id, error = %e, "failed to revert interrupted message");
                }
            }
        }

        Ok(recovered)
    }
}
