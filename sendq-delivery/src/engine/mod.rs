//! Queue engine orchestration
//!
//! The engine owns the delivery state machine: it pulls due messages from
//! the store, claims them with a compare-and-swap transition so that no two
//! workers ever deliver the same message, runs the executor, and records
//! the outcome the retry policy dictates.

mod ops;
mod recovery;

use std::{sync::Arc, time::Duration};

use sendq_common::{Signal, internal};
use sendq_store::{BackingStore, Message, MessageState, StoreError};
use serde::Deserialize;
use tokio::{
    sync::{Notify, broadcast, watch},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::EngineError,
    executor::Executor,
    retry::{Decision, RetryPolicy},
    transport::Outcome,
};

pub use ops::FlushOutcome;

const fn default_poll_interval() -> u64 {
    10
}

fn default_workers() -> usize {
    num_cpus::get().clamp(1, 4)
}

/// Configuration for the queue engine's worker loop
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Idle wait between delivery passes when no wake signal arrives (in
    /// seconds)
    ///
    /// The wake signal from the control plane makes new work start almost
    /// immediately; this interval is the polling fallback that keeps the
    /// engine correct even if a wake is dropped.
    ///
    /// Default: 10 seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Number of concurrent delivery workers
    ///
    /// The engine is correct with one worker and with many; more workers
    /// increase delivery parallelism across distinct messages.
    ///
    /// Default: the number of CPUs, capped at 4
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            workers: default_workers(),
        }
    }
}

/// Orchestrates delivery of queued messages
///
/// All mutation goes through the store's compare-and-swap update; the
/// engine itself holds no message state, so any number of engines or
/// workers may share one store.
#[derive(Debug)]
pub struct QueueEngine {
    pub(crate) store: Arc<dyn BackingStore>,
    pub(crate) executor: Executor,
    pub(crate) policy: RetryPolicy,
    config: EngineConfig,
    /// Wakes idle workers when new work arrives (enqueue, forced retry)
    pub(crate) wake: Notify,
    /// Bumped whenever a message settles or is removed; `flush` waits on it
    pub(crate) settled: watch::Sender<u64>,
}

impl QueueEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn BackingStore>,
        executor: Executor,
        policy: RetryPolicy,
        config: EngineConfig,
    ) -> Self {
        let (settled, _) = watch::channel(0);

        Self {
            store,
            executor,
            policy,
            config,
            wake: Notify::new(),
            settled,
        }
    }

    /// The retry policy in effect
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run the queue engine until a shutdown signal is received
    ///
    /// Performs the startup recovery pass (reverting messages interrupted
    /// mid-delivery by a previous crash), then runs the configured number
    /// of workers. On shutdown, workers finish their current attempt before
    /// stopping.
    ///
    /// # Errors
    /// Returns an error if the recovery pass cannot read the store.
    pub async fn serve(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), EngineError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            internal!(
                level = INFO,
                "Recovered {recovered} messages interrupted mid-delivery"
            );
        }

        internal!("Queue engine starting with {} workers", self.config.workers);

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut workers = JoinSet::new();

        for worker in 0..self.config.workers.max(1) {
            let engine = Arc::clone(self);
            let stop = stop_rx.clone();
            workers.spawn(async move { engine.worker_loop(worker, stop).await });
        }
        drop(stop_rx);

        match shutdown.recv().await {
            Ok(Signal::Shutdown | Signal::Finalised) => {
                internal!("Queue engine received shutdown signal");
            }
            Err(e) => {
                error!("Queue engine shutdown channel error: {e}");
            }
        }

        let _ = stop_tx.send(true);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Queue worker task failed: {e}");
            }
        }

        internal!("Queue engine shutdown complete");

        Ok(())
    }

    /// One worker: run delivery passes, then wait for a wake signal or the
    /// poll interval, whichever comes first.
    async fn worker_loop(self: Arc<Self>, worker: usize, mut stop: watch::Receiver<bool>) {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs.max(1));

        loop {
            if *stop.borrow() {
                break;
            }

            match self.process_due().await {
                Ok(0) => {}
                Ok(count) => {
                    debug!(worker, count, "delivery pass complete");
                    // More messages may have become due meanwhile
                    continue;
                }
                Err(e) => {
                    error!(worker, error = %e, "delivery pass failed; retrying after idle wait");
                }
            }

            tokio::select! {
                () = self.wake.notified() => {}
                () = tokio::time::sleep(poll_interval) => {}
                _ = stop.changed() => break,
            }
        }

        debug!(worker, "queue worker stopped");
    }

    /// Run one delivery pass: claim and deliver every message that is due.
    ///
    /// Candidates are offered in FIFO order (`created_at` ascending).
    /// Messages another worker claims first are skipped silently; that
    /// compare-and-swap is the sole mechanism guaranteeing at most one
    /// concurrent delivery per message.
    ///
    /// Returns the number of messages this pass attempted.
    ///
    /// # Errors
    /// Returns an error if the store cannot be scanned.
    pub async fn process_due(&self) -> Result<usize, EngineError> {
        let now = sendq_common::unix_now();

        let candidates = self
            .store
            .scan(&[MessageState::Pending, MessageState::RetryScheduled])
            .await
            .map_err(EngineError::from_store)?;

        let mut attempted = 0;

        for candidate in candidates {
            if !candidate.is_due(now) {
                continue;
            }

            let claimed = match self.claim(&candidate).await {
                Ok(message) => message,
                Err(StoreError::Conflict(_) | StoreError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(id = %candidate.id, error = %e, "failed to claim message; leaving it untouched");
                    continue;
                }
            };

            self.deliver(claimed).await;
            attempted += 1;
        }

        Ok(attempted)
    }

    /// Transition a due message to `InFlight` via compare-and-swap.
    async fn claim(&self, candidate: &Message) -> Result<Message, StoreError> {
        let now = sendq_common::unix_now();

        self.store
            .update(
                &candidate.id,
                Box::new(move |m| {
                    if m.is_due(now) {
                        m.state = MessageState::InFlight;
                        Ok(())
                    } else {
                        // Another worker claimed it, or it settled meanwhile
                        Err(StoreError::Conflict(m.id.clone()))
                    }
                }),
            )
            .await
    }

    /// Run one delivery attempt for a claimed message and record the
    /// outcome.
    async fn deliver(&self, message: Message) {
        let id = message.id.clone();
        let outcome = self.executor.attempt(&message).await;
        let policy = self.policy;
        let now = sendq_common::unix_now();

        let settled = self
            .store
            .update(
                &id,
                Box::new(move |m| {
                    m.attempt_count = m.attempt_count.saturating_add(1);
                    apply_outcome(m, outcome, &policy, now);
                    Ok(())
                }),
            )
            .await;

        match settled {
            Ok(updated) => match updated.state {
                MessageState::Delivered => {
                    info!(id = %id, attempts = updated.attempt_count, "message delivered");
                }
                MessageState::FailedPermanent => {
                    warn!(
                        id = %id,
                        attempts = updated.attempt_count,
                        error = updated.last_error.as_deref().unwrap_or(""),
                        "message failed permanently"
                    );
                }
                _ => {
                    info!(
                        id = %id,
                        attempts = updated.attempt_count,
                        next_attempt_at = updated.next_attempt_at,
                        "delivery failed transiently; retry scheduled"
                    );
                }
            },
            Err(e) => {
                // The message stays InFlight; the startup recovery pass
                // will reschedule it if this store outage persists until a
                // restart.
                error!(id = %id, error = %e, "failed to record delivery outcome");
            }
        }

        self.settled.send_modify(|n| *n = n.wrapping_add(1));
    }
}

/// Apply a classified delivery outcome to a message record.
///
/// `attempt_count` has already been incremented for the attempt this
/// outcome belongs to.
fn apply_outcome(message: &mut Message, outcome: Outcome, policy: &RetryPolicy, now: u64) {
    match outcome {
        Outcome::Success => {
            message.state = MessageState::Delivered;
            message.next_attempt_at = None;
            message.last_error = None;
        }
        Outcome::PermanentFailure(reason) => {
            message.state = MessageState::FailedPermanent;
            message.next_attempt_at = None;
            message.last_error = Some(reason);
        }
        Outcome::TransientFailure(reason) => {
            message.last_error = Some(reason);
            match policy.decide(message.attempt_count) {
                Decision::Retry { delay } => {
                    message.state = MessageState::RetryScheduled;
                    message.next_attempt_at = Some(now + delay.as_secs());
                }
                Decision::GiveUp => {
                    message.state = MessageState::FailedPermanent;
                    message.next_attempt_at = None;
                }
            }
        }
    }
}
