//! One delivery attempt: invoke the transport, classify the result

use std::{io, sync::Arc};

use sendq_store::Message;
use tracing::debug;

use crate::transport::{Outcome, Transport, TransportStatus};

/// Runs a single delivery attempt and classifies its result.
///
/// The executor never retries and never touches the message store; the
/// queue engine owns both of those concerns.
#[derive(Debug, Clone)]
pub struct Executor {
    transport: Arc<dyn Transport>,
    transient_exit_codes: Vec<i32>,
}

impl Executor {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, transient_exit_codes: Vec<i32>) -> Self {
        Self {
            transport,
            transient_exit_codes,
        }
    }

    /// Invoke the transport exactly once for `message` and classify the
    /// result.
    pub async fn attempt(&self, message: &Message) -> Outcome {
        let result = self
            .transport
            .invoke(&message.envelope, &message.payload)
            .await;

        let outcome = match result {
            Ok(status) => self.classify(&status),
            Err(e) => classify_invocation_error(&e),
        };

        debug!(id = %message.id, ?outcome, "delivery attempt classified");

        outcome
    }

    /// Map an exit status onto the outcome taxonomy.
    ///
    /// Zero is success. Exit codes the configuration marks as transient
    /// (network down, remote busy) are retried; every other exit code is a
    /// local or remote rejection that retrying cannot fix. Signal death
    /// and timeouts report no exit code and are treated as transient.
    fn classify(&self, status: &TransportStatus) -> Outcome {
        match status.code {
            Some(0) => Outcome::Success,
            Some(code) if self.transient_exit_codes.contains(&code) => {
                Outcome::TransientFailure(describe(status, code))
            }
            Some(code) => Outcome::PermanentFailure(describe(status, code)),
            None => Outcome::TransientFailure(if status.diagnostic.is_empty() {
                "transport terminated by signal".to_string()
            } else {
                status.diagnostic.clone()
            }),
        }
    }
}

/// Classify a failure to run the transport at all.
///
/// A missing or non-executable transport binary is a local configuration
/// defect; anything else (pipe errors, resource exhaustion) may clear up
/// on its own.
fn classify_invocation_error(error: &io::Error) -> Outcome {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => {
            Outcome::PermanentFailure(format!("cannot run transport command: {error}"))
        }
        _ => Outcome::TransientFailure(format!("transport invocation failed: {error}")),
    }
}

fn describe(status: &TransportStatus, code: i32) -> String {
    if status.diagnostic.is_empty() {
        format!("transport exited with status {code}")
    } else {
        format!("transport exited with status {code}: {}", status.diagnostic)
    }
}
