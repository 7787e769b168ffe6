//! Delivery engine for queued outbound mail
//!
//! This crate drives messages from the store to the external transport:
//! - Claim due messages with at-most-one-delivery semantics
//! - Invoke the transport command and classify the outcome
//! - Schedule retries with exponential backoff, up to an attempt ceiling
//! - Recover interrupted deliveries after a crash or restart

pub mod engine;
mod error;
mod executor;
mod retry;
mod transport;

pub use engine::{EngineConfig, FlushOutcome, QueueEngine};
pub use error::EngineError;
pub use executor::Executor;
pub use retry::{Decision, RetryPolicy};
pub use transport::{
    CommandTransport, MockTransport, Outcome, Transport, TransportConfig, TransportStatus,
};
