//! The sendq daemon: accepts mail submissions from local clients, holds
//! them durably, and hands them to an external transport command, retrying
//! transient failures until each message is delivered or abandoned.

pub mod daemon;
pub mod handler;

pub use daemon::{RetentionPolicy, Sendq};
pub use handler::ControlHandler;
