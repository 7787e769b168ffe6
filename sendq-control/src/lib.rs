//! Control-plane IPC for the sendq daemon
//!
//! Local clients talk to the daemon over a Unix domain socket using a
//! simple request/response protocol: a 4-byte big-endian length prefix
//! followed by a bincode-encoded, versioned message. The daemon implements
//! [`server::CommandHandler`]; clients use [`ControlClient`].

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use error::{ControlError, Result};
pub use protocol::{
    Command, ErrorKind, ErrorReply, MessageSummary, QueueCommand, Request, Response, ResponseData,
    ResponsePayload, SystemCommand, SystemStatus,
};
pub use server::{CommandHandler, ControlServer};

/// Default path of the daemon's control socket
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/sendq/control.sock";
