//! Control protocol types and serialization

use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
};

use chrono::{TimeZone, Utc, offset::LocalResult};
use serde::{Deserialize, Serialize};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Format a Unix timestamp (seconds) as human-readable UTC
fn format_timestamp(timestamp_secs: u64) -> String {
    let datetime = Utc.timestamp_opt(i64::try_from(timestamp_secs).unwrap_or(0), 0);
    if let LocalResult::Single(dt) = datetime {
        dt.format("%Y-%m-%d %H:%M:%S UTC").to_string()
    } else {
        "unknown".to_string()
    }
}

/// Request sent to the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version
    pub version: u32,
    /// The actual command to execute
    pub command: Command,
}

/// Request command types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Queue management commands
    Queue(QueueCommand),
    /// System management commands
    System(SystemCommand),
}

/// Queue management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    /// Submit a message for delivery
    Enqueue {
        /// Envelope sender (return path)
        sender: String,
        /// Envelope recipients, in order
        recipients: Vec<String>,
        /// Raw message bytes, passed to the transport unchanged
        payload: Vec<u8>,
    },
    /// List messages in the queue
    List {
        /// Filter by state (optional; a state's display name)
        state_filter: Option<String>,
    },
    /// Get one message's summary
    Status {
        /// Message ID to look up
        message_id: String,
    },
    /// Remove a message from the queue
    Remove {
        /// Message ID to remove
        message_id: String,
    },
    /// Force a message's next delivery attempt to happen now
    Retry {
        /// Message ID to retry
        message_id: String,
    },
    /// Wait until everything currently due has settled
    Flush {
        /// Give up waiting after this many seconds (omit to wait
        /// indefinitely)
        timeout_secs: Option<u64>,
    },
}

/// System management commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemCommand {
    /// Health check / ping
    Ping,
    /// Get daemon status and queue statistics
    Status,
}

/// Response from the control server (versioned wrapper)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Protocol version
    pub version: u32,
    /// The actual response payload
    pub payload: ResponsePayload,
}

/// Response payload types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Command succeeded
    Ok,
    /// Command succeeded with data
    Data(Box<ResponseData>),
    /// Command failed
    Error(ErrorReply),
}

/// Response data types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    /// A message was accepted into the queue
    Enqueued {
        /// The assigned message ID
        message_id: String,
    },
    /// Queue message list
    MessageList(Vec<MessageSummary>),
    /// One message's summary
    MessageStatus(MessageSummary),
    /// Outcome of a flush wait
    FlushResult {
        /// Whether every targeted message settled before the deadline
        complete: bool,
    },
    /// Daemon status information
    SystemStatus(SystemStatus),
}

/// Error categories surfaced to control clients
///
/// A closed set so that clients can react programmatically without
/// parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The submitted envelope is malformed
    InvalidEnvelope,
    /// No message with the given ID exists
    NotFound,
    /// The message changed concurrently; the call may be retried
    Conflict,
    /// The message's current state does not permit the operation
    InvalidState,
    /// The message store could not be read or written
    StorageUnavailable,
    /// The request timed out
    Timeout,
    /// Anything else
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InvalidEnvelope => "invalid envelope",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::InvalidState => "invalid state",
            Self::StorageUnavailable => "storage unavailable",
            Self::Timeout => "timeout",
            Self::Internal => "internal error",
        })
    }
}

/// A structured error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    /// Error category
    pub kind: ErrorKind,
    /// Human-readable detail
    pub message: String,
}

impl Display for ErrorReply {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Message summary for list and status commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    /// Message ID
    pub id: String,
    /// Envelope sender
    pub sender: String,
    /// Envelope recipients
    pub recipients: Vec<String>,
    /// Delivery state (display name)
    pub state: String,
    /// Number of completed delivery attempts
    pub attempts: u32,
    /// Payload size in bytes
    pub size: usize,
    /// Time the message was enqueued (Unix timestamp in seconds)
    pub created_at: u64,
    /// Time of the last state change (Unix timestamp in seconds)
    pub updated_at: u64,
    /// Next scheduled attempt (Unix timestamp in seconds)
    pub next_attempt_at: Option<u64>,
    /// Most recent failure, if any
    pub last_error: Option<String>,
}

impl Display for MessageSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("ID:        {}\n", self.id))?;
        f.write_fmt(format_args!("From:      {}\n", self.sender))?;
        f.write_fmt(format_args!("To:        {}\n", self.recipients.join(", ")))?;
        f.write_fmt(format_args!("State:     {}\n", self.state))?;
        f.write_fmt(format_args!("Attempts:  {}\n", self.attempts))?;
        f.write_fmt(format_args!("Size:      {} bytes\n", self.size))?;
        f.write_fmt(format_args!(
            "Created:   {}\n",
            format_timestamp(self.created_at)
        ))?;
        f.write_fmt(format_args!(
            "Updated:   {}\n",
            format_timestamp(self.updated_at)
        ))?;
        if let Some(next_attempt) = self.next_attempt_at {
            f.write_fmt(format_args!(
                "Next attempt: {}\n",
                format_timestamp(next_attempt)
            ))?;
        }
        if let Some(ref error) = self.last_error {
            f.write_fmt(format_args!("Last error: {error}\n"))?;
        }
        Ok(())
    }
}

/// Daemon status information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Daemon version
    pub version: String,
    /// Uptime in seconds
    pub uptime_secs: u64,
    /// Total messages in the store
    pub total_messages: usize,
    /// Messages by state (display name)
    pub by_state: HashMap<String, usize>,
}

impl Display for SystemStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Version:   {}\n", self.version))?;
        f.write_fmt(format_args!("Uptime:    {}s\n", self.uptime_secs))?;
        f.write_fmt(format_args!("Messages:  {}\n", self.total_messages))?;

        let mut states: Vec<_> = self.by_state.iter().collect();
        states.sort();
        for (state, count) in states {
            f.write_fmt(format_args!("  {state}: {count}\n"))?;
        }

        Ok(())
    }
}

impl Request {
    /// Create a new request with the current protocol version
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }

    /// Check if the request version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

impl Response {
    /// Create an error response
    #[must_use]
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Error(ErrorReply {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Create a success response with no data
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Ok,
        }
    }

    /// Create a response with data
    #[must_use]
    pub fn data(data: ResponseData) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload: ResponsePayload::Data(Box::new(data)),
        }
    }

    /// Check if the response indicates success (not an error)
    #[must_use]
    pub const fn is_success(&self) -> bool {
        !matches!(self.payload, ResponsePayload::Error(_))
    }

    /// Check if the response version is compatible with the current version
    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}
