use serde::{Deserialize, Serialize};

/// Sender address plus ordered recipient list for a queued message,
/// independent of the message body.
///
/// Addresses are carried as opaque strings. The daemon never parses or
/// validates address syntax beyond requiring them to be non-empty; the
/// transport command is responsible for interpreting them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The envelope sender (return path)
    pub sender: String,
    /// The envelope recipients, in submission order
    pub recipients: Vec<String>,
}

impl Envelope {
    /// Create a new envelope
    #[must_use]
    pub fn new(sender: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            sender: sender.into(),
            recipients,
        }
    }
}

impl std::fmt::Display for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.sender, self.recipients.join(", "))
    }
}
