//! Control handler for the sendq daemon
//!
//! Bridges the control protocol onto the queue engine's operations.

use std::{sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use sendq_common::envelope::Envelope;
use sendq_control::{
    Command, CommandHandler, ErrorKind, MessageSummary, QueueCommand, Request, Response,
    ResponseData, SystemCommand, SystemStatus,
};
use sendq_delivery::{EngineError, FlushOutcome, QueueEngine};
use sendq_store::{Message, MessageId, MessageState};

/// Handler for control commands
pub struct ControlHandler {
    engine: Arc<QueueEngine>,
    /// Daemon start time for uptime reporting
    start_time: Instant,
}

impl ControlHandler {
    /// Create a new control handler
    #[must_use]
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self {
            engine,
            start_time: Instant::now(),
        }
    }
}

#[async_trait]
impl CommandHandler for ControlHandler {
    async fn handle_request(&self, request: Request) -> sendq_control::Result<Response> {
        if !request.is_version_compatible() {
            return Ok(Response::error(
                ErrorKind::Internal,
                format!("unsupported protocol version {}", request.version),
            ));
        }

        Ok(match request.command {
            Command::Queue(command) => self.handle_queue_command(command).await,
            Command::System(command) => self.handle_system_command(command).await,
        })
    }
}

impl ControlHandler {
    async fn handle_queue_command(&self, command: QueueCommand) -> Response {
        match command {
            QueueCommand::Enqueue {
                sender,
                recipients,
                payload,
            } => {
                let envelope = Envelope::new(sender, recipients);
                match self.engine.enqueue(envelope, Arc::from(payload)).await {
                    Ok(id) => Response::data(ResponseData::Enqueued {
                        message_id: id.to_string(),
                    }),
                    Err(e) => error_response(&e),
                }
            }

            QueueCommand::List { state_filter } => {
                let filter = match state_filter.as_deref().map(str::parse::<MessageState>) {
                    None => None,
                    Some(Ok(state)) => Some(state),
                    Some(Err(e)) => return Response::error(ErrorKind::InvalidState, e),
                };

                match self.engine.list(filter).await {
                    Ok(messages) => Response::data(ResponseData::MessageList(
                        messages.iter().map(summarize).collect(),
                    )),
                    Err(e) => error_response(&e),
                }
            }

            QueueCommand::Status { message_id } => match parse_id(&message_id) {
                Ok(id) => match self.engine.status(&id).await {
                    Ok(message) => {
                        Response::data(ResponseData::MessageStatus(summarize(&message)))
                    }
                    Err(e) => error_response(&e),
                },
                Err(response) => response,
            },

            QueueCommand::Remove { message_id } => match parse_id(&message_id) {
                Ok(id) => match self.engine.remove(&id).await {
                    Ok(()) => Response::ok(),
                    Err(e) => error_response(&e),
                },
                Err(response) => response,
            },

            QueueCommand::Retry { message_id } => match parse_id(&message_id) {
                Ok(id) => match self.engine.retry_now(&id).await {
                    Ok(()) => Response::ok(),
                    Err(e) => error_response(&e),
                },
                Err(response) => response,
            },

            QueueCommand::Flush { timeout_secs } => {
                match self
                    .engine
                    .flush(timeout_secs.map(Duration::from_secs))
                    .await
                {
                    Ok(outcome) => Response::data(ResponseData::FlushResult {
                        complete: outcome == FlushOutcome::Complete,
                    }),
                    Err(e) => error_response(&e),
                }
            }
        }
    }

    async fn handle_system_command(&self, command: SystemCommand) -> Response {
        match command {
            SystemCommand::Ping => Response::ok(),

            SystemCommand::Status => match self.engine.list(None).await {
                Ok(messages) => {
                    let mut by_state = std::collections::HashMap::new();
                    for message in &messages {
                        *by_state.entry(message.state.to_string()).or_insert(0) += 1;
                    }

                    Response::data(ResponseData::SystemStatus(SystemStatus {
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        uptime_secs: self.start_time.elapsed().as_secs(),
                        total_messages: messages.len(),
                        by_state,
                    }))
                }
                Err(e) => error_response(&e),
            },
        }
    }
}

/// Parse a client-supplied message ID; an unparseable ID can never name a
/// stored message, so it reports `NotFound`.
fn parse_id(message_id: &str) -> Result<MessageId, Response> {
    message_id.parse().map_err(|_| {
        Response::error(
            ErrorKind::NotFound,
            format!("not a valid message id: {message_id}"),
        )
    })
}

fn error_response(error: &EngineError) -> Response {
    let kind = match error {
        EngineError::InvalidEnvelope(_) => ErrorKind::InvalidEnvelope,
        EngineError::NotFound(_) => ErrorKind::NotFound,
        EngineError::Conflict(_) => ErrorKind::Conflict,
        EngineError::InvalidState(_) => ErrorKind::InvalidState,
        EngineError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
    };

    Response::error(kind, error.to_string())
}

fn summarize(message: &Message) -> MessageSummary {
    MessageSummary {
        id: message.id.to_string(),
        sender: message.envelope.sender.clone(),
        recipients: message.envelope.recipients.clone(),
        state: message.state.to_string(),
        attempts: message.attempt_count,
        size: message.payload_size,
        created_at: message.created_at,
        updated_at: message.updated_at,
        next_attempt_at: message.next_attempt_at,
        last_error: message.last_error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_map_onto_the_protocol() {
        let id = MessageId::generate();

        let cases = [
            (
                EngineError::InvalidEnvelope("no sender".to_string()),
                ErrorKind::InvalidEnvelope,
            ),
            (EngineError::NotFound(id), ErrorKind::NotFound),
            (
                EngineError::Conflict("raced".to_string()),
                ErrorKind::Conflict,
            ),
            (
                EngineError::InvalidState("in flight".to_string()),
                ErrorKind::InvalidState,
            ),
            (
                EngineError::StorageUnavailable("disk gone".to_string()),
                ErrorKind::StorageUnavailable,
            ),
        ];

        for (error, expected) in cases {
            match error_response(&error).payload {
                sendq_control::ResponsePayload::Error(reply) => {
                    assert_eq!(reply.kind, expected);
                }
                other => panic!("expected error payload, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_summarize_carries_every_field() {
        let mut message = Message::new(
            Envelope::new("a@x", vec!["b@y".to_string()]),
            Arc::from(b"hello".as_slice()),
        );
        message.state = MessageState::RetryScheduled;
        message.attempt_count = 4;
        message.next_attempt_at = Some(1_700_000_000);
        message.last_error = Some("greylisted".to_string());

        let summary = summarize(&message);
        assert_eq!(summary.id, message.id.to_string());
        assert_eq!(summary.sender, "a@x");
        assert_eq!(summary.recipients, vec!["b@y".to_string()]);
        assert_eq!(summary.state, "retry-scheduled");
        assert_eq!(summary.attempts, 4);
        assert_eq!(summary.size, 5);
        assert_eq!(summary.next_attempt_at, Some(1_700_000_000));
        assert_eq!(summary.last_error.as_deref(), Some("greylisted"));
    }
}
