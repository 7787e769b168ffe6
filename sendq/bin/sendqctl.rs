//! Command-line utility for managing the sendq daemon
//!
//! This tool provides operational control over the queue:
//! - Submit messages (from a file or stdin)
//! - List and inspect queued messages
//! - Force retries, remove messages, flush the queue
//! - Daemon health checks and statistics

use std::{io::Read, path::PathBuf, time::Duration};

use clap::{Parser, Subcommand, ValueEnum};
use sendq_control::{
    Command, ControlClient, DEFAULT_CONTROL_SOCKET, QueueCommand, Request, ResponseData,
    ResponsePayload, SystemCommand,
};

/// Command-line utility for managing the sendq daemon
#[derive(Parser, Debug)]
#[command(name = "sendqctl")]
#[command(about = "Manage the sendq mail queue daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue management commands
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Daemon status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// Submit a message for delivery
    Enqueue {
        /// Envelope sender (return path)
        #[arg(long)]
        from: String,

        /// Envelope recipient (repeat for multiple recipients)
        #[arg(long = "to", required = true)]
        to: Vec<String>,

        /// Read the message from this file instead of stdin
        file: Option<PathBuf>,
    },
    /// List messages in the queue
    List {
        /// Filter by state
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
    },
    /// Show one message's status
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
    /// Wait until everything currently due has been delivered or abandoned
    Flush {
        /// Give up waiting after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check if the daemon is responding
    Ping,
    /// Get daemon status and queue statistics
    Status,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum StateFilter {
    Pending,
    InFlight,
    Delivered,
    FailedPermanent,
    RetryScheduled,
}

impl StateFilter {
    const fn as_wire(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in-flight",
            Self::Delivered => "delivered",
            Self::FailedPermanent => "failed-permanent",
            Self::RetryScheduled => "retry-scheduled",
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Flush waits server-side; give the client at least as long
    let timeout = match &cli.command {
        Commands::Queue {
            action: QueueAction::Flush { timeout },
        } => Duration::from_secs(timeout.unwrap_or(86_400).saturating_add(10)),
        _ => Duration::from_secs(10),
    };

    let client = ControlClient::new(&cli.control_socket).with_timeout(timeout);

    match cli.command {
        Commands::Queue { action } => handle_queue_action(&client, action).await,
        Commands::System { action } => handle_system_action(&client, action).await,
    }
}

/// Send one command and unwrap the payload, turning protocol errors into
/// process failure.
async fn execute(client: &ControlClient, command: Command) -> anyhow::Result<ResponsePayload> {
    let response = client.send_request(Request::new(command)).await?;

    if !response.is_version_compatible() {
        anyhow::bail!("daemon speaks protocol version {}", response.version);
    }

    match response.payload {
        ResponsePayload::Error(reply) => anyhow::bail!("{reply}"),
        payload => Ok(payload),
    }
}

async fn handle_queue_action(client: &ControlClient, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Enqueue { from, to, file } => {
            let payload = read_payload(file.as_deref())?;
            if payload.is_empty() {
                anyhow::bail!("refusing to enqueue an empty message");
            }

            let payload_response = execute(
                client,
                Command::Queue(QueueCommand::Enqueue {
                    sender: from,
                    recipients: to,
                    payload,
                }),
            )
            .await?;

            match payload_response {
                ResponsePayload::Data(data) => match *data {
                    ResponseData::Enqueued { message_id } => {
                        println!("Enqueued message {message_id}");
                        Ok(())
                    }
                    other => anyhow::bail!("unexpected response: {other:?}"),
                },
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }

        QueueAction::List { state } => {
            let payload_response = execute(
                client,
                Command::Queue(QueueCommand::List {
                    state_filter: state.map(|s| s.as_wire().to_string()),
                }),
            )
            .await?;

            match payload_response {
                ResponsePayload::Data(data) => match *data {
                    ResponseData::MessageList(messages) => {
                        if messages.is_empty() {
                            println!("Queue is empty");
                        } else {
                            for message in &messages {
                                println!("{message}");
                            }
                            println!("{} message(s)", messages.len());
                        }
                        Ok(())
                    }
                    other => anyhow::bail!("unexpected response: {other:?}"),
                },
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }

        QueueAction::Status { message_id } => {
            let payload_response = execute(
                client,
                Command::Queue(QueueCommand::Status { message_id }),
            )
            .await?;

            match payload_response {
                ResponsePayload::Data(data) => match *data {
                    ResponseData::MessageStatus(summary) => {
                        print!("{summary}");
                        Ok(())
                    }
                    other => anyhow::bail!("unexpected response: {other:?}"),
                },
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }

        QueueAction::Remove { message_id } => {
            execute(
                client,
                Command::Queue(QueueCommand::Remove {
                    message_id: message_id.clone(),
                }),
            )
            .await?;
            println!("Removed message {message_id}");
            Ok(())
        }

        QueueAction::Retry { message_id } => {
            execute(
                client,
                Command::Queue(QueueCommand::Retry {
                    message_id: message_id.clone(),
                }),
            )
            .await?;
            println!("Retry scheduled for message {message_id}");
            Ok(())
        }

        QueueAction::Flush { timeout } => {
            let payload_response = execute(
                client,
                Command::Queue(QueueCommand::Flush {
                    timeout_secs: timeout,
                }),
            )
            .await?;

            match payload_response {
                ResponsePayload::Data(data) => match *data {
                    ResponseData::FlushResult { complete: true } => {
                        println!("Flush complete");
                        Ok(())
                    }
                    ResponseData::FlushResult { complete: false } => {
                        anyhow::bail!("flush timed out with messages still unsettled")
                    }
                    other => anyhow::bail!("unexpected response: {other:?}"),
                },
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
}

async fn handle_system_action(client: &ControlClient, action: SystemAction) -> anyhow::Result<()> {
    match action {
        SystemAction::Ping => {
            execute(client, Command::System(SystemCommand::Ping)).await?;
            println!("Pong");
            Ok(())
        }

        SystemAction::Status => {
            let payload_response = execute(client, Command::System(SystemCommand::Status)).await?;

            match payload_response {
                ResponsePayload::Data(data) => match *data {
                    ResponseData::SystemStatus(status) => {
                        print!("{status}");
                        Ok(())
                    }
                    other => anyhow::bail!("unexpected response: {other:?}"),
                },
                other => anyhow::bail!("unexpected response: {other:?}"),
            }
        }
    }
}

fn read_payload(file: Option<&std::path::Path>) -> anyhow::Result<Vec<u8>> {
    match file {
        Some(path) => std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display())),
        None => {
            let mut payload = Vec::new();
            std::io::stdin().read_to_end(&mut payload)?;
            Ok(payload)
        }
    }
}
