//! Daemon wiring and lifecycle
//!
//! Builds the store, engine, and control server from one configuration
//! record and runs them until a termination signal arrives.

use std::{sync::Arc, sync::LazyLock, time::Duration};

use sendq_common::{Signal, internal, logging};
use sendq_control::ControlServer;
use sendq_delivery::{
    CommandTransport, EngineConfig, Executor, QueueEngine, RetryPolicy, Transport, TransportConfig,
};
use sendq_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::error;

use crate::handler::ControlHandler;

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

fn default_socket_path() -> String {
    sendq_control::DEFAULT_CONTROL_SOCKET.to_string()
}

const fn default_sweep_interval() -> u64 {
    3600
}

/// Retention policy for terminal messages
///
/// Delivered and permanently failed messages stay in the store until an
/// operator removes them, unless a purge horizon is configured here. The
/// default never purges.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetentionPolicy {
    /// Purge terminal messages whose last update is older than this many
    /// seconds (omit to keep them until removed explicitly)
    #[serde(default)]
    pub purge_after_secs: Option<u64>,

    /// How often to run the purge sweep (in seconds)
    ///
    /// Default: 3600 seconds (1 hour)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            purge_after_secs: None,
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Top-level daemon configuration
///
/// Deserialized from the RON configuration file; every section has
/// defaults, so an empty config `Sendq()` runs a file-backed queue
/// delivering through `msmtp`.
#[derive(Debug, Deserialize)]
pub struct Sendq {
    /// Path of the control socket
    #[serde(default = "default_socket_path")]
    socket_path: String,

    /// Message store backend
    #[serde(default)]
    store: StoreConfig,

    /// Worker loop configuration
    #[serde(default)]
    engine: EngineConfig,

    /// Retry/backoff policy
    #[serde(default)]
    retry: RetryPolicy,

    /// Transport command configuration
    #[serde(default)]
    transport: TransportConfig,

    /// Retention policy for terminal messages
    #[serde(default)]
    retention: RetentionPolicy,
}

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

/// Periodically purge terminal messages past the configured horizon.
///
/// With no horizon configured this only waits for shutdown.
async fn run_retention(
    engine: &Arc<QueueEngine>,
    policy: RetentionPolicy,
    mut shutdown: broadcast::Receiver<Signal>,
) -> anyhow::Result<()> {
    let Some(purge_after) = policy.purge_after_secs else {
        let _ = shutdown.recv().await;
        return Ok(());
    };

    let mut timer =
        tokio::time::interval(Duration::from_secs(policy.sweep_interval_secs.max(1)));
    // Skip the first tick to avoid an immediate sweep
    timer.tick().await;

    loop {
        tokio::select! {
            _ = timer.tick() => {
                if let Err(e) = engine.purge_terminal(Duration::from_secs(purge_after)).await {
                    error!("Retention sweep failed: {e}");
                }
            }
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

impl Sendq {
    /// Run the daemon, and everything it controls
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be initialised, the control
    /// socket cannot be bound, or the recovery pass fails.
    pub async fn run(self) -> anyhow::Result<()> {
        logging::init();

        let store = self.store.into_backing_store()?;

        let transient_exit_codes = self.transport.transient_exit_codes.clone();
        let transport: Arc<dyn Transport> = Arc::new(CommandTransport::new(self.transport));
        let executor = Executor::new(transport, transient_exit_codes);

        let engine = Arc::new(QueueEngine::new(store, executor, self.retry, self.engine));
        let handler = Arc::new(ControlHandler::new(Arc::clone(&engine)));
        let server = ControlServer::new(self.socket_path, handler)?;

        internal!("sendq daemon running");

        let ret = tokio::select! {
            r = engine.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(Into::into)
            }
            r = server.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                r.map_err(Into::into)
            }
            r = run_retention(&engine, self.retention, SHUTDOWN_BROADCAST.subscribe()) => {
                r
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
