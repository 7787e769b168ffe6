//! External transport invocation
//!
//! The transport is the configured local command (an MTA wrapper such as
//! `msmtp`) that performs the actual network delivery. The engine only
//! needs to invoke it once per attempt and observe its exit status and
//! stderr; everything else — retry, scheduling, bookkeeping — lives
//! elsewhere.

use std::{collections::VecDeque, io, process::Stdio, sync::Mutex, time::Duration};

use async_trait::async_trait;
use sendq_common::envelope::Envelope;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

/// Cap on captured stderr carried into diagnostics.
const MAX_DIAGNOSTIC_BYTES: usize = 4096;

/// Result of one delivery attempt, as a closed variant so the retry
/// decision table stays exhaustive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The transport accepted the message.
    Success,
    /// The attempt failed in a way that may succeed later (network down,
    /// remote busy). Eligible for retry.
    TransientFailure(String),
    /// The attempt failed in a way retrying cannot fix (local
    /// misconfiguration, rejected message). Never retried.
    PermanentFailure(String),
}

/// Exit status and diagnostics captured from one transport invocation.
///
/// `code` is `None` when the process was terminated by a signal (or killed
/// by the invocation timeout).
#[derive(Debug, Clone)]
pub struct TransportStatus {
    pub code: Option<i32>,
    pub diagnostic: String,
}

/// One-shot invocation of the external transport.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Invoke the transport exactly once for the given envelope and
    /// payload. May block for the duration of the external command.
    ///
    /// # Errors
    /// Returns an error if the command could not be spawned or its status
    /// could not be collected. Non-zero exits are not errors; they are
    /// reported through [`TransportStatus`].
    async fn invoke(&self, envelope: &Envelope, payload: &[u8]) -> io::Result<TransportStatus>;
}

/// Configuration for the transport command
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// The command to run
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments passed to the command. `{sender}` is replaced with the
    /// envelope sender; a literal `{recipients}` argument is expanded in
    /// place to the recipient list. When no `{recipients}` placeholder is
    /// present, recipients are appended after the configured arguments.
    ///
    /// Default: `["-f", "{sender}", "--"]`
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// How long one invocation may run before it is killed and counted as
    /// a transient failure (in seconds)
    ///
    /// Default: 300 seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Exit codes that indicate a transient failure
    ///
    /// Exit-code conventions vary between MTA wrappers, so the mapping is
    /// configurable rather than hardcoded. The default covers sysexits
    /// `EX_TEMPFAIL` (75), which `msmtp` and sendmail-compatible wrappers
    /// use for "try again later". Exit 0 is always success; any other code
    /// not listed here is a permanent failure.
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,
}

fn default_command() -> String {
    "msmtp".to_string()
}

fn default_args() -> Vec<String> {
    vec!["-f".to_string(), "{sender}".to_string(), "--".to_string()]
}

const fn default_timeout() -> u64 {
    300
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![75]
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            timeout_secs: default_timeout(),
            transient_exit_codes: default_transient_exit_codes(),
        }
    }
}

/// Transport implementation that spawns the configured local command,
/// writes the payload to its stdin, and captures its exit status and
/// stderr.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    config: TransportConfig,
}

impl CommandTransport {
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

/// Expand the configured argument template for one envelope.
fn build_argv(args: &[String], envelope: &Envelope) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + envelope.recipients.len());
    let mut recipients_spliced = false;

    for arg in args {
        if arg == "{recipients}" {
            argv.extend(envelope.recipients.iter().cloned());
            recipients_spliced = true;
        } else {
            argv.push(arg.replace("{sender}", &envelope.sender));
        }
    }

    if !recipients_spliced {
        argv.extend(envelope.recipients.iter().cloned());
    }

    argv
}

fn truncated_diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();

    if trimmed.len() <= MAX_DIAGNOSTIC_BYTES {
        trimmed.to_string()
    } else {
        let mut end = MAX_DIAGNOSTIC_BYTES;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        trimmed[..end].to_string()
    }
}

#[async_trait]
impl Transport for CommandTransport {
    async fn invoke(&self, envelope: &Envelope, payload: &[u8]) -> io::Result<TransportStatus> {
        let argv = build_argv(&self.config.args, envelope);

        debug!(
            command = %self.config.command,
            recipients = envelope.recipients.len(),
            "invoking transport"
        );

        let mut child = Command::new(&self.config.command)
            .args(&argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            // The command may exit before consuming all of its input; its
            // exit status is still what decides the outcome.
            if let Err(e) = stdin.write_all(payload).await {
                debug!(error = %e, "transport closed stdin early");
            }
        }

        let wait = child.wait_with_output();
        match tokio::time::timeout(Duration::from_secs(self.config.timeout_secs), wait).await {
            Ok(output) => {
                let output = output?;
                Ok(TransportStatus {
                    code: output.status.code(),
                    diagnostic: truncated_diagnostic(&output.stderr),
                })
            }
            // kill_on_drop reaps the child when the wait future is dropped
            Err(_elapsed) => Ok(TransportStatus {
                code: None,
                diagnostic: format!(
                    "transport timed out after {}s",
                    self.config.timeout_secs
                ),
            }),
        }
    }
}

/// Scripted transport for tests: pops one preconfigured result per
/// invocation and counts invocations. An exhausted script reports success.
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<io::Result<TransportStatus>>>,
    invocations: std::sync::atomic::AtomicUsize,
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an exit status for a future invocation
    pub fn push_status(&self, code: Option<i32>, diagnostic: &str) {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Ok(TransportStatus {
                code,
                diagnostic: diagnostic.to_string(),
            }));
    }

    /// Queue an invocation error (e.g. a missing binary) for a future
    /// invocation
    pub fn push_error(&self, kind: io::ErrorKind, message: &str) {
        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(Err(io::Error::new(kind, message.to_string())));
    }

    /// Number of times `invoke` has been called
    pub fn invocations(&self) -> usize {
        self.invocations.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(&self, _envelope: &Envelope, _payload: &[u8]) -> io::Result<TransportStatus> {
        self.invocations
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        self.script
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                Ok(TransportStatus {
                    code: Some(0),
                    diagnostic: String::new(),
                })
            })
    }
}
