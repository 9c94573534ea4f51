// Worker control channel
// Workers report to the supervisor with one JSON object per line on stdout

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::worker::ExitReason;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Listener joined, accepting connections
    Ready { pid: u32 },
    Heartbeat { served: u64, active: usize },
    /// Stopped accepting, draining in-flight connections
    Exiting { reason: ExitReason },
}

impl ControlMessage {
    pub fn encode(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

/// Cloneable sender side of the control channel
#[derive(Debug, Clone, Default)]
pub struct ControlSender(Option<mpsc::UnboundedSender<ControlMessage>>);

impl ControlSender {
    /// A sender that drops every message, for workers nobody supervises
    pub const fn detached() -> Self {
        Self(None)
    }

    pub fn send(&self, message: ControlMessage) {
        if let Some(tx) = &self.0 {
            if tx.send(message).is_err() {
                tracing::debug!("control channel closed");
            }
        }
    }
}

/// Start the stdout writer task on the current `LocalSet`.
///
/// The task ends once every `ControlSender` clone is dropped and the queued
/// messages are flushed.
pub fn stdout_channel() -> (ControlSender, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlMessage>();
    let writer = tokio::task::spawn_local(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let line = match message.encode() {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("failed to encode control message {message:?}: {e}");
                    continue;
                }
            };
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                // Supervisor is gone; nothing left to report to
                tracing::debug!("control channel write failed: {e}");
                break;
            }
            if let Err(e) = stdout.flush().await {
                tracing::debug!("control channel flush failed: {e}");
                break;
            }
        }
    });
    (ControlSender(Some(tx)), writer)
}
