//! Broker bridge.
//!
//! The actual pub/sub broker stays outside the process: the daemon speaks
//! line-delimited JSON frames over stdin/stdout and an external broker client
//! (for example a thin `mosquitto_sub`/`mosquitto_pub` wrapper) relays them.

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc,
};

use crate::prelude::*;

/// One pub/sub message.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Frame {
    pub topic: String,
    pub payload: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retain: bool,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { topic: topic.into(), payload: payload.into(), retain: false }
    }

    pub fn retained(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self { retain: true, ..Self::new(topic, payload) }
    }
}

/// Outbound side of the bridge.
///
/// Cheap to clone; equipment holds its own handle. The enabled flag covers the
/// dry-run mode in which command frames are logged but never leave the
/// process.
#[derive(Clone)]
pub struct Publisher {
    sender: mpsc::UnboundedSender<Frame>,
    enabled: bool,
}

impl Publisher {
    pub fn channel(enabled: bool) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, enabled }, receiver)
    }

    #[must_use]
    pub fn with_enabled(&self, enabled: bool) -> Self {
        Self { sender: self.sender.clone(), enabled }
    }

    pub fn publish(&self, frame: Frame) {
        if !self.enabled {
            debug!(topic = frame.topic, payload = frame.payload, "not sending (disabled)");
            return;
        }
        trace!(topic = frame.topic, payload = frame.payload, "publishing");
        if self.sender.send(frame).is_err() {
            warn!("the outbound channel is closed");
        }
    }
}

/// Forward inbound frames from stdin into the dispatch channel.
pub async fn run_stdin_reader(sender: mpsc::UnboundedSender<Frame>) -> Result {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Frame>(&line) {
            Ok(frame) => {
                if sender.send(frame).is_err() {
                    break;
                }
            }
            Err(error) => {
                warn!(%error, line, "dropping an unreadable frame");
            }
        }
    }
    Ok(())
}

/// Drain outbound frames onto stdout, one JSON object per line.
pub async fn run_stdout_writer(mut receiver: mpsc::UnboundedReceiver<Frame>) -> Result {
    let mut stdout = tokio::io::stdout();
    while let Some(frame) = receiver.recv().await {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}
