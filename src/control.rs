//! Control channel: commands the host page sends to the worker.
//!
//! Wire format in: `{"type": "SKIP_WAITING" | "UPDATE_CACHE" | "CLEAR_CACHE",
//! "payload": {"urls": [...]}}`. Wire format out: `{"success": bool,
//! "error": "..."}`. Every command gets exactly one reply.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Error;

/// A control message as it arrives on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// `SKIP_WAITING`, `UPDATE_CACHE` or `CLEAR_CACHE`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Only meaningful for `UPDATE_CACHE`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<UpdatePayload>,
}

/// Payload of `UPDATE_CACHE`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePayload {
    /// Site-relative paths or absolute URLs.
    #[serde(default)]
    pub urls: Vec<String>,
}

/// A validated control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Activate a waiting update now.
    SkipWaiting,
    /// Fetch and store these URLs in the critical partition, best effort.
    UpdateCache { urls: Vec<String> },
    /// Delete every partition belonging to the site.
    ClearCache,
}

impl ControlMessage {
    /// Wire name of the command.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SkipWaiting => "SKIP_WAITING",
            Self::UpdateCache { .. } => "UPDATE_CACHE",
            Self::ClearCache => "CLEAR_CACHE",
        }
    }
}

impl TryFrom<WireMessage> for ControlMessage {
    type Error = Error;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        match wire.kind.as_str() {
            "SKIP_WAITING" => Ok(Self::SkipWaiting),
            "CLEAR_CACHE" => Ok(Self::ClearCache),
            "UPDATE_CACHE" => wire
                .payload
                .map(|p| Self::UpdateCache { urls: p.urls })
                .ok_or_else(|| Error::Control("UPDATE_CACHE requires a payload".to_string())),
            other => Err(Error::Control(format!("unknown message type {other:?}"))),
        }
    }
}

impl From<ControlMessage> for WireMessage {
    fn from(message: ControlMessage) -> Self {
        let kind = message.kind().to_string();
        let payload = match message {
            ControlMessage::UpdateCache { urls } => Some(UpdatePayload { urls }),
            ControlMessage::SkipWaiting | ControlMessage::ClearCache => None,
        };
        Self { kind, payload }
    }
}

/// Reply to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    /// Set only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlReply {
    #[must_use]
    pub const fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// One-shot reply channel handed to the message handler.
///
/// The port replies exactly once: explicitly through [`send`](Self::send) or
/// [`complete`](Self::complete), or with a failure reply when dropped
/// unanswered, so the host page never waits forever.
#[derive(Debug)]
pub struct ReplyPort {
    tx: Option<oneshot::Sender<ControlReply>>,
}

impl ReplyPort {
    /// Creates a port and the receiver the host page awaits.
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<ControlReply>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sends the reply. A receiver that already went away is ignored.
    pub fn send(mut self, reply: ControlReply) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(reply);
        }
    }

    /// Replies with success or the error's message.
    pub fn complete(self, result: crate::Result<()>) {
        match result {
            Ok(()) => self.send(ControlReply::ok()),
            Err(e) => self.send(ControlReply::failed(e)),
        }
    }
}

impl Drop for ReplyPort {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(ControlReply::failed("handler finished without replying"));
        }
    }
}
