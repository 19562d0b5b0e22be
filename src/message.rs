//! Chat Messages
//!
//! The logical message relayed between users and its JSON wire forms.
//!
//! Clients send `{"to": <user id>, "content": "..."}`. The relay never reads a
//! sender from the wire; it stamps the authenticated session's identity and
//! the arrival time before the message goes anywhere.

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Stable user identifier supplied by the authentication layer.
pub type UserId = i64;

/// A relayed message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Authenticated author. Serialized as `from`.
    #[serde(rename = "from")]
    pub sender: UserId,
    /// Serialized as `to`.
    #[serde(rename = "to")]
    pub recipient: UserId,
    pub content: String,
    /// Arrival time at the relay (Unix seconds).
    pub sent_at: u64,
}

impl ChatMessage {
    /// Builds a message from a decoded frame, forcing the sender.
    pub fn from_frame(sender: UserId, frame: InboundFrame, sent_at: u64) -> Self {
        ChatMessage {
            sender,
            recipient: frame.to,
            content: frame.content,
            sent_at,
        }
    }

    /// Encodes the outbound JSON form (also the offline queue payload).
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a payload produced by [`ChatMessage::to_json`].
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

/// What a client is allowed to say. Any other field, including a forged
/// sender, is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    pub to: UserId,
    pub content: String,
}

/// Decodes an inbound frame from raw JSON bytes.
pub fn decode_frame(data: &[u8]) -> Result<InboundFrame, DecodeError> {
    Ok(serde_json::from_slice(data)?)
}
