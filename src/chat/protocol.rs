//! Wire events for the chat WebSocket
//!
//! All frames are JSON text messages tagged with an `event` field. Clients
//! submit messages and receive broadcasts, acknowledgments, and the session
//! announcement sent once during connection setup.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    /// Submit a chat message.
    #[serde(rename = "chat.message")]
    Message {
        /// Opaque text payload.
        content: String,

        /// Idempotency token for retry deduplication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,

        /// Client-chosen acknowledgment id, echoed back in `chat.ack`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
}

impl ClientEvent {
    /// Parse a client frame from JSON text.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Frames sent by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    /// A chat message delivered by broadcast or replay.
    #[serde(rename = "chat.message")]
    Message { content: String, sequence: i64 },

    /// Session announcement, sent once after connection setup. Clients keep
    /// the session id and present it on reconnect to attempt resumption.
    #[serde(rename = "chat.session")]
    Session { session: Uuid, recovered: bool },

    /// Acknowledgment of one submission.
    #[serde(rename = "chat.ack")]
    Ack {
        ack: u64,
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence: Option<i64>,
    },
}

/// Outcome reported in a `chat.ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    /// Message appended and broadcast.
    Ok,
    /// Token already recorded; the earlier append stands.
    Duplicate,
    /// The append failed; the message was not recorded.
    Error,
}

impl ServerEvent {
    /// Serialize to JSON text for the wire.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_message_with_token_and_ack() {
        let event = ClientEvent::parse(
            r#"{"event":"chat.message","content":"hi","token":"t1","ack":7}"#,
        )
        .unwrap();

        let ClientEvent::Message { content, token, ack } = event;
        assert_eq!(content, "hi");
        assert_eq!(token.as_deref(), Some("t1"));
        assert_eq!(ack, Some(7));
    }

    #[test]
    fn parse_message_bare() {
        let event = ClientEvent::parse(r#"{"event":"chat.message","content":"hi"}"#).unwrap();
        let ClientEvent::Message { token, ack, .. } = event;
        assert!(token.is_none());
        assert!(ack.is_none());
    }

    #[test]
    fn parse_rejects_unknown_event() {
        assert!(ClientEvent::parse(r#"{"event":"chat.unknown","content":"x"}"#).is_err());
    }

    #[test]
    fn ack_omits_sequence_when_absent() {
        let text = ServerEvent::Ack {
            ack: 3,
            status: AckStatus::Error,
            sequence: None,
        }
        .to_text()
        .unwrap();

        assert_eq!(text, r#"{"event":"chat.ack","ack":3,"status":"error"}"#);
    }

    #[test]
    fn message_event_roundtrip() {
        let text = ServerEvent::Message {
            content: "hello".into(),
            sequence: 42,
        }
        .to_text()
        .unwrap();

        let parsed: ServerEvent = serde_json::from_str(&text).unwrap();
        match parsed {
            ServerEvent::Message { content, sequence } => {
                assert_eq!(content, "hello");
                assert_eq!(sequence, 42);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
