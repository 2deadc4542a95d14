//! NATS message types for cross-process broadcast
//!
//! One envelope per successfully appended message, published by the origin
//! process and delivered by every sibling's subscriber task.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subject all broadcast envelopes are published on
pub const BROADCAST_SUBJECT: &str = "CHAT.BROADCAST";

/// A broadcast crossing the process boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    /// Node that accepted the append. Subscribers skip their own envelopes;
    /// the origin already delivered locally before publishing.
    pub origin: Uuid,

    /// Sequence assigned by the message log
    pub sequence: i64,

    /// Opaque message payload
    pub content: String,
}

impl BroadcastEnvelope {
    /// Create an envelope for a freshly appended message
    pub fn new(origin: Uuid, sequence: i64, content: &str) -> Self {
        Self {
            origin,
            sequence,
            content: content.to_string(),
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<bytes::Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Into::into)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let origin = Uuid::new_v4();
        let original = BroadcastEnvelope::new(origin, 42, "hello");

        let bytes = original.to_bytes().unwrap();
        let decoded = BroadcastEnvelope::from_bytes(&bytes).unwrap();

        assert_eq!(decoded.origin, origin);
        assert_eq!(decoded.sequence, 42);
        assert_eq!(decoded.content, "hello");
    }

    #[test]
    fn subject_is_stable() {
        // Sibling processes of mixed versions must agree on the subject
        assert_eq!(BROADCAST_SUBJECT, "CHAT.BROADCAST");
    }
}
