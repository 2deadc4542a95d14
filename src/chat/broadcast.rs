//! Broadcast fan-out
//!
//! Invoked exactly once per successfully appended message. Delivery happens
//! in two legs: every connection registered in this process receives the
//! message directly, and one envelope is published to NATS so sibling
//! processes can deliver to their own connections.
//!
//! The coordinator publishes in append order on the origin process. It does
//! NOT strengthen the substrate's guarantees: NATS core does not provide a
//! global FIFO across publishers, so two messages appended by different
//! processes may reach a remote process in either order. The per-connection
//! delivery gate absorbs duplicates; callers must not rely on cross-process
//! arrival order.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::recovery::RecoveryStore;
use super::registry::ConnectionRegistry;
use crate::nats::{BroadcastEnvelope, NatsClient, BROADCAST_SUBJECT};

/// One message being fanned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    pub sequence: i64,
    pub content: String,
}

/// Fan-out coordinator for appended messages.
pub struct Broadcaster {
    node_id: Uuid,
    registry: Arc<ConnectionRegistry>,
    recovery: Arc<RecoveryStore>,
    nats: Option<NatsClient>,
}

impl Broadcaster {
    pub fn new(
        node_id: Uuid,
        registry: Arc<ConnectionRegistry>,
        recovery: Arc<RecoveryStore>,
        nats: Option<NatsClient>,
    ) -> Self {
        Self {
            node_id,
            registry,
            recovery,
            nats,
        }
    }

    /// Fan a freshly appended message out to all connections everywhere.
    ///
    /// Local delivery and backlog recording always happen; the cross-process
    /// publish is skipped when no NATS client is configured (single-process
    /// mode) and a publish failure is logged and contained, never propagated
    /// into the append path.
    pub async fn publish(&self, sequence: i64, content: &str) {
        let broadcast = Broadcast {
            sequence,
            content: content.to_string(),
        };

        let delivered = self.registry.broadcast(&broadcast);
        self.recovery.record(broadcast.clone());
        debug!(sequence, delivered, "Broadcast delivered locally");

        if let Some(ref nats) = self.nats {
            let envelope = BroadcastEnvelope::new(self.node_id, sequence, &broadcast.content);
            match envelope.to_bytes() {
                Ok(payload) => {
                    if let Err(e) = nats.publish(BROADCAST_SUBJECT, payload).await {
                        warn!(sequence, error = %e, "Cross-process broadcast publish failed");
                    }
                }
                Err(e) => {
                    error!(sequence, error = %e, "Failed to serialize broadcast envelope");
                }
            }
        }
    }
}

/// Spawn the subscriber task that delivers broadcasts published by sibling
/// processes to this process's connections.
///
/// Envelopes originating from this node are skipped; the origin process
/// already delivered them locally before publishing.
pub fn spawn_subscriber(
    nats: NatsClient,
    node_id: Uuid,
    registry: Arc<ConnectionRegistry>,
    recovery: Arc<RecoveryStore>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscriber = match nats.subscribe(BROADCAST_SUBJECT).await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Broadcast subscription failed; cross-process delivery disabled");
                return;
            }
        };

        info!(subject = BROADCAST_SUBJECT, "Listening for cross-process broadcasts");

        while let Some(msg) = subscriber.next().await {
            let envelope = match BroadcastEnvelope::from_bytes(&msg.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(error = %e, "Failed to parse broadcast envelope");
                    continue;
                }
            };

            if envelope.origin == node_id {
                continue;
            }

            let broadcast = Broadcast {
                sequence: envelope.sequence,
                content: envelope.content,
            };
            let delivered = registry.broadcast(&broadcast);
            recovery.record(broadcast);
            debug!(
                sequence = envelope.sequence,
                origin = %envelope.origin,
                delivered,
                "Remote broadcast delivered"
            );
        }

        warn!("Broadcast subscription closed");
    })
}
