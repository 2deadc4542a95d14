//! Live connection registry
//!
//! Tracks every connection this process currently serves and owns the
//! per-connection delivery gate that keeps backfill and live broadcasts from
//! racing each other.
//!
//! A connection starts in the `Replaying` state: broadcasts that arrive while
//! its backfill is still streaming are buffered instead of sent. When the
//! backfill finishes, buffered broadcasts newer than the last replayed
//! sequence are flushed in order and the gate becomes `Live`. A live gate
//! enforces strictly increasing sequences, so a message can never reach one
//! connection twice or out of order.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::broadcast::Broadcast;
use super::protocol::ServerEvent;
use crate::store::Message;

/// Delivery state of one connection.
enum DeliveryGate {
    /// Backfill in progress; broadcasts are buffered until it completes.
    Replaying { pending: Vec<Broadcast> },
    /// Normal operation; only sequences above `last_sequence` pass.
    Live { last_sequence: i64 },
}

/// Handle to one live connection's outbound channel.
///
/// Events pushed here are drained by the connection's writer task, which owns
/// the WebSocket sink.
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
    gate: Mutex<DeliveryGate>,
}

impl ConnectionHandle {
    /// Create a handle whose broadcasts are gated until `finish_replay`.
    pub fn replaying(id: Uuid, tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            id,
            tx,
            gate: Mutex::new(DeliveryGate::Replaying {
                pending: Vec::new(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver a broadcast, subject to the gate. Returns false if the
    /// connection is gone.
    pub fn deliver(&self, broadcast: &Broadcast) -> bool {
        let mut gate = self.gate.lock().expect("gate mutex poisoned");
        match &mut *gate {
            DeliveryGate::Replaying { pending } => {
                pending.push(broadcast.clone());
                true
            }
            DeliveryGate::Live { last_sequence } => {
                if broadcast.sequence <= *last_sequence {
                    // Already delivered via backfill or an earlier publish
                    return true;
                }
                *last_sequence = broadcast.sequence;
                self.tx
                    .send(ServerEvent::Message {
                        content: broadcast.content.clone(),
                        sequence: broadcast.sequence,
                    })
                    .is_ok()
            }
        }
    }

    /// Send one backfilled message, bypassing the gate. The caller is the
    /// replay path and is itself strictly ordered.
    pub fn send_replayed(&self, message: &Message) -> bool {
        self.tx
            .send(ServerEvent::Message {
                content: message.content.clone(),
                sequence: message.sequence,
            })
            .is_ok()
    }

    /// Close the gate: flush broadcasts buffered during backfill that the
    /// backfill did not already cover, then go live.
    pub fn finish_replay(&self, last_replayed: i64) {
        let mut gate = self.gate.lock().expect("gate mutex poisoned");
        let mut pending = match &mut *gate {
            DeliveryGate::Replaying { pending } => std::mem::take(pending),
            DeliveryGate::Live { .. } => return,
        };

        pending.sort_by_key(|b| b.sequence);

        let mut last_sequence = last_replayed;
        for broadcast in pending {
            if broadcast.sequence <= last_sequence {
                continue;
            }
            last_sequence = broadcast.sequence;
            let _ = self.tx.send(ServerEvent::Message {
                content: broadcast.content.clone(),
                sequence: broadcast.sequence,
            });
        }

        *gate = DeliveryGate::Live { last_sequence };
    }

    /// Highest sequence delivered to this connection, once live.
    pub fn last_sequence(&self) -> Option<i64> {
        match &*self.gate.lock().expect("gate mutex poisoned") {
            DeliveryGate::Live { last_sequence } => Some(*last_sequence),
            DeliveryGate::Replaying { .. } => None,
        }
    }

    /// Send a non-broadcast event (ack, session announcement). Returns false
    /// if the connection is gone.
    pub fn send_event(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Registry of live connections in this process.
///
/// Thread-safe; the broadcast path iterates it without holding any global
/// lock.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for broadcast delivery.
    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        let id = handle.id();
        self.connections.insert(id, handle);
        debug!(connection = %id, count = self.connections.len(), "Connection registered");
    }

    /// Remove a connection.
    pub fn remove(&self, id: &Uuid) {
        if self.connections.remove(id).is_some() {
            debug!(connection = %id, count = self.connections.len(), "Connection removed");
        }
    }

    /// Deliver a broadcast to every registered connection. Returns how many
    /// connections accepted it.
    pub fn broadcast(&self, broadcast: &Broadcast) -> usize {
        let mut delivered = 0;
        for entry in self.connections.iter() {
            if entry.value().deliver(broadcast) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle() -> (
        Arc<ConnectionHandle>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ConnectionHandle::replaying(Uuid::new_v4(), tx)),
            rx,
        )
    }

    fn broadcast(sequence: i64) -> Broadcast {
        Broadcast {
            sequence,
            content: format!("m{}", sequence),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<i64> {
        let mut sequences = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Message { sequence, .. } = event {
                sequences.push(sequence);
            }
        }
        sequences
    }

    #[test]
    fn broadcasts_buffer_until_replay_finishes() {
        let (handle, mut rx) = make_handle();

        handle.deliver(&broadcast(7));
        handle.deliver(&broadcast(8));
        assert!(drain(&mut rx).is_empty());

        handle.finish_replay(6);
        assert_eq!(drain(&mut rx), vec![7, 8]);
        assert_eq!(handle.last_sequence(), Some(8));
    }

    #[test]
    fn flush_drops_broadcasts_the_replay_covered() {
        let (handle, mut rx) = make_handle();

        // 7 arrived as a live broadcast while the backfill also read it
        handle.deliver(&broadcast(7));
        handle.deliver(&broadcast(9));
        handle.deliver(&broadcast(8));

        handle.finish_replay(7);
        assert_eq!(drain(&mut rx), vec![8, 9]);
    }

    #[test]
    fn live_gate_is_monotonic() {
        let (handle, mut rx) = make_handle();
        handle.finish_replay(0);

        assert!(handle.deliver(&broadcast(1)));
        assert!(handle.deliver(&broadcast(2)));
        // Duplicate and stale deliveries are absorbed
        assert!(handle.deliver(&broadcast(2)));
        assert!(handle.deliver(&broadcast(1)));
        assert!(handle.deliver(&broadcast(3)));

        assert_eq!(drain(&mut rx), vec![1, 2, 3]);
        assert_eq!(handle.last_sequence(), Some(3));
    }

    #[test]
    fn finish_replay_is_idempotent() {
        let (handle, mut rx) = make_handle();
        handle.finish_replay(4);
        handle.deliver(&broadcast(5));
        // A second call must not reset the watermark
        handle.finish_replay(0);
        handle.deliver(&broadcast(5));

        assert_eq!(drain(&mut rx), vec![5]);
    }

    #[test]
    fn registry_fans_out_to_all_connections() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = make_handle();
        let (b, mut rx_b) = make_handle();
        a.finish_replay(0);
        b.finish_replay(0);

        registry.register(Arc::clone(&a));
        registry.register(Arc::clone(&b));
        assert_eq!(registry.connection_count(), 2);

        registry.broadcast(&broadcast(1));
        assert_eq!(drain(&mut rx_a), vec![1]);
        assert_eq!(drain(&mut rx_b), vec![1]);

        registry.remove(&a.id());
        registry.broadcast(&broadcast(2));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b), vec![2]);
    }
}
