//! Durable replay for reconnecting clients
//!
//! Streams every message with sequence greater than the client's declared
//! offset to one connection, in order, reading the log in bounded batches so
//! a long gap never materializes in memory at once.
//!
//! The loop keeps fetching until a batch comes back empty, so everything
//! stored when the replay began is covered. Messages appended mid-replay may
//! ride along or arrive via the normal broadcast path instead; the
//! connection's delivery gate deduplicates either way.

use tracing::{debug, error};

use super::registry::ConnectionHandle;
use crate::store::MessageStore;

/// Replay all stored messages after `since_offset` to one connection.
///
/// Returns the highest sequence delivered (or `since_offset` when nothing
/// was). A store failure mid-stream stops the replay early: the messages
/// already sent stand, the connection stays open, and the client's own
/// offset tracking makes the next reconnect retry from the right place.
pub async fn replay(
    store: &MessageStore,
    connection: &ConnectionHandle,
    since_offset: i64,
    batch_size: usize,
) -> i64 {
    let mut cursor = since_offset;
    let mut delivered = 0usize;

    loop {
        let batch = match store.messages_after(cursor, batch_size).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(
                    connection = %connection.id(),
                    cursor,
                    error = %e,
                    "Replay read failed; stopping early"
                );
                break;
            }
        };

        if batch.is_empty() {
            break;
        }

        for message in &batch {
            if !connection.send_replayed(message) {
                // Connection dropped mid-replay; nothing left to do
                debug!(connection = %connection.id(), "Connection closed during replay");
                return cursor;
            }
            cursor = message.sequence;
            delivered += 1;
        }
    }

    debug!(
        connection = %connection.id(),
        since_offset,
        delivered,
        last = cursor,
        "Replay complete"
    );
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::protocol::ServerEvent;
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn seeded_store(dir: &TempDir, count: usize) -> MessageStore {
        let store = MessageStore::open(&dir.path().join("chat.db")).unwrap();
        for i in 1..=count {
            store.append(format!("m{}", i), None).await.unwrap();
        }
        store
    }

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::replaying(Uuid::new_v4(), tx), rx)
    }

    fn received(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ServerEvent::Message { content, sequence } = event {
                out.push((content, sequence));
            }
        }
        out
    }

    #[tokio::test]
    async fn replays_everything_after_offset_in_order() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, 8).await;
        let (conn, mut rx) = handle();

        let last = replay(&store, &conn, 5, 100).await;

        assert_eq!(last, 8);
        assert_eq!(
            received(&mut rx),
            vec![
                ("m6".to_string(), 6),
                ("m7".to_string(), 7),
                ("m8".to_string(), 8)
            ]
        );
    }

    #[tokio::test]
    async fn replay_spans_multiple_batches() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, 10).await;
        let (conn, mut rx) = handle();

        let last = replay(&store, &conn, 0, 3).await;

        assert_eq!(last, 10);
        let sequences: Vec<i64> = received(&mut rx).into_iter().map(|(_, s)| s).collect();
        assert_eq!(sequences, (1..=10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn replay_with_current_offset_delivers_nothing() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, 3).await;
        let (conn, mut rx) = handle();

        let last = replay(&store, &conn, 3, 100).await;

        assert_eq!(last, 3);
        assert!(received(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn replay_stops_when_connection_drops() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir, 5).await;
        let (conn, rx) = handle();
        drop(rx);

        // Must terminate, not spin, once the channel is closed
        let last = replay(&store, &conn, 0, 2).await;
        assert_eq!(last, 0);
    }
}
