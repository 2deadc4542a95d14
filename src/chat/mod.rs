//! Chat service: connection handling and session binding
//!
//! Clients connect with `GET /chat` (WebSocket upgrade), optionally passing
//! handshake query parameters:
//!
//! - `offset` - highest sequence the client has already displayed (default 0)
//! - `session` - session id from a previous connection, to attempt
//!   transport-level resumption
//!
//! Connection setup, in order:
//! 1. Register the connection with its delivery gate closed, so broadcasts
//!    arriving during setup are buffered instead of lost or reordered.
//! 2. Attempt resumption from the recovery window; on success the missed
//!    broadcasts come straight from the in-memory backlog and the session
//!    counts as recovered.
//! 3. Otherwise backfill from the durable log, starting after the client's
//!    declared offset. The client is the source of truth for what it has
//!    displayed; the server never second-guesses the offset.
//! 4. Release the gate and enter the submit loop.
//!
//! Submissions are appended idempotently, broadcast on success, and
//! acknowledged individually. A failed append is acknowledged as a failure;
//! it never tears the connection down.

pub mod append;
pub mod broadcast;
pub mod protocol;
pub mod recovery;
pub mod registry;
pub mod replay;

pub use append::{AppendEngine, AppendError, AppendOutcome};
pub use broadcast::{spawn_subscriber, Broadcast, Broadcaster};
pub use protocol::{AckStatus, ClientEvent, ServerEvent};
pub use recovery::{spawn_cleanup_task, RecoveryStore, Resumption};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use replay::replay;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::store::{Message, MessageStore};

/// Everything the chat service needs, shared across connections.
pub struct ChatState {
    pub store: MessageStore,
    pub engine: AppendEngine,
    pub registry: Arc<ConnectionRegistry>,
    pub recovery: Arc<RecoveryStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub replay_batch_size: usize,
}

/// State bound to one live connection, discarded when it closes.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSession {
    /// Transport identity, announced to the client for later resumption.
    pub session_id: Uuid,
    /// Highest sequence the client declared it has already seen.
    pub last_known_offset: i64,
    /// Whether the transport layer restored delivery state without replay.
    pub recovered: bool,
}

/// Handshake metadata parsed from the upgrade request's query string.
#[derive(Debug, Default, Clone, Copy)]
struct Handshake {
    offset: i64,
    session: Option<Uuid>,
}

fn parse_handshake(query: Option<&str>) -> Handshake {
    let mut handshake = Handshake::default();
    let Some(query) = query else {
        return handshake;
    };
    for param in query.split('&') {
        if let Some((key, value)) = param.split_once('=') {
            match key {
                "offset" => {
                    if let Ok(offset) = value.parse::<i64>() {
                        handshake.offset = offset.max(0);
                    }
                }
                "session" => {
                    handshake.session = value.parse().ok();
                }
                _ => {}
            }
        }
    }
    handshake
}

/// Handle the WebSocket upgrade for a chat connection.
pub async fn handle_chat_upgrade(
    chat: Arc<ChatState>,
    req: hyper::Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let handshake = parse_handshake(req.uri().query());

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!("Chat WebSocket upgrade failed: {}", e);
            return Response::builder()
                .status(StatusCode::BAD_REQUEST)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::from(format!(
                    r#"{{"error": "WebSocket upgrade failed: {e}"}}"#
                ))))
                .unwrap();
        }
    };

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => handle_chat_connection(chat, ws, handshake).await,
            Err(e) => warn!("Chat WebSocket connection failed: {}", e),
        }
    });

    response.map(|_| Full::new(Bytes::new()))
}

/// Drive one established chat connection from setup to disconnect.
async fn handle_chat_connection(
    chat: Arc<ChatState>,
    ws: hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>,
    handshake: Handshake,
) {
    let (mut write, mut read) = ws.split();

    // Writer task owns the sink; everything outbound goes through the channel
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match event.to_text() {
                Ok(text) => text,
                Err(e) => {
                    error!("Failed to serialize outbound event: {}", e);
                    continue;
                }
            };
            if write.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let connection_id = Uuid::new_v4();
    let handle = Arc::new(ConnectionHandle::replaying(connection_id, tx));

    // Gate closed from the first instant the connection can observe
    // broadcasts, so setup never races the live fan-out
    chat.registry.register(Arc::clone(&handle));

    let resumption = handshake.session.and_then(|s| chat.recovery.try_resume(s));

    let session = ConnectionSession {
        session_id: match (&resumption, handshake.session) {
            (Some(_), Some(session)) => session,
            _ => Uuid::new_v4(),
        },
        last_known_offset: handshake.offset,
        recovered: resumption.is_some(),
    };

    handle.send_event(ServerEvent::Session {
        session: session.session_id,
        recovered: session.recovered,
    });

    info!(
        connection = %connection_id,
        session = %session.session_id,
        offset = session.last_known_offset,
        recovered = session.recovered,
        "Chat connection established"
    );

    match resumption {
        Some(resumption) => {
            // Close the gap from the in-memory backlog; no durable replay
            let mut last = resumption.last_sequence;
            for broadcast in &resumption.missed {
                handle.send_replayed(&Message {
                    sequence: broadcast.sequence,
                    content: broadcast.content.clone(),
                });
                last = broadcast.sequence;
            }
            handle.finish_replay(last);
        }
        None => {
            let last = replay(
                &chat.store,
                &handle,
                session.last_known_offset,
                chat.replay_batch_size,
            )
            .await;
            handle.finish_replay(last);
        }
    }

    // Submit loop; runs only after setup so a submission can never overtake
    // the client's own backfill
    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(connection = %connection_id, "Chat read error: {}", e);
                break;
            }
        };

        match msg {
            WsMessage::Text(text) => match ClientEvent::parse(&text) {
                Ok(ClientEvent::Message { content, token, ack }) => {
                    handle_submission(&chat, &handle, content, token, ack).await;
                }
                Err(e) => {
                    warn!(connection = %connection_id, "Ignoring malformed frame: {}", e);
                }
            },
            WsMessage::Close(_) => break,
            // Pings are answered by the protocol layer; binary frames are
            // not part of the chat protocol
            _ => continue,
        }
    }

    chat.registry.remove(&connection_id);

    let last_delivered = handle
        .last_sequence()
        .unwrap_or(session.last_known_offset);
    chat.recovery.depart(session.session_id, last_delivered);

    info!(
        connection = %connection_id,
        session = %session.session_id,
        last_delivered,
        "Chat connection closed"
    );

    drop(handle);
    let _ = writer.await;
}

/// Append one submission and acknowledge it.
async fn handle_submission(
    chat: &ChatState,
    handle: &ConnectionHandle,
    content: String,
    token: Option<String>,
    ack: Option<u64>,
) {
    let (status, sequence) = match chat.engine.submit(content.clone(), token).await {
        Ok(AppendOutcome::Appended { sequence }) => {
            chat.broadcaster.publish(sequence, &content).await;
            (AckStatus::Ok, Some(sequence))
        }
        Ok(AppendOutcome::Duplicate { sequence }) => {
            // The retry changed nothing; no broadcast
            (AckStatus::Duplicate, sequence)
        }
        Err(AppendError::StorageFailure(e)) => {
            error!("Append failed: {}", e);
            (AckStatus::Error, None)
        }
    };

    if let Some(ack) = ack {
        handle.send_event(ServerEvent::Ack {
            ack,
            status,
            sequence,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_defaults_to_zero_offset() {
        let handshake = parse_handshake(None);
        assert_eq!(handshake.offset, 0);
        assert!(handshake.session.is_none());
    }

    #[test]
    fn handshake_parses_offset_and_session() {
        let session = Uuid::new_v4();
        let query = format!("offset=17&session={}", session);
        let handshake = parse_handshake(Some(&query));
        assert_eq!(handshake.offset, 17);
        assert_eq!(handshake.session, Some(session));
    }

    #[test]
    fn handshake_ignores_garbage() {
        let handshake = parse_handshake(Some("offset=abc&session=nope&extra=1"));
        assert_eq!(handshake.offset, 0);
        assert!(handshake.session.is_none());
    }

    #[test]
    fn handshake_clamps_negative_offset() {
        let handshake = parse_handshake(Some("offset=-5"));
        assert_eq!(handshake.offset, 0);
    }
}
