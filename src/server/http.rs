//! HTTP server implementation
//!
//! hyper http1 with TokioIo for async handling. The only stateful endpoint
//! is the chat WebSocket; the rest are operational probes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::chat::{self, AppendEngine, Broadcaster, ChatState, ConnectionRegistry, RecoveryStore};
use crate::config::Args;
use crate::nats::NatsClient;
use crate::store::MessageStore;
use crate::types::HeraldError;

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub nats: Option<NatsClient>,
    pub chat: Arc<ChatState>,
}

impl AppState {
    /// Wire up the chat service around an opened message log.
    pub fn new(args: Args, store: MessageStore, nats: Option<NatsClient>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let recovery = Arc::new(RecoveryStore::new(
            Duration::from_secs(args.recovery_window_secs),
            args.recovery_backlog,
        ));
        let broadcaster = Arc::new(Broadcaster::new(
            args.node_id,
            Arc::clone(&registry),
            Arc::clone(&recovery),
            nats.clone(),
        ));
        let chat = Arc::new(ChatState {
            engine: AppendEngine::new(store.clone()),
            store,
            registry,
            recovery,
            broadcaster,
            replay_batch_size: args.replay_batch_size,
        });

        Self { args, nats, chat }
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), HeraldError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "Herald listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - running without cross-process fan-out is allowed");
    }

    // Start the cross-process broadcast subscriber
    if let Some(ref nats) = state.nats {
        chat::spawn_subscriber(
            nats.clone(),
            state.args.node_id,
            Arc::clone(&state.chat.registry),
            Arc::clone(&state.chat.recovery),
        );
    } else {
        warn!("No NATS connection; broadcasts stay within this process");
    }

    // Periodically drop expired session departure records
    chat::spawn_cleanup_task(
        Arc::clone(&state.chat.recovery),
        Duration::from_secs(30),
    );
    info!(
        "Recovery window enabled ({}s, backlog {})",
        state.args.recovery_window_secs, state.args.recovery_backlog
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        // Liveness probe
        (Method::GET, "/health") | (Method::GET, "/healthz") => health_check(&state).await,

        // Version info for deployment verification
        (Method::GET, "/version") => version_info(),

        // Chat WebSocket
        (Method::GET, "/chat") => {
            if hyper_tungstenite::is_upgrade_request(&req) {
                chat::handle_chat_upgrade(Arc::clone(&state.chat), req).await
            } else {
                bad_request_response("WebSocket upgrade required for /chat")
            }
        }

        _ => not_found_response(&path),
    };

    Ok(response)
}

#[derive(Serialize)]
struct HealthResponse {
    healthy: bool,
    version: &'static str,
    node_id: String,
    connections: usize,
    latest_sequence: i64,
    nats_connected: bool,
}

/// Liveness probe: reports basic runtime state.
async fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let latest_sequence = match state.chat.store.latest_sequence().await {
        Ok(seq) => seq,
        Err(e) => {
            warn!("Health check could not read latest sequence: {}", e);
            -1
        }
    };

    json_response(
        StatusCode::OK,
        &HealthResponse {
            healthy: true,
            version: env!("CARGO_PKG_VERSION"),
            node_id: state.args.node_id.to_string(),
            connections: state.chat.registry.connection_count(),
            latest_sequence,
            nats_connected: state.nats.is_some(),
        },
    )
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
    commit: &'static str,
    build_time: &'static str,
}

fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &VersionResponse {
            version: env!("CARGO_PKG_VERSION"),
            commit: option_env!("GIT_COMMIT_SHORT").unwrap_or("unknown"),
            build_time: option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        },
    )
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn bad_request_response(message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(format!(
            r#"{{"error":"{message}"}}"#
        ))))
        .unwrap()
}

fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(format!(
            r#"{{"error":"Not found: {path}"}}"#
        ))))
        .unwrap()
}
