//! Herald - durable real-time chat broadcast gateway
//!
//! Herald accepts chat submissions over WebSocket connections, appends them
//! to a strictly ordered SQLite message log, and fans each message out to
//! every connected client across every running process via NATS.
//!
//! ## Services
//!
//! - **Chat**: WebSocket endpoint with idempotent submission and per-message
//!   acknowledgments
//! - **Replay**: ordered backfill of missed messages for reconnecting clients
//! - **Broadcast**: local and cross-process fan-out of appended messages
//! - **Recovery**: short-lived session resumption window so quick reconnects
//!   skip the durable replay entirely

pub mod chat;
pub mod config;
pub mod nats;
pub mod server;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{HeraldError, Result};
