//! NATS messaging for cross-process fan-out

mod client;
mod messages;

pub use client::NatsClient;
pub use messages::{BroadcastEnvelope, BROADCAST_SUBJECT};
