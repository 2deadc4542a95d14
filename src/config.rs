//! Configuration for Herald
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use uuid::Uuid;

/// Herald - durable real-time chat broadcast gateway
#[derive(Parser, Debug, Clone)]
#[command(name = "herald")]
#[command(about = "Durable chat broadcast gateway with gap-free reconnect recovery")]
pub struct Args {
    /// Unique node identifier for this gateway instance
    #[arg(long, env = "NODE_ID", default_value_t = Uuid::new_v4())]
    pub node_id: Uuid,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Path of the SQLite message log. Every process sharing one logical
    /// stream must point at the same file
    #[arg(long, env = "DB_PATH", default_value = "chat.db")]
    pub db_path: PathBuf,

    /// Enable development mode (single process; NATS optional)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// NATS configuration
    #[command(flatten)]
    pub nats: NatsArgs,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Number of messages fetched per batch during replay
    #[arg(long, env = "REPLAY_BATCH_SIZE", default_value = "500")]
    pub replay_batch_size: usize,

    /// How long a disconnected session may resume without a durable replay,
    /// in seconds
    #[arg(long, env = "RECOVERY_WINDOW_SECS", default_value = "120")]
    pub recovery_window_secs: u64,

    /// Maximum broadcasts retained in memory for session resumption
    #[arg(long, env = "RECOVERY_BACKLOG", default_value = "1024")]
    pub recovery_backlog: usize,
}

/// NATS connection configuration
#[derive(Parser, Debug, Clone)]
pub struct NatsArgs {
    /// NATS server URL
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// NATS username (optional)
    #[arg(long, env = "NATS_USER")]
    pub nats_user: Option<String>,

    /// NATS password (optional)
    #[arg(long, env = "NATS_PASSWORD")]
    pub nats_password: Option<String>,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.replay_batch_size == 0 {
            return Err("REPLAY_BATCH_SIZE must be at least 1".to_string());
        }

        if self.recovery_backlog == 0 {
            return Err("RECOVERY_BACKLOG must be at least 1".to_string());
        }

        if !self.dev_mode && self.nats.nats_url.is_empty() {
            return Err("NATS_URL is required in production mode".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["herald"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn defaults_are_valid() {
        let args = args(&[]);
        assert!(args.validate().is_ok());
        assert_eq!(args.replay_batch_size, 500);
        assert_eq!(args.recovery_window_secs, 120);
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let args = args(&["--replay-batch-size", "0"]);
        assert!(args.validate().is_err());
    }

    #[test]
    fn zero_backlog_is_rejected() {
        let args = args(&["--recovery-backlog", "0"]);
        assert!(args.validate().is_err());
    }
}
