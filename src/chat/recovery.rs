//! Connection-state recovery window
//!
//! Lets a client that drops and reconnects quickly resume without a durable
//! replay. Each process keeps two bounded, in-memory structures:
//!
//! - a record per recently departed session (session id, last delivered
//!   sequence, expiry deadline)
//! - a backlog of the most recent broadcasts this process has observed,
//!   local and remote
//!
//! On reconnect with a known, unexpired session id, the gap between the
//! session's last delivered sequence and the present is served straight from
//! the backlog and the connection counts as recovered. If the record is
//! gone, expired, or the backlog no longer reaches back far enough, the
//! caller falls back to the durable replay.
//!
//! Nothing here is persisted; a process restart simply means every client
//! takes the replay path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::broadcast::Broadcast;

/// A session that recently disconnected and may come back.
struct DepartedSession {
    last_sequence: i64,
    expires_at: Instant,
}

/// Successful transport-level resumption of a departed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resumption {
    /// The session's delivery watermark at departure.
    pub last_sequence: i64,
    /// Broadcasts the session missed, in increasing sequence order.
    pub missed: Vec<Broadcast>,
}

/// Per-process store of departed sessions and the broadcast backlog.
pub struct RecoveryStore {
    window: Duration,
    backlog_capacity: usize,
    departed: DashMap<Uuid, DepartedSession>,
    backlog: Mutex<VecDeque<Broadcast>>,
}

impl RecoveryStore {
    pub fn new(window: Duration, backlog_capacity: usize) -> Self {
        Self {
            window,
            backlog_capacity,
            departed: DashMap::new(),
            backlog: Mutex::new(VecDeque::with_capacity(backlog_capacity)),
        }
    }

    /// Record a broadcast into the backlog, evicting the oldest entry once
    /// capacity is reached.
    pub fn record(&self, broadcast: Broadcast) {
        let mut backlog = self.backlog.lock().expect("backlog mutex poisoned");
        if backlog.len() == self.backlog_capacity {
            backlog.pop_front();
        }
        backlog.push_back(broadcast);
    }

    /// Note a departing session so a quick reconnect can resume it.
    pub fn depart(&self, session: Uuid, last_sequence: i64) {
        self.departed.insert(
            session,
            DepartedSession {
                last_sequence,
                expires_at: Instant::now() + self.window,
            },
        );
    }

    /// Try to resume a session.
    ///
    /// Succeeds when the departure record is fresh and the backlog covers
    /// the whole gap since the session's watermark. Returns `None`
    /// otherwise; the session record is consumed either way.
    pub fn try_resume(&self, session: Uuid) -> Option<Resumption> {
        let (_, record) = self.departed.remove(&session)?;
        if record.expires_at < Instant::now() {
            debug!(session = %session, "Session record expired");
            return None;
        }

        let backlog = self.backlog.lock().expect("backlog mutex poisoned");
        let mut missed: Vec<Broadcast> = backlog
            .iter()
            .filter(|b| b.sequence > record.last_sequence)
            .cloned()
            .collect();
        // Remote envelopes may land in the backlog out of order
        missed.sort_by_key(|b| b.sequence);

        // The backlog must reach back to the session's watermark, otherwise
        // broadcasts were evicted before this reconnect and the gap is not
        // closable from memory.
        if let Some(oldest) = backlog.iter().map(|b| b.sequence).min() {
            if oldest > record.last_sequence + 1 && !missed.is_empty() {
                debug!(
                    session = %session,
                    last_sequence = record.last_sequence,
                    oldest,
                    "Backlog no longer covers session gap"
                );
                return None;
            }
        }

        debug!(
            session = %session,
            last_sequence = record.last_sequence,
            missed = missed.len(),
            "Session resumed from backlog"
        );
        Some(Resumption {
            last_sequence: record.last_sequence,
            missed,
        })
    }

    /// Drop expired departure records. Called opportunistically from the
    /// cleanup task.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.departed.retain(|_, record| record.expires_at >= now);
    }

    pub fn departed_count(&self) -> usize {
        self.departed.len()
    }
}

/// Spawn a task that periodically drops expired departure records.
pub fn spawn_cleanup_task(
    store: Arc<RecoveryStore>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.evict_expired();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broadcast(sequence: i64) -> Broadcast {
        Broadcast {
            sequence,
            content: format!("m{}", sequence),
        }
    }

    fn store() -> RecoveryStore {
        RecoveryStore::new(Duration::from_secs(60), 8)
    }

    #[test]
    fn resume_within_window_returns_missed_broadcasts() {
        let store = store();
        let session = Uuid::new_v4();

        store.record(broadcast(1));
        store.record(broadcast(2));
        store.depart(session, 2);
        store.record(broadcast(3));
        store.record(broadcast(4));

        let resumption = store.try_resume(session).unwrap();
        let sequences: Vec<i64> = resumption.missed.iter().map(|b| b.sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
        assert_eq!(resumption.last_sequence, 2);
    }

    #[test]
    fn resume_with_nothing_missed_returns_empty() {
        let store = store();
        let session = Uuid::new_v4();

        store.record(broadcast(1));
        store.depart(session, 1);

        let resumption = store.try_resume(session).unwrap();
        assert!(resumption.missed.is_empty());
        assert_eq!(resumption.last_sequence, 1);
    }

    #[test]
    fn unknown_session_does_not_resume() {
        let store = store();
        assert!(store.try_resume(Uuid::new_v4()).is_none());
    }

    #[test]
    fn session_record_is_consumed_on_resume() {
        let store = store();
        let session = Uuid::new_v4();
        store.depart(session, 0);

        assert!(store.try_resume(session).is_some());
        assert!(store.try_resume(session).is_none());
    }

    #[test]
    fn evicted_backlog_prevents_resume() {
        let store = RecoveryStore::new(Duration::from_secs(60), 2);
        let session = Uuid::new_v4();

        store.record(broadcast(1));
        store.depart(session, 1);
        // Capacity 2: sequences 2..=4 push 1 and 2 out of the backlog
        store.record(broadcast(2));
        store.record(broadcast(3));
        store.record(broadcast(4));

        assert!(store.try_resume(session).is_none());
    }

    #[test]
    fn expired_record_does_not_resume() {
        let store = RecoveryStore::new(Duration::ZERO, 8);
        let session = Uuid::new_v4();

        store.record(broadcast(1));
        store.depart(session, 0);
        std::thread::sleep(Duration::from_millis(5));

        assert!(store.try_resume(session).is_none());
    }

    #[test]
    fn evict_expired_drops_stale_records() {
        let store = RecoveryStore::new(Duration::ZERO, 8);
        store.depart(Uuid::new_v4(), 0);
        store.depart(Uuid::new_v4(), 0);
        assert_eq!(store.departed_count(), 2);
        std::thread::sleep(Duration::from_millis(5));

        store.evict_expired();
        assert_eq!(store.departed_count(), 0);
    }
}
