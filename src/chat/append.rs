//! Idempotent append engine
//!
//! Wraps the message log's insert so a retried submission with a known
//! idempotency token is a success no-op instead of an error. The duplicate
//! decision comes from the store's typed constraint-violation signal, never
//! from inspecting error text.

use tracing::warn;

use crate::store::{MessageStore, StoreError};

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new message was durably recorded.
    Appended { sequence: i64 },
    /// The token was already recorded; the earlier append stands. The
    /// existing sequence is reported when it can still be resolved.
    Duplicate { sequence: Option<i64> },
}

/// Errors surfaced to submitters.
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The store rejected the append for a reason other than a duplicate
    /// token. Nothing was recorded.
    #[error("storage failure: {0}")]
    StorageFailure(#[source] StoreError),
}

/// Append engine over the message log.
#[derive(Clone)]
pub struct AppendEngine {
    store: MessageStore,
}

impl AppendEngine {
    pub fn new(store: MessageStore) -> Self {
        Self { store }
    }

    /// Submit a message.
    ///
    /// An absent or empty token disables deduplication. On success exactly
    /// one new message exists with a sequence strictly greater than every
    /// earlier one; a duplicate changes nothing.
    pub async fn submit(
        &self,
        content: String,
        token: Option<String>,
    ) -> Result<AppendOutcome, AppendError> {
        let token = token.filter(|t| !t.is_empty());

        match self.store.append(content, token.clone()).await {
            Ok(sequence) => Ok(AppendOutcome::Appended { sequence }),
            Err(StoreError::DuplicateToken) => {
                // Resolve the original sequence so the retry's ack can carry
                // it. Best effort: a lookup failure still acks the duplicate.
                let sequence = match token {
                    Some(token) => match self.store.sequence_for_token(token).await {
                        Ok(sequence) => sequence,
                        Err(e) => {
                            warn!(error = %e, "Failed to resolve sequence for duplicate token");
                            None
                        }
                    },
                    None => None,
                };
                Ok(AppendOutcome::Duplicate { sequence })
            }
            Err(e) => Err(AppendError::StorageFailure(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn engine(dir: &TempDir) -> AppendEngine {
        AppendEngine::new(MessageStore::open(&dir.path().join("chat.db")).unwrap())
    }

    #[tokio::test]
    async fn fresh_submission_is_appended() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let outcome = engine
            .submit("hi".into(), Some("t1".into()))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Appended { sequence: 1 });
    }

    #[tokio::test]
    async fn retry_is_noop_with_original_sequence() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        engine.submit("hi".into(), Some("t1".into())).await.unwrap();
        let outcome = engine
            .submit("hi2".into(), Some("t1".into()))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            AppendOutcome::Duplicate {
                sequence: Some(1)
            }
        );
    }

    #[tokio::test]
    async fn tokenless_submissions_are_never_deduplicated() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let a = engine.submit("same".into(), None).await.unwrap();
        let b = engine.submit("same".into(), None).await.unwrap();
        let c = engine
            .submit("same".into(), Some(String::new()))
            .await
            .unwrap();

        assert_eq!(a, AppendOutcome::Appended { sequence: 1 });
        assert_eq!(b, AppendOutcome::Appended { sequence: 2 });
        assert_eq!(c, AppendOutcome::Appended { sequence: 3 });
    }

    #[tokio::test]
    async fn concurrent_retries_store_one_message() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir).await;

        let submissions = (0..8).map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.submit("hi".into(), Some("t1".into())).await })
        });

        let mut appended = 0;
        for handle in submissions {
            match handle.await.unwrap().unwrap() {
                AppendOutcome::Appended { .. } => appended += 1,
                AppendOutcome::Duplicate { .. } => {}
            }
        }

        assert_eq!(appended, 1);
    }
}
