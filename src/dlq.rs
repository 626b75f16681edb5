//! Dead letter store — deliveries that exhausted their retry budget
//!
//! Dead letters are the terminal, user-visible failure state for
//! webhook delivery. They are retained until purged or manually
//! replayed; replay removes the record and re-enqueues the event as a
//! fresh pending task.

use crate::error::Result;
use crate::types::DeadLetter;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for dead letter stores
///
/// Implementations decide where exhausted deliveries go; the bundled
/// in-memory store suits single-process deployments and tests.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Record a dead letter
    async fn record(&self, dead_letter: DeadLetter) -> Result<()>;

    /// Number of retained dead letters
    async fn count(&self) -> Result<usize>;

    /// Recent dead letters, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Remove and return a dead letter for replay
    async fn take(&self, event_id: &str, subscription_id: &str) -> Result<Option<DeadLetter>>;

    /// Drop all retained dead letters, returning how many were purged
    async fn purge(&self) -> Result<usize>;
}

/// In-memory dead letter store with a capacity bound
///
/// The oldest records are drained once capacity is exceeded.
pub struct MemoryDeadLetterStore {
    dead_letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_entries: usize,
}

impl MemoryDeadLetterStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }
}

impl Default for MemoryDeadLetterStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(&self, dead_letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            event_id = %dead_letter.event.id,
            subscription_id = %dead_letter.subscription_id,
            attempts = dead_letter.attempts.len(),
            final_error = %dead_letter.final_error,
            "Delivery dead-lettered"
        );

        let mut dead_letters = self.dead_letters.write().await;
        dead_letters.push(dead_letter);

        if self.max_entries > 0 && dead_letters.len() > self.max_entries {
            let drain_count = dead_letters.len() - self.max_entries;
            dead_letters.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.dead_letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let dead_letters = self.dead_letters.read().await;
        Ok(dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn take(&self, event_id: &str, subscription_id: &str) -> Result<Option<DeadLetter>> {
        let mut dead_letters = self.dead_letters.write().await;
        let index = dead_letters
            .iter()
            .position(|d| d.event.id == event_id && d.subscription_id == subscription_id);
        Ok(index.map(|i| dead_letters.remove(i)))
    }

    async fn purge(&self) -> Result<usize> {
        let mut dead_letters = self.dead_letters.write().await;
        let purged = dead_letters.len();
        dead_letters.clear();
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_millis, InboundEvent, StoredEvent};

    fn dead_letter(sequence: u64, reason: &str) -> DeadLetter {
        DeadLetter {
            event: StoredEvent::seal(
                InboundEvent::new("test", "t.failed", serde_json::json!({}))
                    .with_correlation("c"),
                now_millis(),
                sequence,
            ),
            subscription_id: "sub-1".to_string(),
            attempts: Vec::new(),
            final_error: reason.to_string(),
            dead_lettered_at: now_millis(),
        }
    }

    #[tokio::test]
    async fn test_record_and_count() {
        let store = MemoryDeadLetterStore::default();
        assert_eq!(store.count().await.unwrap(), 0);

        store.record(dead_letter(1, "failed")).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let store = MemoryDeadLetterStore::default();
        for i in 0..5 {
            store.record(dead_letter(i, &format!("reason {}", i))).await.unwrap();
        }

        let list = store.list(3).await.unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].final_error, "reason 4");
        assert_eq!(list[2].final_error, "reason 2");
    }

    #[tokio::test]
    async fn test_capacity_drains_oldest() {
        let store = MemoryDeadLetterStore::new(3);
        for i in 0..5 {
            store.record(dead_letter(i, &format!("reason {}", i))).await.unwrap();
        }

        assert_eq!(store.count().await.unwrap(), 3);
        let list = store.list(10).await.unwrap();
        assert_eq!(list[0].final_error, "reason 4");
        assert_eq!(list[2].final_error, "reason 2");
    }

    #[tokio::test]
    async fn test_take_removes_matching_record() {
        let store = MemoryDeadLetterStore::default();
        let dl = dead_letter(7, "gone");
        let event_id = dl.event.id.clone();
        store.record(dl).await.unwrap();

        let taken = store.take(&event_id, "sub-1").await.unwrap().unwrap();
        assert_eq!(taken.event.id, event_id);
        assert_eq!(store.count().await.unwrap(), 0);

        assert!(store.take(&event_id, "sub-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_clears_everything() {
        let store = MemoryDeadLetterStore::default();
        for i in 0..4 {
            store.record(dead_letter(i, "x")).await.unwrap();
        }
        assert_eq!(store.purge().await.unwrap(), 4);
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
