//! In-memory event backend — a fixed-capacity ring buffer
//!
//! Volatile and single-process: the oldest events are evicted on
//! overflow and are unrecoverable, and nothing survives a restart.
//! One mutex section guards every mutating operation; streams are
//! woken through a [`Notify`] rather than polling.

use crate::adapter::{BackendInfo, BusAdapter, EventStream};
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::types::{now_millis, InboundEvent, StoredEvent};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// In-memory implementation of the bus adapter
pub struct MemoryAdapter {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: Mutex<MemoryState>,
    notify: Notify,
    capacity: usize,
}

struct MemoryState {
    /// Ring of retained events, oldest first; sequences are contiguous
    buffer: VecDeque<StoredEvent>,
    /// Next sequence to assign (sequences start at 1)
    next_sequence: u64,
    /// Last assigned timestamp, for monotonicity under clock skew
    last_ts: u64,
    /// Group name → next unacknowledged sequence (the ack floor)
    groups: HashMap<String, u64>,
}

impl MemoryAdapter {
    /// Create an adapter with the given configuration
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(MemoryState {
                    buffer: VecDeque::new(),
                    next_sequence: 1,
                    last_ts: 0,
                    groups: HashMap::new(),
                }),
                notify: Notify::new(),
                capacity: config.capacity.max(1),
            }),
        }
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryState {
    /// Sequence of the oldest retained event, or the next sequence when empty
    fn earliest(&self) -> u64 {
        self.buffer
            .front()
            .map(|e| e.sequence)
            .unwrap_or(self.next_sequence)
    }

    /// Retained event at `sequence`, if it has not been evicted
    fn get(&self, sequence: u64) -> Option<&StoredEvent> {
        let earliest = self.buffer.front()?.sequence;
        if sequence < earliest {
            return None;
        }
        self.buffer.get((sequence - earliest) as usize)
    }
}

#[async_trait]
impl BusAdapter for MemoryAdapter {
    async fn publish(&self, event: InboundEvent) -> Result<StoredEvent> {
        let stored = {
            let mut state = self.inner.state.lock().await;
            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let ts = now_millis().max(state.last_ts);
            state.last_ts = ts;

            let stored = StoredEvent::seal(event, ts, sequence);
            state.buffer.push_back(stored.clone());
            while state.buffer.len() > self.inner.capacity {
                state.buffer.pop_front();
            }
            stored
        };

        tracing::debug!(
            event_id = %stored.id,
            event_type = %stored.event_type,
            source = %stored.source,
            sequence = stored.sequence,
            adapter = "memory",
            "Event published"
        );

        self.inner.notify.notify_waiters();
        Ok(stored)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let state = self.inner.state.lock().await;
        Ok(state.buffer.iter().rev().take(limit).cloned().collect())
    }

    async fn subscribe_stream(&self, from: Option<u64>) -> Result<Box<dyn EventStream>> {
        let cursor = {
            let state = self.inner.state.lock().await;
            // An evicted offset clamps to the earliest retained event:
            // the ring is volatile by design
            from.map(|seq| seq.max(state.earliest()))
                .unwrap_or(state.next_sequence)
        };
        Ok(Box::new(MemoryStream {
            inner: self.inner.clone(),
            cursor,
            group: None,
        }))
    }

    async fn subscribe_group(&self, group: &str) -> Result<Box<dyn EventStream>> {
        let cursor = {
            let mut state = self.inner.state.lock().await;
            let tail = state.next_sequence;
            let floor = *state.groups.entry(group.to_string()).or_insert(tail);
            floor.max(state.earliest())
        };
        tracing::debug!(group, cursor, adapter = "memory", "Group cursor opened");
        Ok(Box::new(MemoryStream {
            inner: self.inner.clone(),
            cursor,
            group: Some(group.to_string()),
        }))
    }

    async fn info(&self) -> Result<BackendInfo> {
        let state = self.inner.state.lock().await;
        Ok(BackendInfo {
            backend: "memory".to_string(),
            messages: state.buffer.len() as u64,
            bytes: 0,
            first_sequence: state.earliest(),
            last_sequence: state.next_sequence.saturating_sub(1),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Cursor-based stream over the ring buffer
struct MemoryStream {
    inner: Arc<MemoryInner>,
    cursor: u64,
    group: Option<String>,
}

#[async_trait]
impl EventStream for MemoryStream {
    async fn next(&mut self) -> Result<Option<StoredEvent>> {
        loop {
            // Register for wakeups before checking the buffer so a
            // publish between the check and the await is never lost
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.lock().await;
                // Skip over anything evicted since the last read
                if self.cursor < state.earliest() {
                    self.cursor = state.earliest();
                }
                if let Some(event) = state.get(self.cursor) {
                    let event = event.clone();
                    self.cursor += 1;
                    return Ok(Some(event));
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, sequence: u64) -> Result<()> {
        if let Some(ref group) = self.group {
            let mut state = self.inner.state.lock().await;
            let floor = state.groups.entry(group.clone()).or_insert(sequence + 1);
            // Floors only move forward
            if sequence + 1 > *floor {
                *floor = sequence + 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(i: usize) -> InboundEvent {
        InboundEvent::new("test", format!("e.{}", i), serde_json::json!({ "i": i }))
            .with_correlation(format!("c-{}", i))
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_sequences() {
        let adapter = MemoryAdapter::default();
        let mut last = 0;
        for i in 0..10 {
            let stored = adapter.publish(inbound(i)).await.unwrap();
            assert!(stored.sequence > last);
            last = stored.sequence;
        }
    }

    #[tokio::test]
    async fn test_concurrent_publish_never_reuses_sequences() {
        let adapter = Arc::new(MemoryAdapter::default());
        let mut handles = Vec::new();
        for t in 0..8 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                let mut seqs = Vec::new();
                for i in 0..25 {
                    let stored = adapter.publish(inbound(t * 100 + i)).await.unwrap();
                    seqs.push(stored.sequence);
                }
                seqs
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 200);
    }

    #[tokio::test]
    async fn test_list_recent_is_newest_first_and_bounded() {
        let adapter = MemoryAdapter::default();
        for i in 0..20 {
            adapter.publish(inbound(i)).await.unwrap();
        }
        let recent = adapter.list_recent(5).await.unwrap();
        assert_eq!(recent.len(), 5);
        assert_eq!(recent[0].payload["i"], 19);
        assert_eq!(recent[4].payload["i"], 15);
    }

    #[tokio::test]
    async fn test_overflow_evicts_oldest() {
        let adapter = MemoryAdapter::new(MemoryConfig { capacity: 3 });
        for i in 0..5 {
            adapter.publish(inbound(i)).await.unwrap();
        }
        let info = adapter.info().await.unwrap();
        assert_eq!(info.messages, 3);
        assert_eq!(info.first_sequence, 3);
        assert_eq!(info.last_sequence, 5);

        let recent = adapter.list_recent(10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.last().unwrap().payload["i"], 2);
    }

    #[tokio::test]
    async fn test_stream_replays_then_follows() {
        let adapter = MemoryAdapter::default();
        let first = adapter.publish(inbound(0)).await.unwrap();
        adapter.publish(inbound(1)).await.unwrap();

        let mut stream = adapter.subscribe_stream(Some(first.sequence)).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap().sequence, 1);
        assert_eq!(stream.next().await.unwrap().unwrap().sequence, 2);

        // Publish after the stream caught up; next() must wake
        let adapter2 = adapter;
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            adapter2.publish(inbound(2)).await.unwrap();
        });
        let third = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(third.sequence, 3);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_replay_is_byte_identical() {
        let adapter = MemoryAdapter::default();
        let stored = adapter.publish(inbound(7)).await.unwrap();

        let mut stream = adapter.subscribe_stream(Some(stored.sequence)).await.unwrap();
        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(
            serde_json::to_vec(&replayed).unwrap(),
            serde_json::to_vec(&stored).unwrap()
        );
    }

    #[tokio::test]
    async fn test_stream_from_tail_skips_history() {
        let adapter = MemoryAdapter::default();
        adapter.publish(inbound(0)).await.unwrap();

        let mut stream = adapter.subscribe_stream(None).await.unwrap();
        adapter.publish(inbound(1)).await.unwrap();
        let got = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.sequence, 2);
    }

    #[tokio::test]
    async fn test_evicted_replay_clamps_to_earliest() {
        let adapter = MemoryAdapter::new(MemoryConfig { capacity: 2 });
        for i in 0..5 {
            adapter.publish(inbound(i)).await.unwrap();
        }
        let mut stream = adapter.subscribe_stream(Some(1)).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.sequence, 4);
    }

    #[tokio::test]
    async fn test_group_cursor_resumes_at_unacked() {
        let adapter = MemoryAdapter::default();
        {
            let mut group = adapter.subscribe_group("dispatcher").await.unwrap();
            // Group starts at the tail: events published before the
            // group existed are not delivered
            adapter.publish(inbound(0)).await.unwrap();
            adapter.publish(inbound(1)).await.unwrap();
            let first = group.next().await.unwrap().unwrap();
            assert_eq!(first.sequence, 1);
            group.ack(first.sequence).await.unwrap();
            // Read but never ack the second event
            let second = group.next().await.unwrap().unwrap();
            assert_eq!(second.sequence, 2);
        }
        // Re-subscribing redelivers the unacknowledged event
        let mut group = adapter.subscribe_group("dispatcher").await.unwrap();
        let redelivered = group.next().await.unwrap().unwrap();
        assert_eq!(redelivered.sequence, 2);
    }

    #[tokio::test]
    async fn test_group_cursors_are_independent() {
        let adapter = MemoryAdapter::default();
        adapter.publish(inbound(0)).await.unwrap();

        let mut dispatcher = adapter.subscribe_group("dispatcher").await.unwrap();
        let mut fanout = adapter.subscribe_group("fanout").await.unwrap();
        adapter.publish(inbound(1)).await.unwrap();

        let a = dispatcher.next().await.unwrap().unwrap();
        dispatcher.ack(a.sequence).await.unwrap();

        // The fanout cursor is unaffected by dispatcher acks
        let b = fanout.next().await.unwrap().unwrap();
        assert_eq!(b.sequence, a.sequence);
    }

    #[tokio::test]
    async fn test_timestamps_never_decrease() {
        let adapter = MemoryAdapter::default();
        let mut last = 0;
        for i in 0..20 {
            let stored = adapter.publish(inbound(i)).await.unwrap();
            assert!(stored.ts >= last);
            last = stored.ts;
        }
    }
}
