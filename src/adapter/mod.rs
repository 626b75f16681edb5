//! Bus adapter trait — the core abstraction for event backends
//!
//! Both backends (the volatile in-memory ring and the durable NATS
//! JetStream log) implement [`BusAdapter`] to provide a uniform API
//! for publishing, history queries, and ordered stream consumption.

use crate::error::Result;
use crate::types::{InboundEvent, StoredEvent};
use async_trait::async_trait;

pub mod memory;
pub mod nats;

/// Core trait for event backends
///
/// The mutation path is serialized per instance: `publish` assigns
/// strictly increasing, never reused sequence numbers and a
/// non-decreasing timestamp, even under concurrent callers. Adapters
/// expect pre-validated input; [`crate::bridge::EventBridge::publish`]
/// owns validation and correlation-id fill.
#[async_trait]
pub trait BusAdapter: Send + Sync {
    /// Append a validated event, returning its stored form
    ///
    /// Once this returns, the event's position in the global order is
    /// fixed and never changes.
    async fn publish(&self, event: InboundEvent) -> Result<StoredEvent>;

    /// Fetch recent events, most recent first, bounded by `limit`
    ///
    /// Never blocks waiting for new events; silently stops at the trim
    /// horizon.
    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredEvent>>;

    /// Open an ordered event stream
    ///
    /// `from` is the first sequence to deliver; `None` starts at the
    /// tail (only events published after the call). Replaying below
    /// the trim horizon fails with `OffsetEvicted` on durable backends;
    /// the volatile backend clamps to the earliest retained event.
    async fn subscribe_stream(&self, from: Option<u64>) -> Result<Box<dyn EventStream>>;

    /// Open (or resume) a named logical cursor
    ///
    /// Cursors are independent per group name, so one slow consumer
    /// never blocks another. A freshly created group starts at the
    /// tail; re-subscribing resumes at the first unacknowledged
    /// offset (at-least-once).
    async fn subscribe_group(&self, group: &str) -> Result<Box<dyn EventStream>>;

    /// Backend state summary (counts, retained sequence window)
    async fn info(&self) -> Result<BackendInfo>;

    /// Backend reachability; defaults to `info()` succeeding
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }

    /// Backend name ("memory", "nats")
    fn name(&self) -> &str;
}

/// Ordered, lazily produced sequence of stored events
#[async_trait]
pub trait EventStream: Send {
    /// Await the next event; `Ok(None)` means the stream ended
    async fn next(&mut self) -> Result<Option<StoredEvent>>;

    /// Acknowledge an offset on a group cursor
    ///
    /// No-op for plain replay streams.
    async fn ack(&mut self, sequence: u64) -> Result<()>;
}

/// Backend state summary
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Backend name
    pub backend: String,
    /// Retained event count
    pub messages: u64,
    /// Retained bytes (0 when the backend does not track it)
    pub bytes: u64,
    /// Oldest retained sequence — the trim horizon
    pub first_sequence: u64,
    /// Newest assigned sequence
    pub last_sequence: u64,
}
