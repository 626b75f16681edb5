//! Realtime fan-out — per-connection buffering, rate limiting, gaps
//!
//! Each live connection owns an independent bounded queue and token
//! bucket, so the publishing side never blocks on any individual
//! consumer. When a connection's bucket is empty, events buffer up to
//! the configured depth; past that the oldest buffered event is
//! dropped, the connection is marked degraded, and the next delivered
//! frame is a gap marker carrying the sequence number of the first
//! retained event, so consumers can detect loss and reconnect with
//! explicit replay.

use crate::config::FanoutConfig;
use crate::types::StoredEvent;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::Instant;

/// A frame pushed to a streaming connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum StreamFrame {
    /// A matched event, in sequence order
    Event { event: StoredEvent },
    /// Events were dropped; delivery resumes at `resume_sequence`
    Gap { resume_sequence: u64 },
}

/// Token bucket: fixed refill rate, bounded burst
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(refill_per_sec: f64, burst: u32) -> Self {
        let capacity = f64::from(burst.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: refill_per_sec.max(0.0),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one full token is available
    fn next_token_in(&self) -> Duration {
        if self.refill_per_sec <= 0.0 {
            // No refill configured; re-check on a coarse interval
            return Duration::from_secs(3600);
        }
        let deficit = (1.0 - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / self.refill_per_sec)
    }
}

struct ConnectionState {
    queue: VecDeque<StoredEvent>,
    bucket: TokenBucket,
    /// Set when a drop occurred; cleared once the gap frame is emitted
    gap_armed: bool,
    /// Sticky once any drop has occurred
    degraded: bool,
    closed: bool,
}

struct ConnectionShared {
    id: u64,
    channel: String,
    /// Live connections receive hub pushes; replay connections are fed
    /// through `offer` by their own stream task
    live: bool,
    state: Mutex<ConnectionState>,
    notify: Notify,
    frames: mpsc::Sender<StreamFrame>,
}

struct HubInner {
    connections: RwLock<HashMap<u64, Arc<ConnectionShared>>>,
    config: FanoutConfig,
    next_id: AtomicU64,
}

/// Consumer half of a streaming connection
pub struct StreamConnection {
    pub id: u64,
    frames: mpsc::Receiver<StreamFrame>,
}

impl StreamConnection {
    /// Await the next frame; `None` once the connection is closed
    pub async fn recv(&mut self) -> Option<StreamFrame> {
        self.frames.recv().await
    }

    /// Adapt the connection into a `futures::Stream` of frames
    pub fn into_stream(self) -> tokio_stream::wrappers::ReceiverStream<StreamFrame> {
        tokio_stream::wrappers::ReceiverStream::new(self.frames)
    }
}

/// Fan-out hub: registers connections and pushes matched events
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new(config: FanoutConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                connections: RwLock::new(HashMap::new()),
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a live connection on a channel, starting at "now"
    pub async fn connect(&self, channel: &str) -> StreamConnection {
        self.attach(channel, true).await
    }

    /// Register a connection fed externally (replay pipelines)
    pub(crate) async fn attach(&self, channel: &str, live: bool) -> StreamConnection {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(8);
        let connection = Arc::new(ConnectionShared {
            id,
            channel: channel.to_string(),
            live,
            state: Mutex::new(ConnectionState {
                queue: VecDeque::new(),
                bucket: TokenBucket::new(
                    self.inner.config.refill_per_sec,
                    self.inner.config.burst,
                ),
                gap_armed: false,
                degraded: false,
                closed: false,
            }),
            notify: Notify::new(),
            frames: tx,
        });

        self.inner
            .connections
            .write()
            .await
            .insert(id, connection.clone());
        tokio::spawn(run_pump(self.inner.clone(), connection));

        tracing::info!(connection_id = id, channel, live, "Stream connection opened");
        StreamConnection { id, frames: rx }
    }

    /// Push a matched event to every live connection on `channel`
    ///
    /// Never blocks on any connection's consumption rate.
    pub async fn push(&self, channel: &str, event: &StoredEvent) {
        let targets: Vec<Arc<ConnectionShared>> = {
            let connections = self.inner.connections.read().await;
            connections
                .values()
                .filter(|c| c.live && c.channel == channel)
                .cloned()
                .collect()
        };
        for connection in targets {
            offer_to(&connection, self.inner.config.queue_depth, event).await;
        }
    }

    /// Feed one event to a specific connection (replay path)
    pub(crate) async fn offer(&self, connection_id: u64, event: &StoredEvent) {
        let connection = {
            let connections = self.inner.connections.read().await;
            connections.get(&connection_id).cloned()
        };
        if let Some(connection) = connection {
            offer_to(&connection, self.inner.config.queue_depth, event).await;
        }
    }

    /// Close a connection, releasing its queue and limiter immediately
    pub async fn disconnect(&self, connection_id: u64) {
        let connection = self.inner.connections.write().await.remove(&connection_id);
        if let Some(connection) = connection {
            connection.state.lock().await.closed = true;
            connection.notify.notify_one();
            tracing::info!(connection_id, "Stream connection closed");
        }
    }

    /// Whether a connection has dropped events since it connected
    pub async fn is_degraded(&self, connection_id: u64) -> bool {
        let connections = self.inner.connections.read().await;
        match connections.get(&connection_id) {
            Some(connection) => connection.state.lock().await.degraded,
            None => false,
        }
    }

    /// Whether a connection is still registered
    pub(crate) async fn is_connected(&self, connection_id: u64) -> bool {
        self.inner
            .connections
            .read()
            .await
            .contains_key(&connection_id)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    /// Close every connection
    pub async fn shutdown(&self) {
        let ids: Vec<u64> = {
            let connections = self.inner.connections.read().await;
            connections.keys().copied().collect()
        };
        for id in ids {
            self.disconnect(id).await;
        }
    }
}

/// Enqueue an event on a connection, applying the overflow policy
async fn offer_to(connection: &ConnectionShared, depth: usize, event: &StoredEvent) {
    {
        let mut state = connection.state.lock().await;
        if state.closed {
            return;
        }
        if state.queue.len() >= depth.max(1) {
            // Drop-oldest: the publisher is never blocked and never
            // awaited on a full consumer
            state.queue.pop_front();
            state.degraded = true;
            state.gap_armed = true;
            tracing::debug!(
                connection_id = connection.id,
                channel = %connection.channel,
                "Connection buffer full, dropped oldest event"
            );
        }
        state.queue.push_back(event.clone());
    }
    connection.notify.notify_one();
}

enum PumpStep {
    Deliver { gap: bool, event: StoredEvent },
    Idle,
    Throttled(Duration),
}

/// Per-connection delivery task: takes tokens, emits frames in order
async fn run_pump(inner: Arc<HubInner>, connection: Arc<ConnectionShared>) {
    loop {
        let step = {
            let mut state = connection.state.lock().await;
            if state.closed {
                break;
            }
            if state.queue.is_empty() {
                PumpStep::Idle
            } else if state.bucket.try_take() {
                match state.queue.pop_front() {
                    Some(event) => {
                        let gap = state.gap_armed;
                        state.gap_armed = false;
                        PumpStep::Deliver { gap, event }
                    }
                    None => PumpStep::Idle,
                }
            } else {
                PumpStep::Throttled(state.bucket.next_token_in())
            }
        };

        match step {
            PumpStep::Deliver { gap, event } => {
                if gap {
                    let frame = StreamFrame::Gap {
                        resume_sequence: event.sequence,
                    };
                    if connection.frames.send(frame).await.is_err() {
                        break;
                    }
                }
                if connection
                    .frames
                    .send(StreamFrame::Event { event })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            PumpStep::Idle => {
                tokio::select! {
                    _ = connection.notify.notified() => {}
                    // Consumer dropped the receiver; tear down now
                    _ = connection.frames.closed() => break,
                }
            }
            PumpStep::Throttled(wait) => {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = connection.frames.closed() => break,
                }
            }
        }
    }

    connection.state.lock().await.closed = true;
    inner.connections.write().await.remove(&connection.id);
    tracing::debug!(connection_id = connection.id, "Stream pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InboundEvent;

    fn event(sequence: u64) -> StoredEvent {
        StoredEvent::seal(
            InboundEvent::new("test", "t.event", serde_json::json!({ "seq": sequence }))
                .with_correlation("c"),
            1_700_000_000_000 + sequence,
            sequence,
        )
    }

    async fn recv_timeout(connection: &mut StreamConnection) -> StreamFrame {
        tokio::time::timeout(Duration::from_secs(30), connection.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    fn assert_event(frame: StreamFrame, sequence: u64) {
        match frame {
            StreamFrame::Event { event } => assert_eq!(event.sequence, sequence),
            other => panic!("expected event {}, got {:?}", sequence, other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_burst_and_refill() {
        let mut bucket = TokenBucket::new(1.0, 2);
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.try_take());
        assert!(!bucket.try_take());

        // Refill caps at burst capacity
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_take());
        assert!(bucket.try_take());
        assert!(!bucket.try_take());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_bucket_wait_estimate() {
        let mut bucket = TokenBucket::new(2.0, 1);
        assert!(bucket.try_take());
        bucket.refill();
        let wait = bucket.next_token_in();
        assert!(wait > Duration::ZERO && wait <= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_flow_in_order() {
        let hub = FanoutHub::new(FanoutConfig::default());
        let mut connection = hub.connect("deploys").await;

        for seq in 1..=5 {
            hub.push("deploys", &event(seq)).await;
        }
        for seq in 1..=5 {
            assert_event(recv_timeout(&mut connection).await, seq);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_only_reaches_matching_channel() {
        let hub = FanoutHub::new(FanoutConfig::default());
        let mut deploys = hub.connect("deploys").await;
        let mut alerts = hub.connect("alerts").await;

        hub.push("deploys", &event(1)).await;
        hub.push("alerts", &event(2)).await;

        assert_event(recv_timeout(&mut deploys).await, 1);
        assert_event(recv_timeout(&mut alerts).await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_drops_oldest_and_emits_gap() {
        let hub = FanoutHub::new(FanoutConfig {
            refill_per_sec: 1.0,
            burst: 1,
            queue_depth: 2,
        });
        let mut connection = hub.connect("deploys").await;

        // The single burst token carries the first event through
        hub.push("deploys", &event(1)).await;
        assert_event(recv_timeout(&mut connection).await, 1);

        // Bucket now empty: these buffer; depth 2 drops the oldest
        hub.push("deploys", &event(2)).await;
        hub.push("deploys", &event(3)).await;
        hub.push("deploys", &event(4)).await;

        // Gap marker names the first retained event after the drop,
        // then delivery resumes in order with no reordering
        let frame = recv_timeout(&mut connection).await;
        assert_eq!(frame, StreamFrame::Gap { resume_sequence: 3 });
        assert_event(recv_timeout(&mut connection).await, 3);
        assert_event(recv_timeout(&mut connection).await, 4);

        assert!(hub.is_degraded(connection.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_never_blocks_on_slow_consumer() {
        let hub = FanoutHub::new(FanoutConfig {
            refill_per_sec: 0.0,
            burst: 1,
            queue_depth: 4,
        });
        let connection = hub.connect("deploys").await;

        // Nothing consumes and the bucket never refills; pushes must
        // still return promptly
        for seq in 1..=100 {
            tokio::time::timeout(Duration::from_millis(10), hub.push("deploys", &event(seq)))
                .await
                .expect("push blocked on a slow connection");
        }
        assert!(hub.is_degraded(connection.id).await);
        drop(connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_paces_delivery() {
        let hub = FanoutHub::new(FanoutConfig {
            refill_per_sec: 1.0,
            burst: 2,
            queue_depth: 16,
        });
        let mut connection = hub.connect("deploys").await;

        let start = Instant::now();
        for seq in 1..=4 {
            hub.push("deploys", &event(seq)).await;
        }
        for seq in 1..=4 {
            assert_event(recv_timeout(&mut connection).await, seq);
        }
        // 2 burst tokens + 2 refilled at 1/s: at least ~2s elapsed
        assert!(Instant::now() - start >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_releases_connection() {
        let hub = FanoutHub::new(FanoutConfig::default());
        let connection = hub.connect("deploys").await;
        assert_eq!(hub.connection_count().await, 1);

        hub.disconnect(connection.id).await;
        assert_eq!(hub.connection_count().await, 0);

        // Pushing to a gone channel is a no-op
        hub.push("deploys", &event(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_tears_down_pump() {
        let hub = FanoutHub::new(FanoutConfig::default());
        let connection = hub.connect("deploys").await;
        let id = connection.id;
        drop(connection);

        // The pump notices the dropped receiver and unregisters
        for _ in 0..100 {
            if hub.connection_count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(hub.connection_count().await, 0);
        assert!(!hub.is_connected(id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_serialization() {
        let frame = StreamFrame::Gap { resume_sequence: 9 };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, "{\"type\":\"gap\",\"resumeSequence\":9}");

        let frame = StreamFrame::Event { event: event(3) };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"event\""));
        let parsed: StreamFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, frame);
    }
}
