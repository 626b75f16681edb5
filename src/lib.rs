//! # eventbridge
//!
//! Event ingestion and fan-out bridge: producers publish typed events;
//! the bridge durably sequences them, matches them against registered
//! subscriptions via a rule predicate, and delivers matches through
//! retried webhook push and rate-limited realtime streaming.
//!
//! ## Quick Start
//!
//! ```rust
//! use eventbridge::{
//!     BridgeConfig, DeliveryMode, EventBridge, InboundEvent, MemoryAdapter, RetryPolicy,
//! };
//!
//! # async fn example() -> eventbridge::Result<()> {
//! // Create a bridge over the in-memory backend
//! let bridge = EventBridge::new(MemoryAdapter::default(), BridgeConfig::default())?;
//! bridge.start().await;
//!
//! // Register a webhook subscription; the rule compiles at write time
//! bridge.create_subscription(
//!     "https://example.com/hook",
//!     DeliveryMode::Webhook,
//!     "type == \"task.complete\" and payload.duration > 500",
//!     RetryPolicy::default(),
//! ).await?;
//!
//! // Publish an event
//! let stored = bridge.publish(InboundEvent::new(
//!     "agent-1",
//!     "task.complete",
//!     serde_json::json!({"duration": 650}),
//! )).await?;
//!
//! println!("Published: {} at sequence {}", stored.id, stored.sequence);
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **memory** — fixed-capacity ring buffer for testing and
//!   single-process use; volatile by design
//! - **nats** — NATS JetStream append-only log for durable sequencing
//!   with consumer-group cursors and a trim policy
//!
//! ## Architecture
//!
//! - **BusAdapter** trait — storage/transport abstraction both
//!   backends implement
//! - **SubscriptionRegistry** — CRUD with compile-at-write rules
//! - **RuleExpr** — predicate tree compiled from the filter DSL
//! - **WebhookDispatcher** — per-subscription FIFO delivery with
//!   backoff retry and dead-lettering
//! - **FanoutHub** — per-connection rate-limited streaming with gap
//!   markers
//! - **EventBridge** — composition root wiring the routing pipelines

pub mod adapter;
pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod rule;
pub mod state;
pub mod types;

// Re-export core types
pub use adapter::{BackendInfo, BusAdapter, EventStream};
pub use bridge::{EventBridge, DISPATCHER_CURSOR, FANOUT_CURSOR};
pub use config::{BridgeConfig, DispatchConfig, FanoutConfig, MemoryConfig, NatsConfig};
pub use dispatch::{DeliveryError, DeliveryState, DeliveryTransport, HttpTransport, WebhookDispatcher};
pub use dlq::{DeadLetterStore, MemoryDeadLetterStore};
pub use error::{EventError, Result};
pub use fanout::{FanoutHub, StreamConnection, StreamFrame};
pub use registry::{CompiledSubscription, SubscriptionRegistry};
pub use rule::{compile as compile_rule, RuleExpr};
pub use state::{FileSubscriptionStore, MemorySubscriptionStore, SubscriptionStore};
pub use types::{
    AttemptOutcome, DeadLetter, DeliveryAttempt, DeliveryMode, InboundEvent, RetryPolicy,
    StoredEvent, Subscription,
};

// Re-export backends for convenience
pub use adapter::memory::MemoryAdapter;
pub use adapter::nats::{NatsAdapter, NatsEventStream};
