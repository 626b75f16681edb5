//! Configuration for the bridge and its components
//!
//! Every tuning decision the design leaves open lives here: trim
//! limits, rate-limiter parameters, queue depths, and timeouts are
//! configuration, not constants.

use std::time::Duration;

/// Top-level bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Serialized payload ceiling for inbound events, bytes
    pub max_event_bytes: usize,

    /// `list_recent` limit when the caller passes none
    pub default_list_limit: usize,

    /// Hard cap on `list_recent` limits
    pub max_list_limit: usize,

    /// Webhook dispatcher settings
    pub dispatch: DispatchConfig,

    /// Realtime fan-out settings
    pub fanout: FanoutConfig,

    /// Pause before re-reading a failed pipeline stream
    pub pipeline_retry_delay: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_event_bytes: 65536,
            default_list_limit: 50,
            max_list_limit: 500,
            dispatch: DispatchConfig::default(),
            fanout: FanoutConfig::default(),
            pipeline_retry_delay: Duration::from_secs(1),
        }
    }
}

/// In-memory adapter configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Ring capacity; the oldest event is evicted on overflow
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// NATS JetStream adapter configuration
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL, e.g. "nats://127.0.0.1:4222"
    pub url: String,

    /// JetStream stream name
    pub stream_name: String,

    /// Subject the single event log publishes to
    pub subject: String,

    /// Retention: max retained entries (0 = unlimited)
    pub max_events: i64,

    /// Retention: max retained bytes (0 = unlimited)
    pub max_bytes: i64,

    /// Retention: max entry age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Connection timeout, seconds
    pub connect_timeout_secs: u64,

    /// Request timeout, seconds; also bounds history fetches
    pub request_timeout_secs: u64,

    /// Optional auth token
    pub token: Option<String>,

    /// Keep the stream in memory instead of on disk
    pub in_memory_storage: bool,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "EVENTBRIDGE".to_string(),
            subject: "eventbridge.events".to_string(),
            max_events: 100_000,
            max_bytes: 0,
            max_age_secs: 0,
            connect_timeout_secs: 5,
            request_timeout_secs: 5,
            token: None,
            in_memory_storage: false,
        }
    }
}

/// Webhook dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Bound on a single outbound delivery attempt
    pub request_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Realtime fan-out configuration
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Token bucket refill rate, tokens per second
    pub refill_per_sec: f64,

    /// Token bucket burst capacity
    pub burst: u32,

    /// Buffered events per connection before drop-oldest applies
    pub queue_depth: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            refill_per_sec: 20.0,
            burst: 100,
            queue_depth: 256,
        }
    }
}
