//! Core event and subscription types
//!
//! All types use camelCase JSON serialization for wire compatibility;
//! the event type discriminator serializes as `"type"`.

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};

/// A producer-supplied event, not yet assigned identity or position
///
/// Validated before acceptance; `id`, `ts`, and `sequence` are assigned
/// by the bus adapter at publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    /// Origin identifier (e.g., "agent-1")
    pub source: String,

    /// Event type discriminator (e.g., "task.complete")
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Opaque correlation token; generated at publish when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl InboundEvent {
    /// Create a new inbound event without a correlation id
    pub fn new(
        source: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            source: source.into(),
            event_type: event_type.into(),
            payload,
            correlation_id: None,
        }
    }

    /// Attach a correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Validate the event against the acceptance invariants
    ///
    /// Checks all constraints and reports the first violated one; an
    /// event is either fully accepted or fully rejected. The payload
    /// ceiling is the serialized byte length.
    pub fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(EventError::Validation {
                field: "source",
                reason: "must be non-empty".to_string(),
            });
        }
        if self.event_type.trim().is_empty() {
            return Err(EventError::Validation {
                field: "type",
                reason: "must be non-empty".to_string(),
            });
        }
        if let Some(ref token) = self.correlation_id {
            if token.is_empty() || token.len() > 128 {
                return Err(EventError::Validation {
                    field: "correlationId",
                    reason: "must be 1..=128 characters".to_string(),
                });
            }
            if token.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(EventError::Validation {
                    field: "correlationId",
                    reason: "must not contain whitespace or control characters".to_string(),
                });
            }
        }
        let payload_len = serde_json::to_vec(&self.payload)?.len();
        if payload_len > max_payload_bytes {
            return Err(EventError::Validation {
                field: "payload",
                reason: format!(
                    "serialized size {} exceeds ceiling {}",
                    payload_len, max_payload_bytes
                ),
            });
        }
        Ok(())
    }

    /// Fill a missing correlation id with a generated opaque token
    pub fn ensure_correlation(&mut self) {
        if self.correlation_id.is_none() {
            self.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        }
    }
}

/// A sequenced, immutable event as stored by a bus adapter
///
/// The serialized form includes `sequence`, so an event replayed from
/// the log is byte-for-byte identical to the original stored form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Unique event identifier (evt-<uuid>, time-sortable)
    pub id: String,

    /// Origin identifier
    pub source: String,

    /// Event type discriminator
    #[serde(rename = "type")]
    pub event_type: String,

    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Correlation token, always present after publish
    pub correlation_id: String,

    /// Publish timestamp, unix milliseconds, non-decreasing per adapter
    pub ts: u64,

    /// Backend-assigned offset, strictly increasing per adapter
    pub sequence: u64,
}

impl StoredEvent {
    /// Seal a validated inbound event with backend-assigned identity
    ///
    /// The caller (a bus adapter) owns sequence assignment and timestamp
    /// monotonicity; `correlation_id` must already be filled.
    pub fn seal(event: InboundEvent, ts: u64, sequence: u64) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::now_v7()),
            source: event.source,
            event_type: event.event_type,
            payload: event.payload,
            correlation_id: event.correlation_id.unwrap_or_default(),
            ts,
            sequence,
        }
    }
}

/// How matched events reach a subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Retried HTTP POST to the subscription target URL
    Webhook,
    /// Push to realtime streaming connections on the target channel
    Stream,
}

/// Retry budget and backoff shape for webhook delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts before dead-lettering
    pub max_attempts: u32,

    /// First backoff delay, milliseconds
    pub base_delay_ms: u64,

    /// Backoff ceiling, milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// A registered subscriber: target, rule, delivery mode, retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// Unique subscription identifier (sub-<uuid>)
    pub id: String,

    /// Webhook URL or stream channel name, depending on `mode`
    pub target: String,

    /// Delivery mode
    pub mode: DeliveryMode,

    /// Rule predicate source; compiles successfully at registration
    pub rule: String,

    /// Retry budget (webhook mode)
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Creation timestamp, unix milliseconds
    pub created_at: u64,

    /// Disabled subscriptions stay registered but match nothing
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Subscription {
    /// Create a subscription with a generated id and current timestamp
    ///
    /// Does not compile the rule; the registry owns compile-at-write.
    pub fn new(
        target: impl Into<String>,
        mode: DeliveryMode,
        rule: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            target: target.into(),
            mode,
            rule: rule.into(),
            retry_policy,
            created_at: now_millis(),
            active: true,
        }
    }
}

/// Outcome of a single delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttemptOutcome {
    /// 2xx response; terminal
    Success,
    /// Timeout, connection failure, or 5xx; drives backoff retry
    TransientFailure,
    /// 4xx client rejection; immediate dead-letter
    PermanentFailure,
}

/// Record of one dispatch try for an (event, subscription) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub subscription_id: String,
    pub event_id: String,
    /// 1-based attempt counter
    pub attempt_number: u32,
    pub outcome: AttemptOutcome,
    /// Scheduled retry time, unix milliseconds; None for terminal outcomes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
}

/// An exhausted delivery, retained for inspection and manual replay
///
/// Carries the full stored event so replay can re-enqueue it as a
/// fresh pending task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub event: StoredEvent,
    pub subscription_id: String,
    /// Every attempt in order, including the final one
    pub attempts: Vec<DeliveryAttempt>,
    pub final_error: String,
    /// Unix milliseconds when the retry budget ran out
    pub dead_lettered_at: u64,
}

/// Current time in unix milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_well_formed_event() {
        let event = InboundEvent::new(
            "agent-1",
            "task.complete",
            serde_json::json!({"duration": 650}),
        );
        assert!(event.validate(65536).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_source() {
        let event = InboundEvent::new("", "task.complete", serde_json::json!({}));
        let err = event.validate(65536).unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation { field: "source", .. }
        ));
    }

    #[test]
    fn test_validate_rejects_blank_type() {
        let event = InboundEvent::new("agent-1", "   ", serde_json::json!({}));
        let err = event.validate(65536).unwrap_err();
        assert!(matches!(err, EventError::Validation { field: "type", .. }));
    }

    #[test]
    fn test_validate_rejects_oversize_payload() {
        let blob = "x".repeat(200);
        let event = InboundEvent::new("agent-1", "blob", serde_json::json!({ "data": blob }));
        let err = event.validate(64).unwrap_err();
        assert!(matches!(
            err,
            EventError::Validation { field: "payload", .. }
        ));
    }

    #[test]
    fn test_validate_rejects_malformed_correlation() {
        let event = InboundEvent::new("a", "b", serde_json::json!({}))
            .with_correlation("has whitespace");
        assert!(event.validate(65536).is_err());

        let event = InboundEvent::new("a", "b", serde_json::json!({}))
            .with_correlation("x".repeat(129));
        assert!(event.validate(65536).is_err());
    }

    #[test]
    fn test_ensure_correlation_fills_missing_token() {
        let mut event = InboundEvent::new("a", "b", serde_json::json!({}));
        event.ensure_correlation();
        let token = event.correlation_id.clone().unwrap();
        assert!(!token.is_empty());
        assert!(event.validate(65536).is_ok());

        // An existing token is never overwritten
        let mut event = InboundEvent::new("a", "b", serde_json::json!({})).with_correlation("corr-1");
        event.ensure_correlation();
        assert_eq!(event.correlation_id.as_deref(), Some("corr-1"));
    }

    #[test]
    fn test_seal_assigns_identity() {
        let mut inbound = InboundEvent::new(
            "agent-1",
            "task.complete",
            serde_json::json!({"duration": 650}),
        );
        inbound.ensure_correlation();
        let stored = StoredEvent::seal(inbound, 1_700_000_000_000, 7);

        assert!(stored.id.starts_with("evt-"));
        assert_eq!(stored.source, "agent-1");
        assert_eq!(stored.event_type, "task.complete");
        assert_eq!(stored.ts, 1_700_000_000_000);
        assert_eq!(stored.sequence, 7);
        assert!(!stored.correlation_id.is_empty());
    }

    #[test]
    fn test_event_ids_are_time_sortable() {
        let a = StoredEvent::seal(
            InboundEvent::new("s", "t", serde_json::json!({})).with_correlation("c"),
            1,
            1,
        );
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = StoredEvent::seal(
            InboundEvent::new("s", "t", serde_json::json!({})).with_correlation("c"),
            2,
            2,
        );
        assert!(a.id < b.id);
    }

    #[test]
    fn test_stored_event_serialization_roundtrip() {
        let stored = StoredEvent::seal(
            InboundEvent::new("agent-1", "task.complete", serde_json::json!({"duration": 650}))
                .with_correlation("corr-42"),
            1_700_000_000_000,
            3,
        );

        let json = serde_json::to_string(&stored).unwrap();
        assert!(json.contains("\"type\":\"task.complete\""));
        assert!(json.contains("\"correlationId\":\"corr-42\""));
        assert!(json.contains("\"sequence\":3"));

        let parsed: StoredEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, stored);
    }

    #[test]
    fn test_subscription_defaults() {
        let sub = Subscription::new(
            "https://example.com/hook",
            DeliveryMode::Webhook,
            "type == \"task.complete\"",
            RetryPolicy::default(),
        );
        assert!(sub.id.starts_with("sub-"));
        assert!(sub.active);
        assert_eq!(sub.retry_policy.max_attempts, 5);
        assert!(sub.created_at > 0);
    }

    #[test]
    fn test_subscription_serialization() {
        let sub = Subscription::new(
            "deploys",
            DeliveryMode::Stream,
            "source == \"ci\"",
            RetryPolicy::default(),
        );
        let json = serde_json::to_string(&sub).unwrap();
        assert!(json.contains("\"mode\":\"stream\""));
        assert!(json.contains("\"retryPolicy\""));

        let parsed: Subscription = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, sub.id);
        assert_eq!(parsed.mode, DeliveryMode::Stream);
    }

    #[test]
    fn test_attempt_outcome_serialization() {
        let attempt = DeliveryAttempt {
            subscription_id: "sub-1".to_string(),
            event_id: "evt-1".to_string(),
            attempt_number: 2,
            outcome: AttemptOutcome::TransientFailure,
            next_retry_at: Some(1_700_000_001_000),
        };
        let json = serde_json::to_string(&attempt).unwrap();
        assert!(json.contains("\"outcome\":\"transientFailure\""));
        assert!(json.contains("\"attemptNumber\":2"));
    }
}
