//! NATS JetStream event backend — the durable append-only log
//!
//! Wraps a JetStream stream as the bridge's durable backend: publish
//! is an atomic append to a single subject, consumer groups map to
//! durable pull consumers, and retention limits implement the
//! asynchronous, lossy trim policy. An explicit [`NatsAdapter::trim_to`]
//! purge is guarded by an offset watermark so it never removes entries
//! a registered group cursor has not yet passed.

mod stream;

pub use stream::NatsEventStream;

use crate::adapter::{BackendInfo, BusAdapter, EventStream};
use crate::config::NatsConfig;
use crate::error::{EventError, Result};
use crate::types::{now_millis, InboundEvent, StoredEvent};
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Durable-stream implementation of the bus adapter
pub struct NatsAdapter {
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    /// Publish-path state; the lock is the adapter's single
    /// serialization point for ordering
    publish_state: Mutex<PublishState>,

    /// Group cursors opened on this adapter, for the trim watermark
    groups: Mutex<HashSet<String>>,

    config: Arc<NatsConfig>,
}

/// Retained sequence window summary
#[derive(Debug, Clone, Copy)]
struct StreamWindow {
    messages: u64,
    bytes: u64,
    first_sequence: u64,
    last_sequence: u64,
}

struct PublishState {
    /// Last sequence this adapter appended (the expected-last-sequence
    /// guard keeps it authoritative)
    last_sequence: u64,
    /// Last assigned timestamp, for monotonicity under clock skew
    last_ts: u64,
}

impl NatsAdapter {
    /// Connect to NATS and ensure the event log stream exists
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| EventError::BackendUnavailable(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client);
        let mut stream = ensure_stream(&jetstream, &config).await?;

        let last_sequence = stream
            .info()
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!("failed to read stream info: {}", e))
            })?
            .state
            .last_sequence;

        Ok(Self {
            jetstream,
            stream: Mutex::new(stream),
            publish_state: Mutex::new(PublishState {
                last_sequence,
                last_ts: 0,
            }),
            groups: Mutex::new(HashSet::new()),
            config: Arc::new(config),
        })
    }

    /// Retained sequence window from the server
    async fn stream_state(&self) -> Result<StreamWindow> {
        let mut stream = self.stream.lock().await;
        let info = stream.info().await.map_err(|e| {
            EventError::BackendUnavailable(format!("failed to read stream info: {}", e))
        })?;
        Ok(StreamWindow {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
        })
    }

    /// Purge retained entries below `sequence`, bounded by the group
    /// cursor watermark
    ///
    /// The purge never passes the minimum acknowledged floor of the
    /// group cursors opened on this adapter, so a slow consumer keeps
    /// its unread entries. Returns the number of purged entries.
    pub async fn trim_to(&self, sequence: u64) -> Result<u64> {
        let groups: Vec<String> = self.groups.lock().await.iter().cloned().collect();

        let mut stream = self.stream.lock().await;
        let mut watermark = u64::MAX;
        for group in &groups {
            let mut consumer = stream
                .get_consumer::<jetstream::consumer::pull::Config>(group)
                .await
                .map_err(|e| {
                    EventError::BackendUnavailable(format!(
                        "failed to look up consumer '{}': {}",
                        group, e
                    ))
                })?;
            let info = consumer.info().await.map_err(|e| {
                EventError::BackendUnavailable(format!(
                    "failed to read consumer '{}' info: {}",
                    group, e
                ))
            })?;
            watermark = watermark.min(info.ack_floor.stream_sequence + 1);
        }
        let allowed = sequence.min(watermark);

        let response = stream.purge().sequence(allowed).await.map_err(|e| {
            EventError::BackendUnavailable(format!("purge failed: {}", e))
        })?;

        tracing::info!(
            requested = sequence,
            allowed,
            purged = response.purged,
            "Stream trimmed"
        );
        Ok(response.purged)
    }
}

#[async_trait]
impl BusAdapter for NatsAdapter {
    async fn publish(&self, event: InboundEvent) -> Result<StoredEvent> {
        let mut state = self.publish_state.lock().await;
        let sequence = state.last_sequence + 1;
        let ts = now_millis().max(state.last_ts);

        let stored = StoredEvent::seal(event, ts, sequence);
        let payload = serde_json::to_vec(&stored)?;

        // Pre-assigning the offset requires the append to land exactly
        // there; the expected-last-sequence header makes the server
        // reject anything else
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(
            "Nats-Expected-Last-Sequence",
            state.last_sequence.to_string().as_str(),
        );

        let ack = self
            .jetstream
            .publish_with_headers(
                self.config.subject.clone(),
                headers,
                Bytes::from(payload),
            )
            .await
            .map_err(|e| EventError::BackendUnavailable(format!("publish failed: {}", e)))?
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!("publish ack failed: {}", e))
            })?;

        if ack.sequence != sequence {
            // Another writer owns the stream; resync and fail fast —
            // the producer owns the retry
            state.last_sequence = ack.sequence;
            return Err(EventError::BackendUnavailable(format!(
                "sequence conflict: expected {}, log assigned {}",
                sequence, ack.sequence
            )));
        }

        state.last_sequence = sequence;
        state.last_ts = ts;
        drop(state);

        tracing::debug!(
            event_id = %stored.id,
            event_type = %stored.event_type,
            source = %stored.source,
            sequence = stored.sequence,
            adapter = "nats",
            "Event published"
        );

        Ok(stored)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let state = self.stream_state().await?;
        if state.messages == 0 {
            return Ok(Vec::new());
        }

        // Fetch the newest window; the trim horizon bounds it silently
        let start = state
            .first_sequence
            .max(state.last_sequence.saturating_sub(limit as u64 - 1));
        let window = (state.last_sequence - start + 1) as usize;

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(jetstream::consumer::pull::Config {
                deliver_policy: jetstream::consumer::DeliverPolicy::ByStartSequence {
                    start_sequence: start,
                },
                ack_policy: jetstream::consumer::AckPolicy::None,
                filter_subject: self.config.subject.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!("failed to create history consumer: {}", e))
            })?;

        let batch = consumer
            .fetch()
            .max_messages(window)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!("failed to fetch history: {}", e))
            })?;

        use futures::StreamExt;
        let mut events = Vec::with_capacity(window);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    match serde_json::from_slice::<StoredEvent>(&msg.payload) {
                        Ok(event) => events.push(event),
                        Err(e) => {
                            tracing::warn!(error = %e, "Skipping undecodable log entry")
                        }
                    }
                    if events.len() >= window {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error fetching history message");
                    break;
                }
            }
        }

        events.reverse();
        Ok(events)
    }

    async fn subscribe_stream(&self, from: Option<u64>) -> Result<Box<dyn EventStream>> {
        let deliver_policy = match from {
            Some(requested) => {
                let state = self.stream_state().await?;
                // Replay below the trim horizon fails; the caller must
                // restart from the earliest retained offset
                if state.messages > 0 && requested < state.first_sequence {
                    return Err(EventError::OffsetEvicted {
                        requested,
                        earliest: state.first_sequence,
                    });
                }
                jetstream::consumer::DeliverPolicy::ByStartSequence {
                    start_sequence: requested,
                }
            }
            None => jetstream::consumer::DeliverPolicy::New,
        };

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(jetstream::consumer::pull::Config {
                deliver_policy,
                ack_policy: jetstream::consumer::AckPolicy::None,
                filter_subject: self.config.subject.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!("failed to create replay consumer: {}", e))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            EventError::BackendUnavailable(format!("failed to open replay stream: {}", e))
        })?;

        Ok(Box::new(NatsEventStream::ephemeral(messages)))
    }

    async fn subscribe_group(&self, group: &str) -> Result<Box<dyn EventStream>> {
        let consumer = self
            .stream
            .lock()
            .await
            .get_or_create_consumer(
                group,
                jetstream::consumer::pull::Config {
                    durable_name: Some(group.to_string()),
                    filter_subject: self.config.subject.clone(),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    deliver_policy: jetstream::consumer::DeliverPolicy::New,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                EventError::BackendUnavailable(format!(
                    "failed to create group consumer '{}': {}",
                    group, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| {
            EventError::BackendUnavailable(format!(
                "failed to open group stream '{}': {}",
                group, e
            ))
        })?;

        self.groups.lock().await.insert(group.to_string());

        tracing::info!(group, "Group cursor opened");
        Ok(Box::new(NatsEventStream::durable(messages)))
    }

    async fn info(&self) -> Result<BackendInfo> {
        let state = self.stream_state().await?;
        Ok(BackendInfo {
            backend: "nats".to_string(),
            messages: state.messages,
            bytes: state.bytes,
            first_sequence: state.first_sequence,
            last_sequence: state.last_sequence,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream exists with the configured trim limits
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = if config.in_memory_storage {
        jetstream::stream::StorageType::Memory
    } else {
        jetstream::stream::StorageType::File
    };

    let max_age = if config.max_age_secs > 0 {
        Duration::from_secs(config.max_age_secs)
    } else {
        Duration::ZERO
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: vec![config.subject.clone()],
        storage,
        max_messages: config.max_events,
        max_bytes: config.max_bytes,
        max_age,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(stream_config).await.map_err(|e| {
        EventError::BackendUnavailable(format!(
            "failed to create/get stream '{}': {}",
            config.stream_name, e
        ))
    })?;

    tracing::info!(
        stream = %config.stream_name,
        subject = %config.subject,
        "JetStream event log ready"
    );

    Ok(stream)
}
