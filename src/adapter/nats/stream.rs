//! JetStream-backed event streams

use crate::adapter::EventStream;
use crate::error::{EventError, Result};
use crate::types::StoredEvent;
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;

/// Ordered event stream over a JetStream pull consumer
///
/// Durable (group-cursor) streams hold each delivered message until
/// the caller acknowledges its offset; ephemeral replay streams
/// acknowledge nothing and `ack` is a no-op.
pub struct NatsEventStream {
    messages: jetstream::consumer::pull::Stream,

    /// Delivered-but-unacked messages by stream sequence; empty and
    /// unused for ephemeral streams
    pending: HashMap<u64, jetstream::Message>,

    manual_ack: bool,
}

impl NatsEventStream {
    /// Wrap a durable consumer stream (explicit acks)
    pub(crate) fn durable(messages: jetstream::consumer::pull::Stream) -> Self {
        Self {
            messages,
            pending: HashMap::new(),
            manual_ack: true,
        }
    }

    /// Wrap an ephemeral replay stream (no acks)
    pub(crate) fn ephemeral(messages: jetstream::consumer::pull::Stream) -> Self {
        Self {
            messages,
            pending: HashMap::new(),
            manual_ack: false,
        }
    }
}

#[async_trait]
impl EventStream for NatsEventStream {
    async fn next(&mut self) -> Result<Option<StoredEvent>> {
        loop {
            match self.messages.next().await {
                None => return Ok(None),
                Some(Err(e)) => {
                    return Err(EventError::BackendUnavailable(format!(
                        "stream read failed: {}",
                        e
                    )))
                }
                Some(Ok(msg)) => match serde_json::from_slice::<StoredEvent>(&msg.payload) {
                    Ok(event) => {
                        if self.manual_ack {
                            self.pending.insert(event.sequence, msg);
                        }
                        return Ok(Some(event));
                    }
                    Err(e) => {
                        // Foreign entries in the log are skipped, not fatal
                        tracing::warn!(error = %e, "Skipping undecodable log entry");
                        if self.manual_ack {
                            let _ = msg.ack().await;
                        }
                    }
                },
            }
        }
    }

    async fn ack(&mut self, sequence: u64) -> Result<()> {
        if let Some(msg) = self.pending.remove(&sequence) {
            msg.ack().await.map_err(|e| {
                EventError::BackendUnavailable(format!("ack failed for {}: {}", sequence, e))
            })?;
        }
        Ok(())
    }
}
