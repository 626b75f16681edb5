//! Composition root — the bridge that wires everything together
//!
//! [`EventBridge`] owns the bus adapter, subscription registry, webhook
//! dispatcher, and fan-out hub as one explicitly created instance with
//! a `start`/`shutdown` lifecycle. Routing runs on two independent
//! consumer-group pipelines over the sequenced event stream — the
//! `dispatcher` and `fanout` cursors — so a slow webhook target never
//! holds back realtime streaming and vice versa.

use crate::adapter::{BackendInfo, BusAdapter, EventStream};
use crate::config::BridgeConfig;
use crate::dispatch::{DeliveryTransport, HttpTransport, WebhookDispatcher};
use crate::dlq::{DeadLetterStore, MemoryDeadLetterStore};
use crate::error::{EventError, Result};
use crate::fanout::{FanoutHub, StreamConnection};
use crate::registry::SubscriptionRegistry;
use crate::types::{
    DeadLetter, DeliveryMode, InboundEvent, RetryPolicy, StoredEvent, Subscription,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Fixed logical cursor for the webhook dispatch pipeline
pub const DISPATCHER_CURSOR: &str = "dispatcher";

/// Fixed logical cursor for the realtime fan-out pipeline
pub const FANOUT_CURSOR: &str = "fanout";

/// Event ingestion and fan-out bridge over a pluggable backend
pub struct EventBridge {
    adapter: Arc<dyn BusAdapter>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<WebhookDispatcher>,
    fanout: Arc<FanoutHub>,
    dead_letters: Arc<dyn DeadLetterStore>,
    config: BridgeConfig,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EventBridge {
    /// Create a bridge with the default HTTP transport and in-memory
    /// dead letter store
    pub fn new(adapter: impl BusAdapter + 'static, config: BridgeConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.dispatch)?);
        Ok(Self::with_parts(
            Arc::new(adapter),
            transport,
            Arc::new(MemoryDeadLetterStore::default()),
            SubscriptionRegistry::new(),
            config,
        ))
    }

    /// Create a bridge from explicit parts (custom transport, dead
    /// letter store, or a registry restored from persistence)
    pub fn with_parts(
        adapter: Arc<dyn BusAdapter>,
        transport: Arc<dyn DeliveryTransport>,
        dead_letters: Arc<dyn DeadLetterStore>,
        registry: SubscriptionRegistry,
        config: BridgeConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            adapter,
            registry: Arc::new(registry),
            dispatcher: Arc::new(WebhookDispatcher::new(transport, dead_letters.clone())),
            fanout: Arc::new(FanoutHub::new(config.fanout.clone())),
            dead_letters,
            config,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the routing pipelines; idempotent
    ///
    /// Both group cursors are opened before this returns, so an event
    /// published immediately afterwards is already in their view.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }

        let dispatch_stream = self.adapter.subscribe_group(DISPATCHER_CURSOR).await;
        let fanout_stream = self.adapter.subscribe_group(FANOUT_CURSOR).await;
        if let Err(ref e) = dispatch_stream {
            tracing::warn!(error = %e, "Dispatcher cursor unavailable at start");
        }
        if let Err(ref e) = fanout_stream {
            tracing::warn!(error = %e, "Fanout cursor unavailable at start");
        }

        tasks.push(tokio::spawn(run_dispatch_pipeline(
            dispatch_stream.ok(),
            self.adapter.clone(),
            self.registry.clone(),
            self.dispatcher.clone(),
            self.shutdown.subscribe(),
            self.config.clone(),
        )));
        tasks.push(tokio::spawn(run_fanout_pipeline(
            fanout_stream.ok(),
            self.adapter.clone(),
            self.registry.clone(),
            self.fanout.clone(),
            self.shutdown.subscribe(),
            self.config.clone(),
        )));

        tracing::info!(adapter = self.adapter.name(), "Bridge started");
    }

    /// Stop pipelines, dispatcher workers, and stream connections
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.dispatcher.shutdown().await;
        self.fanout.shutdown().await;
        tracing::info!("Bridge stopped");
    }

    // ─── Ingestion & history ─────────────────────────────────────

    /// Validate and publish an inbound event
    ///
    /// Failures are returned to the producer and never retried here: a
    /// re-publish would create a duplicate-but-distinct stored event,
    /// so the idempotency decision belongs to the caller.
    pub async fn publish(&self, mut event: InboundEvent) -> Result<StoredEvent> {
        event.validate(self.config.max_event_bytes)?;
        event.ensure_correlation();
        let stored = self.adapter.publish(event).await?;
        tracing::info!(
            event_id = %stored.id,
            event_type = %stored.event_type,
            source = %stored.source,
            sequence = stored.sequence,
            "Event published"
        );
        Ok(stored)
    }

    /// Recent events, newest first; `None` uses the configured default
    /// limit, and every limit is clamped to the configured cap
    pub async fn list_recent(&self, limit: Option<usize>) -> Result<Vec<StoredEvent>> {
        let limit = limit
            .unwrap_or(self.config.default_list_limit)
            .min(self.config.max_list_limit);
        self.adapter.list_recent(limit).await
    }

    // ─── Subscriptions ───────────────────────────────────────────

    pub async fn create_subscription(
        &self,
        target: impl Into<String>,
        mode: DeliveryMode,
        rule: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Result<Subscription> {
        self.registry.create(target, mode, rule, retry_policy).await
    }

    pub async fn get_subscription(&self, id: &str) -> Option<Subscription> {
        self.registry.get(id).await
    }

    pub async fn list_subscriptions(&self) -> Vec<Subscription> {
        self.registry.list().await
    }

    /// Enable or disable a subscription; disabling cancels in-flight
    /// webhook work without scheduling retries
    pub async fn set_subscription_active(&self, id: &str, active: bool) -> Result<()> {
        self.registry.set_active(id, active).await?;
        if !active {
            self.dispatcher.cancel(id).await;
        }
        Ok(())
    }

    pub async fn update_retry_policy(&self, id: &str, policy: RetryPolicy) -> Result<()> {
        self.registry.update_retry_policy(id, policy).await
    }

    pub async fn delete_subscription(&self, id: &str) -> Result<Subscription> {
        let removed = self.registry.delete(id).await?;
        self.dispatcher.cancel(id).await;
        Ok(removed)
    }

    // ─── Realtime streaming ──────────────────────────────────────

    /// Open a streaming connection on a channel
    ///
    /// Without a replay offset the connection starts at "now" and is
    /// fed by the shared fan-out pipeline. With one, a dedicated
    /// pipeline replays the log from that offset through the channel's
    /// rules — same ordering, rate limiting, and overflow behavior —
    /// and keeps following the live tail. Replay below the durable
    /// backend's trim horizon fails with `OffsetEvicted`.
    pub async fn stream_connect(
        &self,
        channel: &str,
        replay_from: Option<u64>,
    ) -> Result<StreamConnection> {
        let Some(from) = replay_from else {
            return Ok(self.fanout.connect(channel).await);
        };

        let mut stream = self.adapter.subscribe_stream(Some(from)).await?;
        let connection = self.fanout.attach(channel, false).await;
        let connection_id = connection.id;

        let registry = self.registry.clone();
        let fanout = self.fanout.clone();
        let channel = channel.to_string();
        let mut shutdown = self.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.changed() => return,
                    next = stream.next() => match next {
                        Ok(Some(event)) => event,
                        Ok(None) => return,
                        Err(e) => {
                            tracing::warn!(
                                connection_id,
                                error = %e,
                                "Replay stream failed"
                            );
                            return;
                        }
                    },
                };

                if !fanout.is_connected(connection_id).await {
                    return;
                }

                let subscriptions = registry.active_subscriptions().await;
                let matched = subscriptions.iter().any(|compiled| {
                    compiled.subscription.mode == DeliveryMode::Stream
                        && compiled.subscription.target == channel
                        && compiled.rule.matches(&event)
                });
                if matched {
                    fanout.offer(connection_id, &event).await;
                }
            }
        });
        self.tasks.lock().await.push(handle);

        Ok(connection)
    }

    /// Close a streaming connection
    pub async fn stream_disconnect(&self, connection_id: u64) {
        self.fanout.disconnect(connection_id).await;
    }

    /// Whether a connection has observed drops since it connected
    pub async fn connection_degraded(&self, connection_id: u64) -> bool {
        self.fanout.is_degraded(connection_id).await
    }

    // ─── Dead letters ────────────────────────────────────────────

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.dead_letters.list(limit).await
    }

    pub async fn purge_dead_letters(&self) -> Result<usize> {
        self.dead_letters.purge().await
    }

    /// Re-enqueue a dead-lettered delivery as a fresh pending task
    ///
    /// The attempt count restarts from scratch. The dead letter record
    /// is consumed; if its subscription no longer exists the record is
    /// kept and the call fails.
    pub async fn replay_dead_letter(&self, event_id: &str, subscription_id: &str) -> Result<()> {
        let dead_letter = self
            .dead_letters
            .take(event_id, subscription_id)
            .await?
            .ok_or_else(|| {
                EventError::NotFound(format!(
                    "dead letter ({}, {})",
                    event_id, subscription_id
                ))
            })?;

        let Some(subscription) = self.registry.get(subscription_id).await else {
            self.dead_letters.record(dead_letter).await?;
            return Err(EventError::NotFound(format!(
                "subscription {}",
                subscription_id
            )));
        };

        tracing::info!(event_id, subscription_id, "Dead letter replayed");
        self.dispatcher.enqueue(subscription, dead_letter.event).await;
        Ok(())
    }

    // ─── Introspection ───────────────────────────────────────────

    pub async fn health(&self) -> Result<bool> {
        self.adapter.health().await
    }

    pub async fn info(&self) -> Result<BackendInfo> {
        self.adapter.info().await
    }

    /// The underlying adapter
    pub fn adapter(&self) -> &dyn BusAdapter {
        self.adapter.as_ref()
    }
}

/// Webhook routing pipeline over the `dispatcher` cursor
async fn run_dispatch_pipeline(
    mut initial: Option<Box<dyn EventStream>>,
    adapter: Arc<dyn BusAdapter>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<WebhookDispatcher>,
    mut shutdown: watch::Receiver<bool>,
    config: BridgeConfig,
) {
    loop {
        let mut stream = match initial.take() {
            Some(stream) => stream,
            None => tokio::select! {
                _ = shutdown.changed() => return,
                result = adapter.subscribe_group(DISPATCHER_CURSOR) => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dispatcher cursor unavailable, retrying");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(config.pipeline_retry_delay) => continue,
                        }
                    }
                },
            },
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                next = stream.next() => match next {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Dispatcher stream read failed");
                        break;
                    }
                },
            };

            let subscriptions = registry.active_subscriptions().await;
            for compiled in subscriptions.iter() {
                if compiled.subscription.mode == DeliveryMode::Webhook
                    && compiled.rule.matches(&event)
                {
                    dispatcher
                        .enqueue(compiled.subscription.clone(), event.clone())
                        .await;
                }
            }

            if let Err(e) = stream.ack(event.sequence).await {
                tracing::warn!(sequence = event.sequence, error = %e, "Ack failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(config.pipeline_retry_delay) => {}
        }
    }
}

/// Streaming routing pipeline over the `fanout` cursor
async fn run_fanout_pipeline(
    mut initial: Option<Box<dyn EventStream>>,
    adapter: Arc<dyn BusAdapter>,
    registry: Arc<SubscriptionRegistry>,
    fanout: Arc<FanoutHub>,
    mut shutdown: watch::Receiver<bool>,
    config: BridgeConfig,
) {
    loop {
        let mut stream = match initial.take() {
            Some(stream) => stream,
            None => tokio::select! {
                _ = shutdown.changed() => return,
                result = adapter.subscribe_group(FANOUT_CURSOR) => match result {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Fanout cursor unavailable, retrying");
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = tokio::time::sleep(config.pipeline_retry_delay) => continue,
                        }
                    }
                },
            },
        };

        loop {
            let event = tokio::select! {
                _ = shutdown.changed() => return,
                next = stream.next() => match next {
                    Ok(Some(event)) => event,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "Fanout stream read failed");
                        break;
                    }
                },
            };

            // Multiple subscriptions can share a channel; push once per
            // matched channel
            let subscriptions = registry.active_subscriptions().await;
            let channels: BTreeSet<&str> = subscriptions
                .iter()
                .filter(|compiled| {
                    compiled.subscription.mode == DeliveryMode::Stream
                        && compiled.rule.matches(&event)
                })
                .map(|compiled| compiled.subscription.target.as_str())
                .collect();
            for channel in channels {
                fanout.push(channel, &event).await;
            }

            if let Err(e) = stream.ack(event.sequence).await {
                tracing::warn!(sequence = event.sequence, error = %e, "Ack failed");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(config.pipeline_retry_delay) => {}
        }
    }
}
