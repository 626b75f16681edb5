//! Webhook dispatcher — retried delivery with dead-lettering
//!
//! Each webhook subscription gets one worker task and a FIFO queue, so
//! deliveries for a subscription stay in event-sequence order while
//! different subscriptions proceed independently. A delivery task walks
//! the state machine `Pending → InFlight → {Delivered | Retrying |
//! DeadLettered}`; transient failures back off exponentially with
//! jitter, permanent failures dead-letter immediately, and exhausting
//! the retry budget records a [`DeadLetter`].
//!
//! Outbound calls go through the [`DeliveryTransport`] seam; the
//! bundled [`HttpTransport`] posts the serialized event with a bounded
//! timeout, and tests substitute an in-memory transport. Backoff
//! delays are tokio timers, so tests drive a virtual clock instead of
//! waiting on real time.

use crate::config::DispatchConfig;
use crate::dlq::DeadLetterStore;
use crate::error::{EventError, Result};
use crate::types::{
    now_millis, AttemptOutcome, DeadLetter, DeliveryAttempt, RetryPolicy, StoredEvent,
    Subscription,
};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Outcome classification for a single delivery attempt
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// Timeout, connection failure, or 5xx — drives backoff retry
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// 4xx client rejection — the request is malformed for this
    /// subscriber; dead-letter immediately
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Delivery task lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Retrying,
    DeadLettered,
}

/// Outbound delivery seam
///
/// The dispatcher is transport-agnostic; implementations classify
/// every failure as transient or permanent.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Attempt one delivery of `event` to `target`
    async fn deliver(
        &self,
        target: &str,
        event: &StoredEvent,
    ) -> std::result::Result<(), DeliveryError>;
}

/// HTTP POST transport with a bounded per-attempt timeout
///
/// Sends the serialized stored event as the JSON body and the event's
/// correlation id in the `X-Correlation-Id` header.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| EventError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliveryTransport for HttpTransport {
    async fn deliver(
        &self,
        target: &str,
        event: &StoredEvent,
    ) -> std::result::Result<(), DeliveryError> {
        let response = self
            .client
            .post(target)
            .header("X-Correlation-Id", &event.correlation_id)
            .json(event)
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(DeliveryError::Permanent(format!("HTTP {}", status.as_u16())))
        } else {
            Err(DeliveryError::Transient(format!("HTTP {}", status.as_u16())))
        }
    }
}

/// Backoff delay for the given attempt: `min(base * 2^(n-1) + jitter, max)`
///
/// Jitter is uniform in `[0, base)` to spread retries across
/// subscriptions.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let jitter = if policy.base_delay_ms > 0 {
        rand::thread_rng().gen_range(0..policy.base_delay_ms)
    } else {
        0
    };
    backoff_delay_with_jitter(policy, attempt, jitter)
}

fn backoff_delay_with_jitter(policy: &RetryPolicy, attempt: u32, jitter_ms: u64) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let exponential = policy.base_delay_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(
        exponential
            .saturating_add(jitter_ms)
            .min(policy.max_delay_ms),
    )
}

struct DeliveryTask {
    subscription: Subscription,
    event: StoredEvent,
}

struct Worker {
    queue: mpsc::UnboundedSender<DeliveryTask>,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Per-subscription webhook delivery engine
pub struct WebhookDispatcher {
    transport: Arc<dyn DeliveryTransport>,
    dead_letters: Arc<dyn DeadLetterStore>,
    workers: Mutex<HashMap<String, Worker>>,
}

impl WebhookDispatcher {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        dead_letters: Arc<dyn DeadLetterStore>,
    ) -> Self {
        Self {
            transport,
            dead_letters,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a delivery for a matched (event, subscription) pair
    ///
    /// Tasks for the same subscription are delivered FIFO in enqueue
    /// order; the caller enqueues in event-sequence order.
    pub async fn enqueue(&self, subscription: Subscription, event: StoredEvent) {
        let mut workers = self.workers.lock().await;
        let worker = workers
            .entry(subscription.id.clone())
            .or_insert_with(|| self.spawn_worker(&subscription.id));

        tracing::debug!(
            subscription_id = %subscription.id,
            event_id = %event.id,
            state = ?DeliveryState::Pending,
            "Delivery queued"
        );

        if worker.queue.send(DeliveryTask { subscription, event }).is_err() {
            tracing::warn!("Delivery worker gone; task dropped");
        }
    }

    /// Cancel a subscription's worker, abandoning queued and in-flight
    /// tasks without scheduling retries
    pub async fn cancel(&self, subscription_id: &str) {
        let worker = self.workers.lock().await.remove(subscription_id);
        if let Some(worker) = worker {
            let _ = worker.cancel.send(true);
            tracing::debug!(subscription_id, "Delivery worker cancelled");
        }
    }

    /// Cancel every worker
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        for (_, worker) in workers.drain() {
            let _ = worker.cancel.send(true);
            worker.handle.abort();
        }
    }

    fn spawn_worker(&self, subscription_id: &str) -> Worker {
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let transport = self.transport.clone();
        let dead_letters = self.dead_letters.clone();
        let subscription_id = subscription_id.to_string();

        let handle = tokio::spawn(async move {
            run_worker(rx, cancel_rx, transport, dead_letters).await;
            tracing::debug!(subscription_id = %subscription_id, "Delivery worker stopped");
        });

        Worker {
            queue: tx,
            cancel: cancel_tx,
            handle,
        }
    }
}

async fn run_worker(
    mut queue: mpsc::UnboundedReceiver<DeliveryTask>,
    mut cancel: watch::Receiver<bool>,
    transport: Arc<dyn DeliveryTransport>,
    dead_letters: Arc<dyn DeadLetterStore>,
) {
    loop {
        let task = tokio::select! {
            _ = cancel.changed() => return,
            task = queue.recv() => match task {
                Some(task) => task,
                None => return,
            },
        };
        deliver_with_retry(task, &mut cancel, &*transport, &*dead_letters).await;
    }
}

/// Walk one task through the delivery state machine
async fn deliver_with_retry(
    task: DeliveryTask,
    cancel: &mut watch::Receiver<bool>,
    transport: &dyn DeliveryTransport,
    dead_letters: &dyn DeadLetterStore,
) {
    let DeliveryTask {
        subscription,
        event,
    } = task;
    let policy = subscription.retry_policy.clone();
    let mut attempts: Vec<DeliveryAttempt> = Vec::new();

    for attempt_number in 1..=policy.max_attempts.max(1) {
        tracing::debug!(
            subscription_id = %subscription.id,
            event_id = %event.id,
            attempt = attempt_number,
            state = ?DeliveryState::InFlight,
            "Delivery attempt"
        );

        match transport.deliver(&subscription.target, &event).await {
            Ok(()) => {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    event_id = %event.id,
                    attempt = attempt_number,
                    state = ?DeliveryState::Delivered,
                    "Delivered"
                );
                return;
            }
            Err(DeliveryError::Permanent(reason)) => {
                attempts.push(DeliveryAttempt {
                    subscription_id: subscription.id.clone(),
                    event_id: event.id.clone(),
                    attempt_number,
                    outcome: AttemptOutcome::PermanentFailure,
                    next_retry_at: None,
                });
                dead_letter(dead_letters, &subscription, event, attempts, reason).await;
                return;
            }
            Err(DeliveryError::Transient(reason)) => {
                let exhausted = attempt_number >= policy.max_attempts.max(1);
                if exhausted {
                    attempts.push(DeliveryAttempt {
                        subscription_id: subscription.id.clone(),
                        event_id: event.id.clone(),
                        attempt_number,
                        outcome: AttemptOutcome::TransientFailure,
                        next_retry_at: None,
                    });
                    dead_letter(dead_letters, &subscription, event, attempts, reason).await;
                    return;
                }

                let delay = backoff_delay(&policy, attempt_number);
                attempts.push(DeliveryAttempt {
                    subscription_id: subscription.id.clone(),
                    event_id: event.id.clone(),
                    attempt_number,
                    outcome: AttemptOutcome::TransientFailure,
                    next_retry_at: Some(now_millis() + delay.as_millis() as u64),
                });

                tracing::debug!(
                    subscription_id = %subscription.id,
                    event_id = %event.id,
                    attempt = attempt_number,
                    delay_ms = delay.as_millis() as u64,
                    error = %reason,
                    state = ?DeliveryState::Retrying,
                    "Delivery failed, backing off"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    // A cancelled task is safely abandoned mid-backoff:
                    // no retry is scheduled and nothing is dead-lettered
                    _ = cancel.changed() => return,
                }
            }
        }
    }
}

async fn dead_letter(
    dead_letters: &dyn DeadLetterStore,
    subscription: &Subscription,
    event: StoredEvent,
    attempts: Vec<DeliveryAttempt>,
    final_error: String,
) {
    let record = DeadLetter {
        event,
        subscription_id: subscription.id.clone(),
        attempts,
        final_error,
        dead_lettered_at: now_millis(),
    };
    if let Err(e) = dead_letters.record(record).await {
        tracing::error!(
            subscription_id = %subscription.id,
            error = %e,
            "Failed to record dead letter"
        );
    }
    tracing::debug!(
        subscription_id = %subscription.id,
        state = ?DeliveryState::DeadLettered,
        "Delivery dead-lettered"
    );
}
