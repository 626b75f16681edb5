//! Subscription registry — CRUD with compile-at-write rules
//!
//! Rules compile at registration; an uncompilable rule is rejected
//! before anything is stored, never silently disabled later. The
//! active set is served as a shared snapshot that is invalidated on
//! every write and rebuilt lazily, so per-event evaluation never
//! contends with writers and always reflects the latest committed
//! state.

use crate::error::{EventError, Result};
use crate::rule::{self, RuleExpr};
use crate::types::{DeliveryMode, RetryPolicy, Subscription};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A subscription paired with its compiled rule
#[derive(Debug)]
pub struct CompiledSubscription {
    pub subscription: Subscription,
    pub rule: RuleExpr,
}

/// Thread-safe subscription store
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    subscriptions: HashMap<String, Arc<CompiledSubscription>>,
    /// Lazily rebuilt snapshot of active subscriptions
    snapshot: Option<Arc<Vec<Arc<CompiledSubscription>>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a registry from persisted subscriptions
    ///
    /// Every rule is re-compiled; a single stale rule rejects the
    /// whole batch so a corrupt store never half-loads.
    pub fn restore(subscriptions: Vec<Subscription>) -> Result<Self> {
        let mut map = HashMap::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let rule = rule::compile(&subscription.rule)?;
            map.insert(
                subscription.id.clone(),
                Arc::new(CompiledSubscription { subscription, rule }),
            );
        }
        Ok(Self {
            inner: RwLock::new(RegistryInner {
                subscriptions: map,
                snapshot: None,
            }),
        })
    }

    /// Register a subscription, compiling its rule first
    pub async fn create(
        &self,
        target: impl Into<String>,
        mode: DeliveryMode,
        rule_source: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Result<Subscription> {
        let rule_source = rule_source.into();
        let rule = rule::compile(&rule_source)?;
        let subscription = Subscription::new(target, mode, rule_source, retry_policy);

        let mut inner = self.inner.write().await;
        inner.subscriptions.insert(
            subscription.id.clone(),
            Arc::new(CompiledSubscription {
                subscription: subscription.clone(),
                rule,
            }),
        );
        inner.snapshot = None;

        tracing::info!(
            subscription_id = %subscription.id,
            target = %subscription.target,
            mode = ?subscription.mode,
            "Subscription created"
        );
        Ok(subscription)
    }

    pub async fn get(&self, id: &str) -> Option<Subscription> {
        let inner = self.inner.read().await;
        inner
            .subscriptions
            .get(id)
            .map(|c| c.subscription.clone())
    }

    pub async fn list(&self) -> Vec<Subscription> {
        let inner = self.inner.read().await;
        inner
            .subscriptions
            .values()
            .map(|c| c.subscription.clone())
            .collect()
    }

    /// Enable or disable a subscription
    pub async fn set_active(&self, id: &str, active: bool) -> Result<()> {
        self.mutate(id, |sub| sub.active = active).await?;
        tracing::info!(subscription_id = %id, active, "Subscription toggled");
        Ok(())
    }

    /// Replace a subscription's retry policy
    pub async fn update_retry_policy(&self, id: &str, policy: RetryPolicy) -> Result<()> {
        self.mutate(id, |sub| sub.retry_policy = policy).await
    }

    /// Delete a subscription; returns it if it existed
    pub async fn delete(&self, id: &str) -> Result<Subscription> {
        let mut inner = self.inner.write().await;
        let removed = inner
            .subscriptions
            .remove(id)
            .ok_or_else(|| EventError::NotFound(format!("subscription {}", id)))?;
        inner.snapshot = None;
        tracing::info!(subscription_id = %id, "Subscription deleted");
        Ok(removed.subscription.clone())
    }

    /// Snapshot of the active subscriptions with their compiled rules
    pub async fn active_subscriptions(&self) -> Arc<Vec<Arc<CompiledSubscription>>> {
        {
            let inner = self.inner.read().await;
            if let Some(ref snapshot) = inner.snapshot {
                return snapshot.clone();
            }
        }
        let mut inner = self.inner.write().await;
        // Raced rebuilds produce the same snapshot; keep the first
        if let Some(ref snapshot) = inner.snapshot {
            return snapshot.clone();
        }
        let snapshot: Arc<Vec<Arc<CompiledSubscription>>> = Arc::new(
            inner
                .subscriptions
                .values()
                .filter(|c| c.subscription.active)
                .cloned()
                .collect(),
        );
        inner.snapshot = Some(snapshot.clone());
        snapshot
    }

    async fn mutate(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Subscription),
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let compiled = inner
            .subscriptions
            .get(id)
            .ok_or_else(|| EventError::NotFound(format!("subscription {}", id)))?;

        let mut subscription = compiled.subscription.clone();
        apply(&mut subscription);
        let rule = rule::compile(&subscription.rule)?;
        inner.subscriptions.insert(
            id.to_string(),
            Arc::new(CompiledSubscription { subscription, rule }),
        );
        inner.snapshot = None;
        Ok(())
    }
}
