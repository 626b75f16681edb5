//! Subscription persistence boundary
//!
//! Pluggable storage for subscription records so registrations survive
//! process restarts. Load goes through
//! [`SubscriptionRegistry::restore`](crate::registry::SubscriptionRegistry::restore),
//! which re-compiles every rule, so a store can never resurrect an
//! uncompilable subscription.

use crate::error::{EventError, Result};
use crate::types::Subscription;
use std::path::{Path, PathBuf};

/// Trait for persisting subscription records
pub trait SubscriptionStore: Send + Sync {
    /// Save all subscriptions, atomically replacing the previous set
    fn save(&self, subscriptions: &[Subscription]) -> Result<()>;

    /// Load all subscriptions
    fn load(&self) -> Result<Vec<Subscription>>;
}

/// JSON file-based subscription store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileSubscriptionStore {
    path: PathBuf,
}

impl FileSubscriptionStore {
    /// Create a store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SubscriptionStore for FileSubscriptionStore {
    fn save(&self, subscriptions: &[Subscription]) -> Result<()> {
        let json = serde_json::to_string_pretty(subscriptions)?;

        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                EventError::Config(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            EventError::Config(format!(
                "Failed to write store file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            EventError::Config(format!(
                "Failed to rename store file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "Subscriptions saved");
        Ok(())
    }

    fn load(&self) -> Result<Vec<Subscription>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            EventError::Config(format!(
                "Failed to read store file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let subscriptions: Vec<Subscription> = serde_json::from_str(&json).map_err(|e| {
            EventError::Config(format!(
                "Failed to parse store file {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(
            path = %self.path.display(),
            count = subscriptions.len(),
            "Subscriptions loaded"
        );
        Ok(subscriptions)
    }
}

/// In-memory subscription store for testing
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: std::sync::RwLock<Vec<Subscription>>,
}

impl SubscriptionStore for MemorySubscriptionStore {
    fn save(&self, subscriptions: &[Subscription]) -> Result<()> {
        let mut stored = self.subscriptions.write().map_err(|e| {
            EventError::Config(format!("Failed to acquire store lock: {}", e))
        })?;
        *stored = subscriptions.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<Vec<Subscription>> {
        let stored = self.subscriptions.read().map_err(|e| {
            EventError::Config(format!("Failed to acquire store lock: {}", e))
        })?;
        Ok(stored.clone())
    }
}
