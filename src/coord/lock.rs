//! Slot-scoped mutual exclusion on top of a [`KvStore`].
//!
//! The only authority on who owns a slot is the outcome of the store's
//! conditional write. Reads (`check`, the holder snapshot returned on
//! contention) are diagnostics and may be stale by the time they return.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coord::types::{AcquireOutcome, LockKey, LockMetadata, LockOptions};
use crate::core::config::{validate_key_prefix, validate_ttl, CoordinationConfig};
use crate::core::errors::{CoordError, Result};
use crate::storage::{KvStore, SetOptions};

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KvStore>,
    config: Arc<CoordinationConfig>,
}

impl LockManager {
    pub fn new(store: Arc<dyn KvStore>, config: Arc<CoordinationConfig>) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Key for (owner, thread) under `prefix`, or the configured prefix
    pub fn lock_key(&self, owner_id: &str, thread_id: &str, prefix: Option<&str>) -> LockKey {
        LockKey::derive(
            prefix.unwrap_or(&self.config.key_prefix),
            owner_id,
            thread_id,
        )
    }

    /// Try to take the slot. Never waits and never retries.
    pub async fn acquire(
        &self,
        owner_id: &str,
        thread_id: &str,
        options: &LockOptions,
    ) -> Result<AcquireOutcome> {
        if let Some(prefix) = options.key_prefix.as_deref() {
            validate_key_prefix(prefix)?;
        }
        let ttl_seconds = options.ttl_seconds.unwrap_or(self.config.default_ttl_seconds);
        if ttl_seconds == 0 {
            return Err(CoordError::configuration_field(
                "lock ttl cannot be zero",
                "ttl_seconds",
            ));
        }
        validate_ttl(ttl_seconds, "ttl_seconds")?;

        let key = self.lock_key(owner_id, thread_id, options.key_prefix.as_deref());
        let metadata = LockMetadata {
            lock_id: Uuid::new_v4().to_string(),
            acquired_at: Utc::now(),
            ttl_seconds,
            owner_id: owner_id.to_string(),
            thread_id: thread_id.to_string(),
            process_id: self.config.instance_id.clone(),
            metadata: options.metadata.clone(),
        };
        let encoded = serde_json::to_string(&metadata)?;

        if self
            .store
            .set(key.as_str(), &encoded, SetOptions::if_absent(ttl_seconds))
            .await?
        {
            info!(lock_key = %key, lock_id = %metadata.lock_id, ttl_seconds, "Lock acquired");
            return Ok(AcquireOutcome::Acquired { metadata });
        }

        let active = match self.check_key(&key).await {
            Ok(active) => active,
            Err(e) => {
                debug!(lock_key = %key, error = %e, "Could not read current holder");
                None
            }
        };
        warn!(
            lock_key = %key,
            holder = ?active.as_ref().map(|m| m.lock_id.as_str()),
            "Lock already held"
        );
        Ok(AcquireOutcome::Held { active })
    }

    /// Delete the slot's entry whoever holds it. Idempotent; reports whether a
    /// live entry was actually removed.
    pub async fn release(&self, owner_id: &str, thread_id: &str) -> Result<bool> {
        self.release_key(&self.lock_key(owner_id, thread_id, None))
            .await
    }

    pub async fn release_key(&self, key: &LockKey) -> Result<bool> {
        let released = self.store.delete(key.as_str()).await?;
        if released {
            info!(lock_key = %key, "Lock released");
        } else {
            debug!(lock_key = %key, "Release found no live lock");
        }
        Ok(released)
    }

    /// Release only while the entry still belongs to acquisition `lock_id`.
    /// After a TTL lapse the slot may have a new holder that must survive.
    pub async fn release_owned(&self, key: &LockKey, lock_id: &str) -> Result<bool> {
        let Some(raw) = self.store.get(key.as_str()).await? else {
            debug!(lock_key = %key, "Lock already gone before release");
            return Ok(false);
        };
        let current: LockMetadata = serde_json::from_str(&raw)?;
        if current.lock_id != lock_id {
            warn!(
                lock_key = %key,
                ours = lock_id,
                holder = %current.lock_id,
                "Lock changed hands after expiry, leaving it alone"
            );
            return Ok(false);
        }
        let released = self.store.delete_if_equals(key.as_str(), &raw).await?;
        if released {
            info!(lock_key = %key, lock_id, "Lock released");
        }
        Ok(released)
    }

    /// Snapshot of the current holder. Never use this to decide ownership.
    pub async fn check(&self, owner_id: &str, thread_id: &str) -> Result<Option<LockMetadata>> {
        self.check_key(&self.lock_key(owner_id, thread_id, None))
            .await
    }

    pub async fn check_key(&self, key: &LockKey) -> Result<Option<LockMetadata>> {
        match self.store.get(key.as_str()).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}
