use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use super::{KvStore, SetMode, SetOptions};
use crate::core::errors::{CoordError, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(value: &str, options: &SetOptions, now: Instant) -> Result<Self> {
        let expires_at = match options.ttl {
            Some(ttl) => Some(now.checked_add(ttl).ok_or_else(|| {
                CoordError::configuration_field(format!("ttl {:?} is out of range", ttl), "ttl")
            })?),
            None => None,
        };
        Ok(Self {
            value: value.to_string(),
            expires_at,
        })
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process KV store. The dashmap shard lock held by the entry API makes
/// the if-absent write atomic; it is never held across an await.
#[derive(Debug, Clone, Default)]
pub struct MemoryKvStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!(purged, "Purged expired entries");
        }
        purged
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let now = Instant::now();
        let stored = StoredValue::new(value, &options, now)?;

        let accepted = match self.entries.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(stored);
                true
            }
            Entry::Occupied(mut slot) => {
                if options.mode == SetMode::Always || slot.get().is_expired(now) {
                    slot.insert(stored);
                    true
                } else {
                    false
                }
            }
        };
        Ok(accepted)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        // the read guard is gone by now, so removing cannot deadlock the shard
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, v)| !v.is_expired(now))
            .unwrap_or(false))
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove_if(key, |_, v| !v.is_expired(now) && v.value == expected)
            .is_some())
    }
}
