//! Key-value storage layer for stepgate
//!
//! Mutual exclusion rests entirely on the atomic conditional write exposed by
//! [`KvStore`]. Two implementations are provided: an in-process store backed by
//! `dashmap` and a durable store backed by `sled`.

pub mod memory;
pub mod sled_store;

pub use memory::MemoryKvStore;
pub use sled_store::SledKvStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::errors::Result;

/// How a write treats an existing live value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SetMode {
    /// Overwrite unconditionally
    #[default]
    Always,
    /// Write only when no live (unexpired) value exists
    IfAbsent,
}

/// Options for [`KvStore::set`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetOptions {
    pub mode: SetMode,
    pub ttl: Option<Duration>,
}

impl SetOptions {
    pub fn if_absent(ttl_seconds: u64) -> Self {
        Self {
            mode: SetMode::IfAbsent,
            ttl: Some(Duration::from_secs(ttl_seconds)),
        }
    }

    pub fn always() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Minimal atomic KV contract the lock manager is built on.
///
/// Expired entries must behave exactly like absent ones for every operation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Write `value` under `key`. Returns whether the write was accepted.
    /// With [`SetMode::IfAbsent`] the check and the write must be one atomic step.
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool>;

    /// Read the live value under `key`
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Remove `key`. Returns whether a live value was actually deleted.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically remove `key` only while it still holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}
