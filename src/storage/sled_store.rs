use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sled::{IVec, Tree};
use std::path::Path;
use tracing::{debug, info};

use super::{KvStore, SetMode, SetOptions};
use crate::core::errors::{CoordError, Result};

const DEFAULT_TREE: &str = "stepgate_kv";

/// On-disk envelope: sled has no native expiry, so it travels with the value.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_at_ms: Option<i64>,
}

impl Envelope {
    fn new(value: &str, options: &SetOptions) -> Result<Self> {
        let expires_at_ms = match options.ttl {
            Some(ttl) => Some(
                i64::try_from(ttl.as_millis())
                    .ok()
                    .and_then(|ms| Utc::now().timestamp_millis().checked_add(ms))
                    .ok_or_else(|| {
                        CoordError::configuration_field(
                            format!("ttl {:?} is out of range", ttl),
                            "ttl",
                        )
                    })?,
            ),
            None => None,
        };
        Ok(Self {
            value: value.to_string(),
            expires_at_ms,
        })
    }

    fn decode(raw: &IVec) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map(|at| at <= now_ms).unwrap_or(false)
    }
}

/// Durable KV store on a sled tree. Conditional writes and deletes are
/// expressed as `compare_and_swap`, so they stay atomic across every handle
/// sharing the same database.
#[derive(Clone)]
pub struct SledKvStore {
    tree: Tree,
}

impl SledKvStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        info!("Opened sled KV store at {:?}", path.as_ref());
        Self::from_db(&db)
    }

    /// Store backed by a throwaway database that is removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(&db)
    }

    pub fn from_db(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(DEFAULT_TREE)?,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.tree.flush_async().await?;
        Ok(())
    }

    /// Remove `raw` only if it is still the stored bytes
    fn swap_out(&self, key: &str, raw: &IVec) -> Result<bool> {
        Ok(self
            .tree
            .compare_and_swap(key, Some(raw), None::<IVec>)?
            .is_ok())
    }
}

#[async_trait]
impl KvStore for SledKvStore {
    async fn set(&self, key: &str, value: &str, options: SetOptions) -> Result<bool> {
        let encoded = Envelope::new(value, &options)?.encode()?;

        if options.mode == SetMode::Always {
            self.tree.insert(key, encoded)?;
            return Ok(true);
        }

        loop {
            let current = self.tree.get(key)?;
            let expected = match &current {
                None => None,
                Some(raw) => {
                    if !Envelope::decode(raw)?.is_expired(Utc::now().timestamp_millis()) {
                        return Ok(false);
                    }
                    Some(raw.clone())
                }
            };

            match self
                .tree
                .compare_and_swap(key, expected, Some(encoded.clone()))?
            {
                Ok(()) => return Ok(true),
                // someone else wrote between our read and the swap; re-evaluate
                Err(_) => debug!(key, "Conditional write raced, retrying"),
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(raw) = self.tree.get(key)? else {
            return Ok(None);
        };
        let envelope = Envelope::decode(&raw)?;
        if envelope.is_expired(Utc::now().timestamp_millis()) {
            self.swap_out(key, &raw)?;
            return Ok(None);
        }
        Ok(Some(envelope.value))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.tree.remove(key)? {
            Some(raw) => Ok(!Envelope::decode(&raw)?.is_expired(Utc::now().timestamp_millis())),
            None => Ok(false),
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let Some(raw) = self.tree.get(key)? else {
            return Ok(false);
        };
        let envelope = Envelope::decode(&raw)?;
        if envelope.value != expected || envelope.is_expired(Utc::now().timestamp_millis()) {
            return Ok(false);
        }
        self.swap_out(key, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_conditional_write() {
        let store = SledKvStore::temporary().unwrap();
        assert!(store.set("k", "a", SetOptions::if_absent(60)).await.unwrap());
        assert!(!store.set("k", "b", SetOptions::if_absent(60)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_expired_value_can_be_replaced() {
        let store = SledKvStore::temporary().unwrap();
        let short = SetOptions::if_absent(60).with_ttl(Duration::from_millis(20));
        assert!(store.set("k", "a", short).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(store.set("k", "b", SetOptions::if_absent(60)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_out_of_range_ttl_is_rejected() {
        let store = SledKvStore::temporary().unwrap();
        let too_long = SetOptions::if_absent(u64::MAX);
        assert!(matches!(
            store.set("k", "a", too_long).await,
            Err(CoordError::Configuration { .. })
        ));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_semantics() {
        let store = SledKvStore::temporary().unwrap();
        store.set("k", "a", SetOptions::always()).await.unwrap();

        assert!(!store.delete_if_equals("k", "z").await.unwrap());
        assert!(store.delete_if_equals("k", "a").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_handles_share_one_database() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let first = SledKvStore::from_db(&db).unwrap();
        let second = SledKvStore::from_db(&db).unwrap();

        assert!(first.set("slot", "one", SetOptions::if_absent(60)).await.unwrap());
        assert!(!second.set("slot", "two", SetOptions::if_absent(60)).await.unwrap());
        first.flush().await.unwrap();
    }
}
