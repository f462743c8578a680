//! Records exchanged with callers of the lock and coordination managers.
//!
//! All of these are plain data so they can cross process boundaries unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::core::errors::ErrorInfo;
use crate::taskagent::csi::Csi;

/// Storage key of one coordination slot.
///
/// Each component is length-prefixed, so distinct (owner, thread) pairs can
/// never collapse onto the same key regardless of the characters they contain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    pub fn derive(prefix: &str, owner_id: &str, thread_id: &str) -> Self {
        Self(format!(
            "{}:{}:{}:{}:{}",
            prefix,
            owner_id.len(),
            owner_id,
            thread_id.len(),
            thread_id
        ))
    }

    /// Split a key back into (prefix, owner, thread)
    pub fn parse(raw: &str) -> Option<(String, String, String)> {
        let (prefix, rest) = raw.split_once(':')?;
        let (owner, rest) = take_component(rest)?;
        let (thread, rest) = take_component(rest)?;
        if !rest.is_empty() {
            return None;
        }
        Some((prefix.to_string(), owner.to_string(), thread.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Reads "<len>:<component>" and returns the component plus whatever follows
/// the separating ':' (or "" at the end of the key).
fn take_component(input: &str) -> Option<(&str, &str)> {
    let (len, rest) = input.split_once(':')?;
    let len: usize = len.parse().ok()?;
    let component = rest.get(..len)?;
    let tail = &rest[len..];
    match tail.strip_prefix(':') {
        Some(after) => Some((component, after)),
        None if tail.is_empty() => Some((component, "")),
        None => None,
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Written atomically with the lock, read-only afterwards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    /// Unique per acquisition
    pub lock_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub owner_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    /// Caller-supplied diagnostic payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl LockMetadata {
    /// Seconds left before the TTL lapses, negative once it has
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        let expires = i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.acquired_at.checked_add_signed(ttl));
        match expires {
            Some(expires) => (expires - now).num_seconds(),
            None => i64::MAX,
        }
    }
}

/// Per-call lock options; unset fields fall back to the manager's config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockOptions {
    pub ttl_seconds: Option<u64>,
    pub key_prefix: Option<String>,
    pub metadata: Option<Value>,
}

impl LockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Outcome of one `acquire` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AcquireOutcome {
    Acquired {
        metadata: LockMetadata,
    },
    /// Somebody else holds the slot. The holder is read after the failed
    /// write and is informational only.
    Held {
        #[serde(rename = "activeLockMetadata")]
        active: Option<LockMetadata>,
    },
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired { .. })
    }

    pub fn metadata(&self) -> Option<&LockMetadata> {
        match self {
            AcquireOutcome::Acquired { metadata } => Some(metadata),
            AcquireOutcome::Held { .. } => None,
        }
    }
}

/// Identifies the slot a coordinated call runs in and carries its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationRequest {
    pub user_id: String,
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi: Option<Csi>,
}

impl CoordinationRequest {
    pub fn new(user_id: impl Into<String>, thread_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            thread_id: thread_id.into(),
            csi: None,
        }
    }

    pub fn with_csi(mut self, csi: Csi) -> Self {
        self.csi = Some(csi);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockReport {
    pub lock_key: LockKey,
    pub lock_acquired: bool,
    pub lock_released: bool,
    pub lock_duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn since(start_time: DateTime<Utc>) -> Self {
        let end_time = Utc::now();
        Self {
            start_time,
            end_time,
            duration_ms: (end_time - start_time).num_milliseconds().max(0) as u64,
        }
    }
}

/// Produced once per coordinated call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinationResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    /// Progress after the task, present on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csi: Option<Csi>,
    pub lock_metadata: LockReport,
    pub execution_metadata: ExecutionReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_stable() {
        let a = LockKey::derive("agent_lock", "user-1", "thread-1");
        let b = LockKey::derive("agent_lock", "user-1", "thread-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "agent_lock:6:user-1:8:thread-1");
    }

    #[test]
    fn test_key_derivation_is_injective() {
        // naive "owner:thread" joining would map both of these to "a:b:c"
        let first = LockKey::derive("p", "a:b", "c");
        let second = LockKey::derive("p", "a", "b:c");
        assert_ne!(first, second);

        let empty_owner = LockKey::derive("p", "", "x");
        let empty_thread = LockKey::derive("p", "x", "");
        assert_ne!(empty_owner, empty_thread);
    }

    #[test]
    fn test_key_parse_round_trip() {
        let key = LockKey::derive("agent_lock", "u:1", "t:2:3");
        let (prefix, owner, thread) = LockKey::parse(key.as_str()).unwrap();
        assert_eq!(prefix, "agent_lock");
        assert_eq!(owner, "u:1");
        assert_eq!(thread, "t:2:3");

        assert!(LockKey::parse("agent_lock:9:short:1:t").is_none());
        assert!(LockKey::parse("garbage").is_none());
    }

    #[test]
    fn test_remaining_seconds() {
        let acquired_at = Utc::now();
        let meta = LockMetadata {
            lock_id: "l".into(),
            acquired_at,
            ttl_seconds: 60,
            owner_id: "u".into(),
            thread_id: "t".into(),
            process_id: None,
            metadata: None,
        };
        let later = acquired_at + chrono::Duration::seconds(20);
        assert_eq!(meta.remaining_seconds(later), 40);

        let unbounded = LockMetadata {
            ttl_seconds: u64::MAX,
            ..meta
        };
        assert_eq!(unbounded.remaining_seconds(later), i64::MAX);
    }

    #[test]
    fn test_acquire_outcome_shape() {
        let held = AcquireOutcome::Held { active: None };
        let value = serde_json::to_value(&held).unwrap();
        assert_eq!(value["status"], "held");
        assert!(value["activeLockMetadata"].is_null());
    }
}
