//! Lock manager behaviour against both bundled stores

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use stepgate::{
    AcquireOutcome, CoordError, CoordinationConfig, KvStore, LockManager, LockOptions,
    MemoryKvStore, SetOptions, SledKvStore,
};

fn stores() -> Vec<(&'static str, Arc<dyn KvStore>)> {
    vec![
        ("memory", Arc::new(MemoryKvStore::new())),
        ("sled", Arc::new(SledKvStore::temporary().unwrap())),
    ]
}

fn manager(store: Arc<dyn KvStore>) -> LockManager {
    let config = CoordinationConfig::builder()
        .instance_id("lock-tests")
        .build()
        .unwrap();
    LockManager::new(store, Arc::new(config))
}

/// Many concurrent acquirers on one slot: exactly one wins
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    for (name, store) in stores() {
        let locks = manager(store);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .acquire("user-1", "thread-1", &LockOptions::new())
                    .await
                    .unwrap()
                    .is_acquired()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "store {}", name);
    }
}

#[tokio::test]
async fn test_release_is_idempotent() {
    for (name, store) in stores() {
        let locks = manager(store);
        assert!(!locks.release("u", "t").await.unwrap(), "store {}", name);

        locks.acquire("u", "t", &LockOptions::new()).await.unwrap();
        assert!(locks.release("u", "t").await.unwrap(), "store {}", name);
        assert!(!locks.release("u", "t").await.unwrap(), "store {}", name);
    }
}

#[tokio::test]
async fn test_expired_lock_can_be_reacquired() {
    for (name, store) in stores() {
        let locks = manager(store);
        let short = LockOptions::new().with_ttl(1);
        assert!(locks.acquire("u", "t", &short).await.unwrap().is_acquired());
        assert!(!locks.acquire("u", "t", &short).await.unwrap().is_acquired());

        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(locks.check("u", "t").await.unwrap().is_none(), "store {}", name);
        assert!(
            locks.acquire("u", "t", &short).await.unwrap().is_acquired(),
            "store {}",
            name
        );
    }
}

#[tokio::test]
async fn test_oversized_ttl_is_rejected_and_slot_stays_free() {
    for (name, store) in stores() {
        let locks = manager(store.clone());
        for ttl in [u64::MAX, 10_000_000_000_000_000, 30 * 24 * 60 * 60 + 1] {
            let outcome = locks
                .acquire("u", "t", &LockOptions::new().with_ttl(ttl))
                .await;
            assert!(
                matches!(outcome, Err(CoordError::Configuration { .. })),
                "store {}: ttl {} gave {:?}",
                name,
                ttl,
                outcome
            );
        }
        assert!(locks.check("u", "t").await.unwrap().is_none(), "store {}", name);

        // the stores refuse expiry arithmetic they cannot represent
        let raw = store
            .set("raw", "x", SetOptions::if_absent(u64::MAX))
            .await;
        assert!(matches!(raw, Err(CoordError::Configuration { .. })), "store {}", name);
        assert_eq!(store.get("raw").await.unwrap(), None, "store {}", name);

        assert!(
            locks.acquire("u", "t", &LockOptions::new()).await.unwrap().is_acquired(),
            "store {}",
            name
        );
    }
}

#[tokio::test]
async fn test_metadata_round_trip() {
    for (name, store) in stores() {
        let locks = manager(store);
        let outcome = locks
            .acquire("owner-7", "thread-9", &LockOptions::new().with_ttl(45))
            .await
            .unwrap();
        let written = match outcome {
            AcquireOutcome::Acquired { metadata } => metadata,
            other => panic!("store {}: expected acquisition, got {:?}", name, other),
        };

        let read = locks.check("owner-7", "thread-9").await.unwrap().unwrap();
        assert_eq!(read.owner_id, "owner-7");
        assert_eq!(read.thread_id, "thread-9");
        assert_eq!(read.ttl_seconds, 45);
        assert_eq!(read, written);
    }
}

#[tokio::test]
async fn test_slots_are_independent() {
    let locks = manager(Arc::new(MemoryKvStore::new()));
    let opts = LockOptions::new();
    assert!(locks.acquire("a:b", "c", &opts).await.unwrap().is_acquired());
    assert!(locks.acquire("a", "b:c", &opts).await.unwrap().is_acquired());
    assert!(locks.acquire("a", "c", &opts).await.unwrap().is_acquired());
    assert!(!locks.acquire("a", "c", &opts).await.unwrap().is_acquired());
}

#[tokio::test]
async fn test_check_does_not_mutate() {
    let locks = manager(Arc::new(MemoryKvStore::new()));
    assert!(locks.check("u", "t").await.unwrap().is_none());
    assert!(locks.acquire("u", "t", &LockOptions::new()).await.unwrap().is_acquired());
    let first = locks.check("u", "t").await.unwrap();
    let second = locks.check("u", "t").await.unwrap();
    assert_eq!(first, second);
}
