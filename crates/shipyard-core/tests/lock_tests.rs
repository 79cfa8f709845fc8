//! Keyed lock behaviour under contention.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use shipyard_core::{KeyedLockTable, LockKey, LockProvider};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_holder_per_key_at_a_time() {
    let locks = KeyedLockTable::new();
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let locks = locks.clone();
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            tokio::spawn(async move {
                let guard = locks.lock(&LockKey::project("sockshop")).await.unwrap();
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                holders.fetch_sub(1, Ordering::SeqCst);
                guard.unlock();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test]
async fn service_keys_of_one_project_are_independent() {
    let locks = KeyedLockTable::with_acquire_timeout(Duration::from_millis(50));
    let carts = locks
        .lock(&LockKey::service("sockshop", "dev", "carts"))
        .await
        .unwrap();
    let orders = locks
        .lock(&LockKey::service("sockshop", "dev", "orders"))
        .await
        .unwrap();
    assert_eq!(locks.active_keys(), 2);

    let blocked = locks
        .lock(&LockKey::service("sockshop", "dev", "carts"))
        .await
        .unwrap_err();
    assert!(blocked.to_string().contains("sockshop.dev.carts"));

    drop(carts);
    drop(orders);
    assert_eq!(locks.active_keys(), 0);
}

#[tokio::test]
async fn dropped_guard_hands_the_key_to_the_next_waiter() {
    let locks = KeyedLockTable::new();
    let key = LockKey::project("sockshop");
    let first = locks.lock(&key).await.unwrap();

    let waiter = {
        let locks = locks.clone();
        let key = key.clone();
        tokio::spawn(async move { locks.lock(&key).await.map(|guard| guard.key().clone()) })
    };
    tokio::task::yield_now().await;
    assert!(!waiter.is_finished());

    drop(first);
    let acquired = waiter.await.unwrap().unwrap();
    assert_eq!(acquired, key);
}
