//! Lock protocol properties, checked against both backends over the
//! in-memory stores. Timer-driven tests run on a paused clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use warden_lock::lease::{LeaseLockService, MemoryLeaseStore};
use warden_lock::ttl::{MemoryTtlStore, TtlLockService};
use warden_lock::{HeldLock, LockCoordinator, LockError, LockRequest, OwnerToken};

fn lease_backend(shutdown: &CancellationToken) -> (Arc<MemoryLeaseStore>, Arc<dyn LockCoordinator>) {
    let store = Arc::new(MemoryLeaseStore::new());
    let coordinator = Arc::new(LeaseLockService::new(store.clone(), shutdown.clone()));
    (store, coordinator)
}

fn ttl_backend(shutdown: &CancellationToken) -> (Arc<MemoryTtlStore>, Arc<dyn LockCoordinator>) {
    let store = Arc::new(MemoryTtlStore::new());
    let coordinator = Arc::new(TtlLockService::new(store.clone(), shutdown.clone()));
    (store, coordinator)
}

fn backends(shutdown: &CancellationToken) -> Vec<Arc<dyn LockCoordinator>> {
    vec![lease_backend(shutdown).1, ttl_backend(shutdown).1]
}

fn request(key: &str, ttl_secs: u64) -> LockRequest {
    LockRequest::new(key, Duration::from_secs(ttl_secs))
}

// ============== Mutual exclusion ==============

#[tokio::test(start_paused = true)]
async fn test_mutual_exclusion_under_contention() {
    for coordinator in backends(&CancellationToken::new()) {
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for worker in 0..8 {
            let coordinator = coordinator.clone();
            let holders = holders.clone();
            let max_holders = max_holders.clone();
            handles.push(tokio::spawn(async move {
                let request = request("counter", 5)
                    .with_owner(format!("worker-{}", worker))
                    .with_retry_count(300);
                let lock = coordinator
                    .acquire_blocking(&request, Duration::from_secs(30))
                    .await
                    .unwrap();

                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                holders.fetch_sub(1, Ordering::SeqCst);

                coordinator.release(&lock).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            max_holders.load(Ordering::SeqCst),
            1,
            "backend {}",
            coordinator.backend()
        );
        assert_eq!(coordinator.active_renewals(), 0);
    }
}

#[tokio::test]
async fn test_concurrent_try_lock_exactly_one_wins_on_ttl_keys() {
    let (store, coordinator) = ttl_backend(&CancellationToken::new());
    let first = request("k", 1).with_owner("u1");
    let second = request("k", 1).with_owner("u2");

    let (a, b) = tokio::join!(coordinator.acquire(&first), coordinator.acquire(&second));

    let (winner, loser) = match (a, b) {
        (Ok(lock), Err(e)) | (Err(e), Ok(lock)) => (lock, e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert_eq!(loser, LockError::LockHeld("k".to_string()));
    assert_eq!(store.get("k").as_deref(), winner.token().value());
}

#[tokio::test]
async fn test_concurrent_try_lock_exactly_one_wins_on_leases() {
    let (store, coordinator) = lease_backend(&CancellationToken::new());
    let first = request("k", 5).with_owner("u1");
    let second = request("k", 5).with_owner("u2");

    let (a, b) = tokio::join!(coordinator.acquire(&first), coordinator.acquire(&second));

    let (winner, loser) = match (a, b) {
        (Ok(lock), Err(e)) | (Err(e), Ok(lock)) => (lock, e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert_eq!(loser, LockError::LockHeld("k".to_string()));
    assert_eq!(store.lease_of("k"), winner.token().lease_id());
    // the loser's lease does not outlive its attempt
    assert_eq!(store.lease_count(), 1);
}

// ============== Release ==============

#[tokio::test]
async fn test_release_is_idempotent() {
    for coordinator in backends(&CancellationToken::new()) {
        let lock = coordinator.acquire(&request("k", 5)).await.unwrap();
        coordinator.release(&lock).await.unwrap();
        coordinator.release(&lock).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_release_after_expiry_succeeds() {
    let (store, coordinator) = ttl_backend(&CancellationToken::new());
    let lock = coordinator.acquire(&request("k", 2)).await.unwrap();

    // the lock lapses while its owner is cut off from the store
    store.set_available(false);
    sleep(Duration::from_secs(3)).await;
    store.set_available(true);

    assert!(store.get("k").is_none());
    coordinator.release(&lock).await.unwrap();
}

#[tokio::test]
async fn test_release_with_foreign_token_keeps_key() {
    let (store, coordinator) = ttl_backend(&CancellationToken::new());
    let _lock = coordinator
        .acquire(&request("k", 5).with_owner("u1"))
        .await
        .unwrap();

    let forged = HeldLock::from_parts("k", OwnerToken::Value("u2".to_string()), Duration::from_secs(5));
    assert_eq!(
        coordinator.release(&forged).await,
        Err(LockError::NotOwner("k".to_string()))
    );
    assert_eq!(store.get("k").as_deref(), Some("u1"));
}

#[tokio::test]
async fn test_release_with_stale_lease_keeps_key() {
    let (store, coordinator) = lease_backend(&CancellationToken::new());
    let lock = coordinator
        .acquire(&request("k", 5).with_owner("a"))
        .await
        .unwrap();
    let lease_id = lock.token().lease_id().unwrap();

    let stale = HeldLock::from_parts("k", OwnerToken::Lease(lease_id + 1000), Duration::from_secs(5));
    coordinator.release(&stale).await.unwrap();
    assert_eq!(store.get("k").as_deref(), Some("a"));
    assert_eq!(store.lease_of("k"), Some(lease_id));
}

// ============== Renewal ==============

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_lock_alive() {
    for coordinator in backends(&CancellationToken::new()) {
        let lock = coordinator.acquire(&request("k", 2)).await.unwrap();

        sleep(Duration::from_secs(5)).await;
        assert!(lock.renewal().is_active());
        assert_eq!(
            coordinator.acquire(&request("k", 2)).await.unwrap_err(),
            LockError::LockHeld("k".to_string())
        );

        coordinator.release(&lock).await.unwrap();
        let next = coordinator.acquire(&request("k", 2)).await.unwrap();
        coordinator.release(&next).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_lock_expires() {
    let (store, coordinator) = lease_backend(&CancellationToken::new());
    let lock = coordinator.acquire(&request("k", 2)).await.unwrap();
    drop(lock);

    sleep(Duration::from_millis(2500)).await;
    assert!(store.get("k").is_none());
    assert_eq!(coordinator.active_renewals(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_lets_lock_expire() {
    let (store, coordinator) = lease_backend(&CancellationToken::new());
    let lock = coordinator.acquire(&request("k", 2)).await.unwrap();

    store.set_available(false);
    lock.renewal().stopped().await;
    store.set_available(true);

    // renewal is not retried once the store comes back
    sleep(Duration::from_secs(2)).await;
    assert!(store.get("k").is_none());
    let next = coordinator.acquire(&request("k", 2)).await.unwrap();
    coordinator.release(&next).await.unwrap();
}

// ============== Blocking acquisition ==============

#[tokio::test(start_paused = true)]
async fn test_blocking_acquire_times_out() {
    for coordinator in backends(&CancellationToken::new()) {
        let _held = coordinator.acquire(&request("k", 5)).await.unwrap();

        let started = Instant::now();
        let err = coordinator
            .acquire_blocking(&request("k", 5).with_retry_count(10), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            LockError::Timeout {
                key: "k".to_string(),
                timeout: Duration::from_secs(1)
            }
        );
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed <= Duration::from_millis(1100));
    }
}

#[tokio::test(start_paused = true)]
async fn test_job_handoff_between_processes() {
    for coordinator in backends(&CancellationToken::new()) {
        let first = coordinator.acquire(&request("job-42", 5)).await.unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let lock = coordinator
                    .acquire_blocking(
                        &request("job-42", 5).with_retry_count(10),
                        Duration::from_secs(10),
                    )
                    .await
                    .unwrap();
                (lock, started.elapsed())
            })
        };

        sleep(Duration::from_secs(2)).await;
        coordinator.release(&first).await.unwrap();

        let (second, waited) = waiter.await.unwrap();
        assert!(waited >= Duration::from_secs(2));
        // notification-driven wakes at once, polling within one tick (10s / 10)
        assert!(
            waited <= Duration::from_secs(3),
            "backend {} waited {:?}",
            coordinator.backend(),
            waited
        );
        assert_ne!(second.token(), first.token());
        coordinator.release(&second).await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_blocked_waiters() {
    for backend in 0..2 {
        let shutdown = CancellationToken::new();
        let coordinator = backends(&shutdown).swap_remove(backend);
        let _held = coordinator.acquire(&request("k", 5)).await.unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .acquire_blocking(&request("k", 5), Duration::from_secs(60))
                    .await
            })
        };

        sleep(Duration::from_millis(500)).await;
        assert!(!waiter.is_finished());
        shutdown.cancel();

        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            LockError::Cancelled("k".to_string())
        );
    }
}

// ============== Teardown ==============

#[tokio::test]
async fn test_shutdown_makes_coordinator_uninitialized() {
    for coordinator in backends(&CancellationToken::new()) {
        let lock = coordinator.acquire(&request("k", 5)).await.unwrap();
        assert_eq!(coordinator.active_renewals(), 1);

        coordinator.shutdown().await;
        assert_eq!(coordinator.active_renewals(), 0);
        assert!(!lock.renewal().is_active());

        assert_eq!(
            coordinator.acquire(&request("k", 5)).await.unwrap_err(),
            LockError::NotInitialized
        );
        assert_eq!(
            coordinator
                .acquire_blocking(&request("k", 5), Duration::from_secs(1))
                .await
                .unwrap_err(),
            LockError::NotInitialized
        );
        assert_eq!(coordinator.release(&lock).await, Err(LockError::NotInitialized));
    }
}
