//! TTL-backed lock coordinator

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_common::{DEFAULT_RETRY_COUNT, LockError, MIN_TTL_SECS};

use super::{Extension, Removal, TtlStore};
use crate::lock::{
    BackendKind, Deadline, HeldLock, LockCoordinator, LockRequest, OwnerToken, RenewOutcome,
    RenewalRegistry, Renewer, bounded,
};
use crate::metrics;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Keeps one key alive; the store refuses to extend a key that expired or
/// changed hands
struct TtlRenewer<S: TtlStore> {
    store: Arc<S>,
    key: String,
    value: String,
    ttl: Duration,
}

#[async_trait]
impl<S: TtlStore> Renewer for TtlRenewer<S> {
    async fn renew(&self) -> anyhow::Result<RenewOutcome> {
        Ok(
            match self
                .store
                .extend_if_owner(&self.key, &self.value, self.ttl)
                .await?
            {
                Extension::Extended => RenewOutcome::Renewed,
                Extension::Expired => RenewOutcome::Lapsed("key expired"),
                Extension::Stolen => RenewOutcome::Lapsed("key is held by another owner"),
            },
        )
    }
}

/// Lock coordinator over a conditional-set + TTL store.
///
/// The owner id written as the key's value is the owner token. Blocking
/// acquisition polls on a fixed tick of `timeout / retry_count`.
pub struct TtlLockService<S: TtlStore> {
    store: RwLock<Option<Arc<S>>>,
    renewals: RenewalRegistry<(String, String)>,
    shutdown: CancellationToken,
    retry_count: u32,
}

impl<S: TtlStore> TtlLockService<S> {
    /// Create a coordinator; cancelling `shutdown` stops every renewal and
    /// ends every blocked acquisition
    pub fn new(store: Arc<S>, shutdown: CancellationToken) -> Self {
        Self {
            store: RwLock::new(Some(store)),
            renewals: RenewalRegistry::new(BackendKind::Ttl, shutdown.clone()),
            shutdown,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    /// Default number of polling attempts for requests that don't set one
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count.max(1);
        self
    }

    fn client(&self) -> Result<Arc<S>, LockError> {
        self.store.read().clone().ok_or(LockError::NotInitialized)
    }

    /// Remaining lifetime of a held lock as seen by the store, `None` once it
    /// has expired or another owner has taken the key. Holders use this to
    /// confirm they still own the lock after renewal may have stopped.
    pub async fn remaining_ttl(&self, lock: &HeldLock) -> Result<Option<Duration>, LockError> {
        let store = self.client()?;
        let Some(value) = lock.token().value() else {
            return Err(LockError::InvalidArgument(format!(
                "lock '{}' was not issued by a ttl coordinator",
                lock.key()
            )));
        };
        store
            .owner_ttl(lock.key(), value)
            .await
            .map_err(|e| LockError::Store(e.to_string()))
    }

    fn validate(request: &LockRequest) -> Result<(), LockError> {
        request.validate()?;
        if request.ttl < Duration::from_secs(MIN_TTL_SECS) {
            return Err(LockError::InvalidArgument(format!(
                "lock ttl must be at least {}s, got {:?}",
                MIN_TTL_SECS, request.ttl
            )));
        }
        Ok(())
    }

    async fn try_acquire(
        &self,
        store: &Arc<S>,
        request: &LockRequest,
        deadline: Option<Deadline>,
    ) -> Result<Option<HeldLock>, LockError> {
        if self.shutdown.is_cancelled() {
            return Err(LockError::Cancelled(request.key.clone()));
        }

        let acquired = match bounded(
            &request.key,
            deadline,
            &self.shutdown,
            store.set_if_absent(&request.key, &request.owner, request.ttl),
        )
        .await
        {
            Ok(result) => result.map_err(|e| LockError::TransactionFailed(e.to_string()))?,
            Err(e) => {
                // the set may still land; take back our value if it did
                delete_detached(store.clone(), request.key.clone(), request.owner.clone());
                return Err(e);
            }
        };
        if !acquired {
            debug!(key = %request.key, "Lock is held by another client");
            return Ok(None);
        }

        let renewal = self.renewals.start(
            (request.key.clone(), request.owner.clone()),
            request.ttl,
            TtlRenewer {
                store: store.clone(),
                key: request.key.clone(),
                value: request.owner.clone(),
                ttl: request.ttl,
            },
        );

        info!(key = %request.key, owner = %request.owner, ttl = ?request.ttl, "Lock acquired");
        Ok(Some(HeldLock::new(
            request.key.clone(),
            OwnerToken::Value(request.owner.clone()),
            request.ttl,
            renewal,
        )))
    }

    async fn acquire_once(&self, request: &LockRequest) -> Result<HeldLock, LockError> {
        let store = self.client()?;
        Self::validate(request)?;

        self.try_acquire(&store, request, None)
            .await?
            .ok_or_else(|| LockError::LockHeld(request.key.clone()))
    }

    async fn acquire_polling(
        &self,
        request: &LockRequest,
        timeout: Duration,
    ) -> Result<HeldLock, LockError> {
        let store = self.client()?;
        Self::validate(request)?;

        let retry_count = request.retry_count.unwrap_or(self.retry_count).max(1);
        let tick = (timeout / retry_count).max(MIN_POLL_INTERVAL);
        let deadline = Deadline::after(timeout);
        let mut ticker = interval_at(Instant::now() + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(lock) = self.try_acquire(&store, request, Some(deadline)).await? {
                return Ok(lock);
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Err(LockError::Cancelled(request.key.clone()));
                }
                _ = sleep_until(deadline.at) => {
                    return Err(deadline.expired(&request.key));
                }
                _ = ticker.tick() => {}
            }
        }
    }
}

fn delete_detached<S: TtlStore>(store: Arc<S>, key: String, value: String) {
    tokio::spawn(async move {
        if let Err(e) = store.compare_and_delete(&key, &value).await {
            warn!(key = %key, error = %e, "Failed to clean up abandoned lock attempt, it will expire on its own");
        }
    });
}

#[async_trait]
impl<S: TtlStore> LockCoordinator for TtlLockService<S> {
    fn backend(&self) -> BackendKind {
        BackendKind::Ttl
    }

    async fn acquire(&self, request: &LockRequest) -> Result<HeldLock, LockError> {
        let result = self.acquire_once(request).await;
        metrics::record_acquire_result(BackendKind::Ttl, &result);
        result
    }

    async fn acquire_blocking(
        &self,
        request: &LockRequest,
        timeout: Duration,
    ) -> Result<HeldLock, LockError> {
        let result = self.acquire_polling(request, timeout).await;
        metrics::record_acquire_result(BackendKind::Ttl, &result);
        result
    }

    async fn release(&self, lock: &HeldLock) -> Result<(), LockError> {
        let store = self.client()?;
        let Some(value) = lock.token().value() else {
            return Err(LockError::InvalidArgument(format!(
                "lock '{}' was not issued by a ttl coordinator",
                lock.key()
            )));
        };

        // renewal must be gone before the key is deleted
        lock.renewal().stop();
        self.renewals
            .stop(&(lock.key().to_string(), value.to_string()))
            .await;

        match store.compare_and_delete(lock.key(), value).await {
            Ok(Removal::Deleted) => {
                metrics::record_release(BackendKind::Ttl, "released");
                info!(key = %lock.key(), owner = %value, "Lock released");
                Ok(())
            }
            Ok(Removal::Missing) => {
                metrics::record_release(BackendKind::Ttl, "expired");
                debug!(key = %lock.key(), owner = %value, "Lock key already expired");
                Ok(())
            }
            Ok(Removal::Mismatch) => {
                metrics::record_release(BackendKind::Ttl, "not_owner");
                warn!(key = %lock.key(), owner = %value, "Lock is now held by a different owner, not released");
                Err(LockError::NotOwner(lock.key().to_string()))
            }
            Err(e) => {
                metrics::record_release(BackendKind::Ttl, "error");
                Err(LockError::Store(format!("failed to release lock: {}", e)))
            }
        }
    }

    async fn shutdown(&self) {
        // detach first so no acquisition can start a renewal after the sweep
        self.store.write().take();
        let stopped = self.renewals.close().await;
        info!(stopped, "TTL lock coordinator shut down");
    }

    fn active_renewals(&self) -> usize {
        self.renewals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ttl::MemoryTtlStore;
    use tokio::time::Instant;

    fn service() -> (Arc<MemoryTtlStore>, TtlLockService<MemoryTtlStore>) {
        let store = Arc::new(MemoryTtlStore::new());
        let service = TtlLockService::new(store.clone(), CancellationToken::new());
        (store, service)
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (store, service) = service();
        let request = LockRequest::new("k", Duration::from_secs(5)).with_owner("u1");

        let lock = service.acquire(&request).await.unwrap();
        assert_eq!(lock.token(), &OwnerToken::Value("u1".to_string()));
        assert_eq!(store.get("k").as_deref(), Some("u1"));
        assert_eq!(service.active_renewals(), 1);

        service.release(&lock).await.unwrap();
        assert!(store.get("k").is_none());
        assert_eq!(service.active_renewals(), 0);
    }

    #[tokio::test]
    async fn test_ttl_below_one_second_rejected() {
        let (_store, service) = service();
        let err = service
            .acquire(&LockRequest::new("k", Duration::from_millis(500)))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));

        let err = service
            .acquire(&LockRequest::new("k", Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_contended_acquire_returns_lock_held() {
        let (_store, service) = service();
        let _lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(1)).with_owner("u1"))
            .await
            .unwrap();
        let err = service
            .acquire(&LockRequest::new("k", Duration::from_secs(1)).with_owner("u2"))
            .await
            .unwrap_err();
        assert_eq!(err, LockError::LockHeld("k".to_string()));
    }

    #[tokio::test]
    async fn test_release_foreign_owner_fails() {
        let (store, service) = service();
        let _lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)).with_owner("u1"))
            .await
            .unwrap();

        let forged = HeldLock::from_parts(
            "k",
            OwnerToken::Value("u2".to_string()),
            Duration::from_secs(5),
        );
        assert_eq!(
            service.release(&forged).await,
            Err(LockError::NotOwner("k".to_string()))
        );
        assert_eq!(store.get("k").as_deref(), Some("u1"));
    }

    #[tokio::test]
    async fn test_release_rejects_lease_token() {
        let (_store, service) = service();
        let lock = HeldLock::from_parts("k", OwnerToken::Lease(1), Duration::from_secs(1));
        assert!(matches!(
            service.release(&lock).await,
            Err(LockError::InvalidArgument(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_release_succeeds() {
        let (store, service) = service();
        let lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(2)))
            .await
            .unwrap();

        // take the store away long enough for renewal to give up and the key to lapse
        store.set_available(false);
        tokio::time::sleep(Duration::from_secs(3)).await;
        store.set_available(true);

        assert!(!lock.renewal().is_active());
        assert_eq!(service.remaining_ttl(&lock).await.unwrap(), None);
        service.release(&lock).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_stops_when_key_is_taken_over() {
        let (store, service) = service();
        let lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(2)).with_owner("u1"))
            .await
            .unwrap();

        store.force_set("k", "intruder", Duration::from_secs(30));
        tokio::time::timeout(Duration::from_secs(2), lock.renewal().stopped())
            .await
            .unwrap();
        assert_eq!(store.get("k").as_deref(), Some("intruder"));
        assert_eq!(
            service.release(&lock).await,
            Err(LockError::NotOwner("k".to_string()))
        );
    }

    #[tokio::test]
    async fn test_remaining_ttl_is_none_after_takeover() {
        let (store, service) = service();
        let lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)).with_owner("u1"))
            .await
            .unwrap();
        assert!(service.remaining_ttl(&lock).await.unwrap().is_some());

        store.force_set("k", "intruder", Duration::from_secs(30));
        assert_eq!(service.remaining_ttl(&lock).await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_polls_until_free() {
        let (_store, service) = service();
        let service = Arc::new(service);
        let first = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)))
            .await
            .unwrap();

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                let request = LockRequest::new("k", Duration::from_secs(5)).with_retry_count(10);
                service.acquire_blocking(&request, Duration::from_secs(10)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(2050)).await;
        let released_at = Instant::now();
        service.release(&first).await.unwrap();

        let second = waiter.await.unwrap().unwrap();
        // one poll tick is timeout / retry_count
        assert!(released_at.elapsed() <= Duration::from_secs(1));
        service.release(&second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let (_store, service) = service();
        let _held = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)))
            .await
            .unwrap();

        let started = Instant::now();
        let err = service
            .acquire_blocking(
                &LockRequest::new("k", Duration::from_secs(5)),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1200));
    }

    #[tokio::test]
    async fn test_zero_timeout_still_attempts_once() {
        let (_store, service) = service();
        let lock = service
            .acquire_blocking(&LockRequest::new("k", Duration::from_secs(1)), Duration::ZERO)
            .await
            .unwrap();
        service.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_detaches_store() {
        let (_store, service) = service();
        let lock = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)))
            .await
            .unwrap();

        service.shutdown().await;
        assert!(!lock.renewal().is_active());
        assert_eq!(
            service.acquire(&LockRequest::new("k", Duration::from_secs(5))).await.unwrap_err(),
            LockError::NotInitialized
        );
        assert_eq!(
            service.remaining_ttl(&lock).await,
            Err(LockError::NotInitialized)
        );
    }

    /// Memory store whose conditional set can be slowed down
    #[derive(Default)]
    struct SlowTtlStore {
        inner: MemoryTtlStore,
        set_delay: parking_lot::Mutex<Duration>,
    }

    #[async_trait]
    impl TtlStore for SlowTtlStore {
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
            let delay = *self.set_delay.lock();
            tokio::time::sleep(delay).await;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn remaining_ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
            self.inner.remaining_ttl(key).await
        }

        async fn owner_ttl(&self, key: &str, value: &str) -> anyhow::Result<Option<Duration>> {
            self.inner.owner_ttl(key, value).await
        }

        async fn extend_if_owner(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> anyhow::Result<Extension> {
            self.inner.extend_if_owner(key, value, ttl).await
        }

        async fn compare_and_delete(&self, key: &str, value: &str) -> anyhow::Result<Removal> {
            self.inner.compare_and_delete(key, value).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_deadline_covers_slow_set() {
        let store = Arc::new(SlowTtlStore::default());
        let service = TtlLockService::new(store.clone(), CancellationToken::new());
        let _held = service
            .acquire(&LockRequest::new("k", Duration::from_secs(5)).with_owner("u1"))
            .await
            .unwrap();

        *store.set_delay.lock() = Duration::from_secs(5);
        let started = Instant::now();
        let err = service
            .acquire_blocking(
                &LockRequest::new("k", Duration::from_secs(5)).with_owner("u2"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1100));

        // the abandoned attempt never touches the holder's key
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.inner.get("k").as_deref(), Some("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_slow_set() {
        let store = Arc::new(SlowTtlStore::default());
        *store.set_delay.lock() = Duration::from_secs(30);
        let shutdown = CancellationToken::new();
        let service = Arc::new(TtlLockService::new(store, shutdown.clone()));

        let waiter = {
            let service = service.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let result = service
                    .acquire_blocking(
                        &LockRequest::new("k", Duration::from_secs(5)),
                        Duration::from_secs(60),
                    )
                    .await;
                (result, started.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_millis(500)).await;
        shutdown.cancel();

        let (result, waited) = waiter.await.unwrap();
        assert_eq!(result.unwrap_err(), LockError::Cancelled("k".to_string()));
        assert!(waited < Duration::from_secs(1));
    }
}
