//! Lease-backed lock coordinator

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use warden_common::{LockError, ceil_secs};

use super::{EventKind, LeaseStore, WatchStream};
use crate::lock::{
    BackendKind, Deadline, HeldLock, LockCoordinator, LockRequest, OwnerToken, RenewOutcome,
    RenewalRegistry, Renewer, bounded,
};
use crate::metrics;

enum Attempt {
    Acquired(HeldLock),
    Contended { revision: i64 },
}

/// Keeps one lease alive, checking it still exists before each refresh
struct LeaseRenewer<S: LeaseStore> {
    store: Arc<S>,
    lease_id: i64,
}

#[async_trait]
impl<S: LeaseStore> Renewer for LeaseRenewer<S> {
    async fn renew(&self) -> anyhow::Result<RenewOutcome> {
        if self.store.time_to_live(self.lease_id).await?.is_none() {
            return Ok(RenewOutcome::Lapsed("lease expired"));
        }
        match self.store.keep_alive_once(self.lease_id).await? {
            Some(_) => Ok(RenewOutcome::Renewed),
            None => Ok(RenewOutcome::Lapsed("lease expired during keep-alive")),
        }
    }
}

/// Lock coordinator over a lease + transaction store.
///
/// The lease id is the owner token. Blocking acquisition watches the key for
/// a delete event instead of polling.
pub struct LeaseLockService<S: LeaseStore> {
    store: RwLock<Option<Arc<S>>>,
    renewals: RenewalRegistry<i64>,
    shutdown: CancellationToken,
}

impl<S: LeaseStore> LeaseLockService<S> {
    /// Create a coordinator; cancelling `shutdown` stops every renewal and
    /// ends every blocked acquisition
    pub fn new(store: Arc<S>, shutdown: CancellationToken) -> Self {
        Self {
            store: RwLock::new(Some(store)),
            renewals: RenewalRegistry::new(BackendKind::Lease, shutdown.clone()),
            shutdown,
        }
    }

    fn client(&self) -> Result<Arc<S>, LockError> {
        self.store.read().clone().ok_or(LockError::NotInitialized)
    }

    /// Revoke a lease no lock was written under. Bounded like the attempt
    /// that granted it; when that bound runs out the revoke continues in the
    /// background.
    async fn revoke_unused(
        &self,
        store: &Arc<S>,
        key: &str,
        lease_id: i64,
        deadline: Option<Deadline>,
    ) {
        match self.bounded(key, deadline, store.revoke(lease_id)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(lease_id, error = %e, "Failed to revoke unused lease, it will expire on its own");
            }
            Err(_) => revoke_detached(store.clone(), lease_id),
        }
    }

    async fn bounded<T>(
        &self,
        key: &str,
        deadline: Option<Deadline>,
        call: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<anyhow::Result<T>, LockError> {
        bounded(key, deadline, &self.shutdown, call).await
    }

    async fn try_acquire(
        &self,
        store: &Arc<S>,
        request: &LockRequest,
        deadline: Option<Deadline>,
    ) -> Result<Attempt, LockError> {
        if self.shutdown.is_cancelled() {
            return Err(LockError::Cancelled(request.key.clone()));
        }

        let lease_id = self
            .bounded(&request.key, deadline, store.grant(ceil_secs(request.ttl) as i64))
            .await?
            .map_err(|e| LockError::Store(format!("failed to grant lease: {}", e)))?;

        let outcome = match self
            .bounded(
                &request.key,
                deadline,
                store.create_if_absent(&request.key, &request.owner, lease_id),
            )
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                self.revoke_unused(store, &request.key, lease_id, deadline)
                    .await;
                return Err(LockError::TransactionFailed(e.to_string()));
            }
            Err(e) => {
                // the transaction may still land; revoking the lease removes
                // the key along with it
                revoke_detached(store.clone(), lease_id);
                return Err(e);
            }
        };

        if !outcome.succeeded {
            debug!(key = %request.key, revision = outcome.revision, "Lock is held by another client");
            self.revoke_unused(store, &request.key, lease_id, deadline)
                .await;
            return Ok(Attempt::Contended {
                revision: outcome.revision,
            });
        }

        let renewal = self.renewals.start(
            lease_id,
            request.ttl,
            LeaseRenewer {
                store: store.clone(),
                lease_id,
            },
        );

        info!(key = %request.key, lease_id, ttl = ?request.ttl, "Lock acquired");
        Ok(Attempt::Acquired(HeldLock::new(
            request.key.clone(),
            OwnerToken::Lease(lease_id),
            request.ttl,
            renewal,
        )))
    }

    async fn acquire_once(&self, request: &LockRequest) -> Result<HeldLock, LockError> {
        let store = self.client()?;
        request.validate()?;

        match self.try_acquire(&store, request, None).await? {
            Attempt::Acquired(lock) => Ok(lock),
            Attempt::Contended { .. } => Err(LockError::LockHeld(request.key.clone())),
        }
    }

    async fn acquire_waiting(
        &self,
        request: &LockRequest,
        timeout: Duration,
    ) -> Result<HeldLock, LockError> {
        let store = self.client()?;
        request.validate()?;
        let deadline = Deadline::after(timeout);

        loop {
            let revision = match self.try_acquire(&store, request, Some(deadline)).await? {
                Attempt::Acquired(lock) => return Ok(lock),
                Attempt::Contended { revision } => revision,
            };

            // start right after the failed transaction so a delete that lands
            // before the watch is established is still seen
            let mut events = self
                .bounded(
                    &request.key,
                    Some(deadline),
                    store.watch(&request.key, revision + 1),
                )
                .await?
                .map_err(|e| LockError::Store(format!("failed to watch lock key: {}", e)))?;

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Err(LockError::Cancelled(request.key.clone()));
                }
                _ = sleep_until(deadline.at) => {
                    return Err(deadline.expired(&request.key));
                }
                _ = wait_for_delete(&mut events) => {
                    debug!(key = %request.key, "Lock key released, retrying acquisition");
                }
            }
        }
    }
}

fn revoke_detached<S: LeaseStore>(store: Arc<S>, lease_id: i64) {
    tokio::spawn(async move {
        if let Err(e) = store.revoke(lease_id).await {
            warn!(lease_id, error = %e, "Failed to revoke abandoned lease, it will expire on its own");
        }
    });
}

/// Wait until the watched key is deleted or the watch ends
async fn wait_for_delete(events: &mut WatchStream) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.kind == EventKind::Delete => return,
            Ok(_) => continue,
            Err(e) => {
                warn!(error = %e, "Lock watch failed, retrying acquisition");
                return;
            }
        }
    }
}

#[async_trait]
impl<S: LeaseStore> LockCoordinator for LeaseLockService<S> {
    fn backend(&self) -> BackendKind {
        BackendKind::Lease
    }

    async fn acquire(&self, request: &LockRequest) -> Result<HeldLock, LockError> {
        let result = self.acquire_once(request).await;
        metrics::record_acquire_result(BackendKind::Lease, &result);
        result
    }

    async fn acquire_blocking(
        &self,
        request: &LockRequest,
        timeout: Duration,
    ) -> Result<HeldLock, LockError> {
        let result = self.acquire_waiting(request, timeout).await;
        metrics::record_acquire_result(BackendKind::Lease, &result);
        result
    }

    async fn release(&self, lock: &HeldLock) -> Result<(), LockError> {
        let store = self.client()?;
        let Some(lease_id) = lock.token().lease_id() else {
            return Err(LockError::InvalidArgument(format!(
                "lock '{}' was not issued by a lease coordinator",
                lock.key()
            )));
        };

        // renewal must be gone before the lease is revoked
        lock.renewal().stop();
        self.renewals.stop(&lease_id).await;

        match store.revoke(lease_id).await {
            Ok(true) => {
                metrics::record_release(BackendKind::Lease, "released");
                info!(key = %lock.key(), lease_id, "Lock released");
                Ok(())
            }
            Ok(false) => {
                metrics::record_release(BackendKind::Lease, "expired");
                debug!(key = %lock.key(), lease_id, "Lock lease already expired");
                Ok(())
            }
            Err(e) => {
                metrics::record_release(BackendKind::Lease, "error");
                Err(LockError::Store(format!("failed to revoke lease: {}", e)))
            }
        }
    }

    async fn shutdown(&self) {
        // detach first so no acquisition can start a renewal after the sweep
        self.store.write().take();
        let stopped = self.renewals.close().await;
        info!(stopped, "Lease lock coordinator shut down");
    }

    fn active_renewals(&self) -> usize {
        self.renewals.len()
    }
}
