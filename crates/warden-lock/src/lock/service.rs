//! Lock coordinator interface
//!
//! One trait, two independent implementations (lease + transaction, and
//! conditional set + TTL), picked when the coordinator is constructed.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use warden_common::LockError;

use super::model::{BackendKind, HeldLock, LockRequest};

/// Distributed lock coordinator
#[async_trait]
pub trait LockCoordinator: Send + Sync {
    /// The store family this coordinator runs on
    fn backend(&self) -> BackendKind;

    /// Try to take the lock exactly once.
    ///
    /// Fails with [`LockError::LockHeld`] when another owner holds the key,
    /// without retrying. On success a renewal task keeps the lock alive until
    /// it is released.
    async fn acquire(&self, request: &LockRequest) -> Result<HeldLock, LockError>;

    /// Keep trying to take the lock until it succeeds, `timeout` elapses
    /// ([`LockError::Timeout`]) or the coordinator's shutdown token is
    /// cancelled ([`LockError::Cancelled`]).
    async fn acquire_blocking(
        &self,
        request: &LockRequest,
        timeout: Duration,
    ) -> Result<HeldLock, LockError>;

    /// Stop the lock's renewal, then remove it from the store with an owner
    /// check. Releasing a lock that already expired succeeds.
    async fn release(&self, lock: &HeldLock) -> Result<(), LockError>;

    /// Stop every renewal task and detach the store. Every call made after
    /// this returns [`LockError::NotInitialized`].
    async fn shutdown(&self);

    /// Number of locks currently kept alive by this coordinator
    fn active_renewals(&self) -> usize;
}

/// Overall bound of one blocking acquisition
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub(crate) at: Instant,
    timeout: Duration,
}

impl Deadline {
    pub(crate) fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    pub(crate) fn expired(&self, key: &str) -> LockError {
        LockError::Timeout {
            key: key.to_string(),
            timeout: self.timeout,
        }
    }
}

/// Await one store call, giving up at the deadline or when `shutdown` is
/// cancelled. Without a deadline the call runs to completion.
pub(crate) async fn bounded<T>(
    key: &str,
    deadline: Option<Deadline>,
    shutdown: &CancellationToken,
    call: impl Future<Output = anyhow::Result<T>>,
) -> Result<anyhow::Result<T>, LockError> {
    let Some(deadline) = deadline else {
        return Ok(call.await);
    };
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(LockError::Cancelled(key.to_string())),
        result = timeout_at(deadline.at, call) => result.map_err(|_| deadline.expired(key)),
    }
}
