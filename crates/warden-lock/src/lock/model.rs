//! Distributed lock data model

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use warden_common::{LockError, new_owner_id};

/// Which family of coordination store a coordinator runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Lease + transaction store (etcd style)
    Lease,
    /// Conditional-set + expiry store (Redis style)
    Ttl,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Lease => "lease",
            BackendKind::Ttl => "ttl",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Proof of current lock possession, checked by the store on release
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OwnerToken {
    /// Lease id granted by the store; every key bound to it goes away on revoke
    Lease(i64),
    /// Caller-unique value written as the key's value
    Value(String),
}

impl OwnerToken {
    pub fn lease_id(&self) -> Option<i64> {
        match self {
            OwnerToken::Lease(id) => Some(*id),
            OwnerToken::Value(_) => None,
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            OwnerToken::Lease(_) => None,
            OwnerToken::Value(v) => Some(v),
        }
    }

    /// The backend family this token was issued by
    pub fn backend(&self) -> BackendKind {
        match self {
            OwnerToken::Lease(_) => BackendKind::Lease,
            OwnerToken::Value(_) => BackendKind::Ttl,
        }
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnerToken::Lease(id) => write!(f, "lease:{:x}", id),
            OwnerToken::Value(v) => write!(f, "{}", v),
        }
    }
}

/// Parameters of one acquisition call
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Name of the protected resource in the store's key space
    pub key: String,
    /// Lock lifetime; renewed at half this period while held
    pub ttl: Duration,
    /// Unique owner id. Written as the key's value; for TTL stores it is
    /// also the owner token.
    pub owner: String,
    /// Number of polling attempts spread over a blocking wait (TTL stores).
    /// `None` uses the coordinator's configured value.
    pub retry_count: Option<u32>,
}

impl LockRequest {
    /// Create a request with a freshly generated owner id
    pub fn new(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            owner: new_owner_id(),
            retry_count: None,
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub(crate) fn validate(&self) -> Result<(), LockError> {
        if self.key.is_empty() {
            return Err(LockError::InvalidArgument(
                "lock key must not be empty".to_string(),
            ));
        }
        if self.owner.is_empty() {
            return Err(LockError::InvalidArgument(
                "lock owner must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Observable side of a lock's background renewal task
#[derive(Debug, Clone)]
pub struct RenewalHandle {
    cancel: CancellationToken,
}

impl RenewalHandle {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// A handle for a lock with no renewal task behind it
    pub(crate) fn inactive() -> Self {
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self { cancel }
    }

    /// Whether the renewal task is still keeping the lock alive.
    ///
    /// Turns false on release, on shutdown, and when a renewal fails. A
    /// holder that must not outlive its lock should check this (or the
    /// store's remaining TTL) before doing protected work.
    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Wait until the renewal task has stopped
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

/// A lock acquired by this process.
///
/// Dropping a `HeldLock` without releasing it stops its renewal; the store
/// then expires the key once its TTL lapses.
#[derive(Debug)]
#[must_use = "dropping a HeldLock stops its renewal"]
pub struct HeldLock {
    key: String,
    token: OwnerToken,
    ttl: Duration,
    acquired_at: DateTime<Utc>,
    renewal: RenewalHandle,
}

impl HeldLock {
    pub(crate) fn new(
        key: impl Into<String>,
        token: OwnerToken,
        ttl: Duration,
        renewal: RenewalHandle,
    ) -> Self {
        Self {
            key: key.into(),
            token,
            ttl,
            acquired_at: Utc::now(),
            renewal,
        }
    }

    /// Rebuild a lock handle from a key and token obtained elsewhere, e.g.
    /// persisted by an earlier incarnation of this process. It carries no
    /// renewal task; releasing it still goes through the store's owner check.
    pub fn from_parts(key: impl Into<String>, token: OwnerToken, ttl: Duration) -> Self {
        Self::new(key, token, ttl, RenewalHandle::inactive())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &OwnerToken {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn renewal(&self) -> &RenewalHandle {
        &self.renewal
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.renewal.stop();
    }
}
