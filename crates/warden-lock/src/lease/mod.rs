//! Lease + transaction lock backend
//!
//! A lock is a key written by a transaction guarded on the key's create
//! revision being zero, bound to a lease granted for the lock's TTL. The
//! lease id is the owner token; revoking it deletes the key. Blocked
//! waiters watch the key for a delete instead of polling.

use async_trait::async_trait;
use futures::stream::BoxStream;

mod memory;
mod service;

#[cfg(feature = "etcd")]
mod etcd;

pub use memory::MemoryLeaseStore;
pub use service::LeaseLockService;

#[cfg(feature = "etcd")]
pub use etcd::EtcdLeaseStore;

/// Result of a create-if-absent transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOutcome {
    /// Whether the guard held and the key was written
    pub succeeded: bool,
    /// Store revision the transaction was evaluated at
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change to a watched key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    pub kind: EventKind,
    pub revision: i64,
}

pub type WatchStream = BoxStream<'static, anyhow::Result<WatchEvent>>;

/// Operations the lease backend needs from its coordination store
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Grant a lease that expires after `ttl_secs` unless kept alive
    async fn grant(&self, ttl_secs: i64) -> anyhow::Result<i64>;

    /// Revoke a lease and delete every key bound to it.
    /// Returns false when the lease no longer exists.
    async fn revoke(&self, lease_id: i64) -> anyhow::Result<bool>;

    /// Refresh a lease once, returning its new remaining lifetime in seconds,
    /// or `None` when the lease has already expired
    async fn keep_alive_once(&self, lease_id: i64) -> anyhow::Result<Option<i64>>;

    /// Remaining lifetime of a lease in seconds, `None` when expired or unknown
    async fn time_to_live(&self, lease_id: i64) -> anyhow::Result<Option<i64>>;

    /// Write `key = value` bound to `lease_id` if and only if the key does not
    /// exist (create revision zero)
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease_id: i64,
    ) -> anyhow::Result<TxnOutcome>;

    /// Subscribe to changes of `key`, replaying events from `start_revision`
    async fn watch(&self, key: &str, start_revision: i64) -> anyhow::Result<WatchStream>;
}
