//! Conditional-set + TTL lock backend
//!
//! A lock is a key set only if absent, with the owner's unique value and an
//! expiry. The value is the owner token. Renewal and release are both
//! evaluated atomically by the store against that value, so a holder whose
//! TTL lapsed can never extend or delete a lock somebody else took since.

use std::time::Duration;

use async_trait::async_trait;

mod memory;
mod service;

#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryTtlStore;
pub use service::TtlLockService;

#[cfg(feature = "redis")]
pub use self::redis::RedisTtlStore;

/// Result of an owner-checked TTL extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// The key still carried our value and its TTL was reset
    Extended,
    /// The key no longer exists (or has no expiry left)
    Expired,
    /// The key exists but now carries a different value
    Stolen,
}

/// Result of an owner-checked delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Deleted,
    /// Nothing to delete; the key already expired or was removed
    Missing,
    /// The key carries a different value and was left alone
    Mismatch,
}

/// Operations the TTL backend needs from its store
#[async_trait]
pub trait TtlStore: Send + Sync + 'static {
    /// Set `key = value` with expiry `ttl` only if the key does not exist
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    /// Remaining lifetime of `key`; `None` when it is missing or never expires
    async fn remaining_ttl(&self, key: &str) -> anyhow::Result<Option<Duration>>;

    /// Remaining lifetime of `key` while it still carries `value`; `None`
    /// when it is missing, never expires or belongs to someone else
    async fn owner_ttl(&self, key: &str, value: &str) -> anyhow::Result<Option<Duration>>;

    /// Reset the expiry of `key` to `ttl` if it still exists with a positive
    /// TTL and its value is `value`
    async fn extend_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<Extension>;

    /// Delete `key` if its value is `value`
    async fn compare_and_delete(&self, key: &str, value: &str) -> anyhow::Result<Removal>;
}
