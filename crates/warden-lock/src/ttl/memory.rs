//! In-process TTL store

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Extension, Removal, TtlStore};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory [`TtlStore`]; expired keys are dropped lazily on access
#[derive(Clone, Default)]
pub struct MemoryTtlStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryTtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail (or succeed again), like a store that
    /// became unreachable
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Current value of `key`, if it exists and has not expired
    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        live_entry(&mut entries, key, Instant::now()).map(|entry| entry.value.clone())
    }

    /// Overwrite `key` unconditionally, like a foreign client would
    pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn ensure_available(&self) -> anyhow::Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("memory ttl store is unavailable");
        }
        Ok(())
    }
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.expires_at <= now) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

#[async_trait]
impl TtlStore for MemoryTtlStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if live_entry(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn remaining_ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live_entry(&mut entries, key, now).map(|entry| entry.expires_at - now))
    }

    async fn owner_ttl(&self, key: &str, value: &str) -> anyhow::Result<Option<Duration>> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(live_entry(&mut entries, key, now)
            .filter(|entry| entry.value == value)
            .map(|entry| entry.expires_at - now))
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<Extension> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        Ok(match live_entry(&mut entries, key, now) {
            None => Extension::Expired,
            Some(entry) if entry.value != value => Extension::Stolen,
            Some(entry) => {
                entry.expires_at = now + ttl;
                Extension::Extended
            }
        })
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> anyhow::Result<Removal> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let removal = match live_entry(&mut entries, key, Instant::now()) {
            None => Removal::Missing,
            Some(entry) if entry.value != value => Removal::Mismatch,
            Some(_) => Removal::Deleted,
        };
        if removal == Removal::Deleted {
            entries.remove(key);
        }
        Ok(removal)
    }
}
