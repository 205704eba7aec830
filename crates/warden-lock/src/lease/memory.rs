//! In-process lease store
//!
//! Keeps the whole key space behind one mutex, which gives the same
//! single-key atomicity as a real coordination store. Expired leases are
//! collected lazily on every call and by a background reaper, so watchers
//! see delete events even when nobody touches the store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;
use warden_common::ceil_secs;

use super::{EventKind, LeaseStore, TxnOutcome, WatchEvent, WatchStream};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const HISTORY_LIMIT: usize = 1024;
const REAP_INTERVAL: Duration = Duration::from_millis(100);

struct KeyEntry {
    value: String,
    lease_id: i64,
}

struct Lease {
    ttl_secs: i64,
    /// `None` for a lease granted with TTL 0, which never expires
    deadline: Option<Instant>,
    keys: HashSet<String>,
}

impl Lease {
    fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    fn refresh(&mut self, now: Instant) {
        self.deadline = lease_deadline(self.ttl_secs, now);
    }
}

fn lease_deadline(ttl_secs: i64, now: Instant) -> Option<Instant> {
    (ttl_secs > 0).then(|| now + Duration::from_secs(ttl_secs as u64))
}

#[derive(Default)]
struct State {
    revision: i64,
    next_lease_id: i64,
    keys: HashMap<String, KeyEntry>,
    leases: HashMap<i64, Lease>,
    history: VecDeque<WatchEvent>,
}

struct Inner {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
}

impl Inner {
    fn ensure_available(&self) -> anyhow::Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            anyhow::bail!("memory lease store is unavailable");
        }
        Ok(())
    }

    fn emit(&self, state: &mut State, key: String, kind: EventKind) {
        state.revision += 1;
        let event = WatchEvent {
            key,
            kind,
            revision: state.revision,
        };
        if state.history.len() == HISTORY_LIMIT {
            state.history.pop_front();
        }
        state.history.push_back(event.clone());
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn remove_lease(&self, state: &mut State, lease_id: i64) -> bool {
        let Some(lease) = state.leases.remove(&lease_id) else {
            return false;
        };
        for key in lease.keys {
            if state.keys.remove(&key).is_some() {
                self.emit(state, key, EventKind::Delete);
            }
        }
        true
    }

    fn expire(&self, state: &mut State, now: Instant) {
        let expired: Vec<i64> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired(now))
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            debug!(lease_id, "Memory lease expired");
            self.remove_lease(state, lease_id);
        }
    }
}

/// In-memory [`LeaseStore`]
#[derive(Clone)]
pub struct MemoryLeaseStore {
    inner: Arc<Inner>,
}

impl MemoryLeaseStore {
    /// Create an empty store. When called inside a tokio runtime, a reaper
    /// task expires leases in the background until the store is dropped.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            state: Mutex::new(State {
                next_lease_id: 1,
                ..Default::default()
            }),
            events,
            available: AtomicBool::new(true),
        });

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(reap(Arc::downgrade(&inner)));
        }

        Self { inner }
    }

    /// Make every subsequent call fail (or succeed again), like a store that
    /// became unreachable
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Current value of `key`, if it exists
    pub fn get(&self, key: &str) -> Option<String> {
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, Instant::now());
        state.keys.get(key).map(|entry| entry.value.clone())
    }

    /// Lease `key` is bound to, if it exists
    pub fn lease_of(&self, key: &str) -> Option<i64> {
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, Instant::now());
        state.keys.get(key).map(|entry| entry.lease_id)
    }

    /// Number of live leases
    pub fn lease_count(&self) -> usize {
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, Instant::now());
        state.leases.len()
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

async fn reap(inner: Weak<Inner>) {
    loop {
        tokio::time::sleep(REAP_INTERVAL).await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut state = inner.state.lock();
        inner.expire(&mut state, Instant::now());
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn grant(&self, ttl_secs: i64) -> anyhow::Result<i64> {
        self.inner.ensure_available()?;
        if ttl_secs < 0 {
            anyhow::bail!("lease ttl must not be negative: {}", ttl_secs);
        }

        let now = Instant::now();
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, now);

        let lease_id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            lease_id,
            Lease {
                ttl_secs,
                deadline: lease_deadline(ttl_secs, now),
                keys: HashSet::new(),
            },
        );
        Ok(lease_id)
    }

    async fn revoke(&self, lease_id: i64) -> anyhow::Result<bool> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, Instant::now());
        Ok(self.inner.remove_lease(&mut state, lease_id))
    }

    async fn keep_alive_once(&self, lease_id: i64) -> anyhow::Result<Option<i64>> {
        self.inner.ensure_available()?;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, now);

        Ok(state.leases.get_mut(&lease_id).map(|lease| {
            lease.refresh(now);
            lease.ttl_secs
        }))
    }

    async fn time_to_live(&self, lease_id: i64) -> anyhow::Result<Option<i64>> {
        self.inner.ensure_available()?;
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, now);

        Ok(state.leases.get(&lease_id).map(|lease| match lease.deadline {
            Some(deadline) => ceil_secs(deadline.saturating_duration_since(now)) as i64,
            None => lease.ttl_secs,
        }))
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease_id: i64,
    ) -> anyhow::Result<TxnOutcome> {
        self.inner.ensure_available()?;
        let mut state = self.inner.state.lock();
        self.inner.expire(&mut state, Instant::now());

        if !state.leases.contains_key(&lease_id) {
            anyhow::bail!("requested lease not found: {}", lease_id);
        }
        if state.keys.contains_key(key) {
            return Ok(TxnOutcome {
                succeeded: false,
                revision: state.revision,
            });
        }

        state.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                lease_id,
            },
        );
        if let Some(lease) = state.leases.get_mut(&lease_id) {
            lease.keys.insert(key.to_string());
        }
        self.inner.emit(&mut state, key.to_string(), EventKind::Put);

        Ok(TxnOutcome {
            succeeded: true,
            revision: state.revision,
        })
    }

    async fn watch(&self, key: &str, start_revision: i64) -> anyhow::Result<WatchStream> {
        self.inner.ensure_available()?;

        // replay and subscribe under the same lock so no event falls in between
        let state = self.inner.state.lock();
        let replay: Vec<anyhow::Result<WatchEvent>> = state
            .history
            .iter()
            .filter(|event| event.key == key && event.revision >= start_revision)
            .cloned()
            .map(Ok)
            .collect();
        let receiver = self.inner.events.subscribe();
        drop(state);

        let key = key.to_string();
        let live = BroadcastStream::new(receiver).filter_map(move |item| {
            let item = match item {
                Ok(event) if event.key == key && event.revision >= start_revision => {
                    Some(Ok(event))
                }
                Ok(_) => None,
                Err(e) => Some(Err(anyhow::anyhow!("watch stream lagged: {}", e))),
            };
            futures::future::ready(item)
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }
}
