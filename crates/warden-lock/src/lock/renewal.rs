//! Lock renewal
//!
//! Every held lock gets one background task that extends its lease or TTL
//! at half the lock's lifetime. The task stops when the lock is released,
//! when the process-wide shutdown token is cancelled, or when a renewal
//! fails. A failed renewal is never retried: the lock is left to expire in
//! the store rather than risk extending a lock that may already belong to
//! someone else.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use warden_common::MIN_RENEW_INTERVAL_SECS;

use super::model::{BackendKind, RenewalHandle};
use crate::metrics;

/// Result of one renewal attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Lifetime extended by the lock's TTL
    Renewed,
    /// The lock no longer exists (or is no longer ours); nothing was extended
    Lapsed(&'static str),
}

/// Backend-specific "extend this lock once" operation
#[async_trait]
pub trait Renewer: Send + Sync + 'static {
    /// Check the lock is still alive, then extend it by its full TTL
    async fn renew(&self) -> anyhow::Result<RenewOutcome>;
}

struct RenewalEntry {
    generation: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Association table from owner tokens to their renewal tasks
pub struct RenewalRegistry<K> {
    backend: BackendKind,
    tasks: Arc<DashMap<K, RenewalEntry>>,
    /// Child of the process root; cancelled for good by [`RenewalRegistry::close`]
    closed: CancellationToken,
    generation: AtomicU64,
}

/// Renewal period for a lock of the given lifetime: half the TTL, never
/// below one second
pub fn renewal_interval(ttl: Duration) -> Duration {
    (ttl / 2).max(Duration::from_secs(MIN_RENEW_INTERVAL_SECS))
}

impl<K> RenewalRegistry<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a registry whose tasks all stop when `root` is cancelled
    pub fn new(backend: BackendKind, root: CancellationToken) -> Self {
        Self {
            backend,
            tasks: Arc::new(DashMap::new()),
            closed: root.child_token(),
            generation: AtomicU64::new(0),
        }
    }

    /// Start renewing the lock identified by `token`.
    ///
    /// A task already registered for the same token is cancelled first, so
    /// at most one renewal task exists per owner token.
    pub fn start<R: Renewer>(&self, token: K, ttl: Duration, renewer: R) -> RenewalHandle {
        // born cancelled once the registry is closed
        let cancel = self.closed.child_token();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        if let Some(previous) = self.tasks.insert(
            token.clone(),
            RenewalEntry {
                generation,
                cancel: cancel.clone(),
                handle: None,
            },
        ) {
            warn!(token = ?token, "Replacing an existing renewal task for the same owner token");
            previous.cancel.cancel();
        }
        metrics::set_active_renewals(self.backend, self.tasks.len());

        let period = renewal_interval(ttl);
        let backend = self.backend;
        let tasks = self.tasks.clone();
        let task_cancel = cancel.clone();
        let task_token = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        debug!(token = ?task_token, "Lock renewal stopped");
                        break;
                    }
                    _ = ticker.tick() => {}
                }

                let outcome = tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        debug!(token = ?task_token, "Lock renewal stopped during renewal call");
                        break;
                    }
                    outcome = renewer.renew() => outcome,
                };

                match outcome {
                    Ok(RenewOutcome::Renewed) => {
                        metrics::record_renewal(backend, "renewed");
                        debug!(token = ?task_token, "Lock renewed");
                    }
                    Ok(RenewOutcome::Lapsed(reason)) => {
                        metrics::record_renewal(backend, "lapsed");
                        warn!(token = ?task_token, reason, "Lock lapsed before renewal, stopping renewal");
                        break;
                    }
                    Err(e) => {
                        metrics::record_renewal(backend, "error");
                        error!(
                            token = ?task_token,
                            error = %e,
                            "Failed to renew lock, stopping renewal; the lock will expire"
                        );
                        break;
                    }
                }
            }

            task_cancel.cancel();
            tasks.remove_if(&task_token, |_, entry| entry.generation == generation);
            metrics::set_active_renewals(backend, tasks.len());
        });

        if let Some(mut entry) = self.tasks.get_mut(&token)
            && entry.generation == generation
        {
            entry.handle = Some(handle);
        }

        RenewalHandle::new(cancel)
    }

    /// Stop the renewal task for `token` and wait for it to exit.
    ///
    /// Returns false when no task was registered, e.g. because renewal had
    /// already stopped after the lock lapsed.
    pub async fn stop(&self, token: &K) -> bool {
        let Some((_, entry)) = self.tasks.remove(token) else {
            return false;
        };
        entry.cancel.cancel();
        metrics::set_active_renewals(self.backend, self.tasks.len());

        if let Some(handle) = entry.handle
            && let Err(e) = handle.await
        {
            warn!(token = ?token, error = %e, "Renewal task ended abnormally");
        }
        true
    }

    /// Stop every renewal task; returns how many were running
    pub async fn stop_all(&self) -> usize {
        let tokens: Vec<K> = self.tasks.iter().map(|entry| entry.key().clone()).collect();
        let mut stopped = 0;
        for token in tokens {
            if self.stop(&token).await {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every renewal task and refuse new ones; a task started after
    /// this exits before its first renewal
    pub async fn close(&self) -> usize {
        self.closed.cancel();
        self.stop_all().await
    }

    /// Whether a renewal task is registered for `token`
    pub fn contains(&self, token: &K) -> bool {
        self.tasks.contains_key(token)
    }

    /// Number of registered renewal tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
