//! Subcommand implementations

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use warden_common::new_owner_id;
use warden_lock::{LockCoordinator, LockError, LockRequest, LockSettings};

use crate::cli::Command;

pub async fn run(
    command: &Command,
    coordinator: Arc<dyn LockCoordinator>,
    settings: &LockSettings,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    match command {
        Command::Acquire {
            key,
            ttl,
            hold,
            wait,
            timeout,
        } => {
            let request = LockRequest::new(key.as_str(), ttl.map_or(settings.ttl(), Duration::from_secs))
                .with_retry_count(settings.retry_count);
            let timeout = if *wait {
                Some(timeout.map_or(settings.wait_timeout(), Duration::from_secs))
            } else {
                None
            };
            acquire_and_hold(
                coordinator.as_ref(),
                &request,
                timeout,
                Duration::from_secs(*hold),
                shutdown,
            )
            .await
        }
        Command::Contend {
            key,
            workers,
            rounds,
            hold_ms,
        } => {
            let report = contend(
                coordinator,
                settings,
                key,
                *workers,
                *rounds,
                Duration::from_millis(*hold_ms),
            )
            .await;
            info!(
                acquisitions = report.acquisitions,
                failures = report.failures,
                max_holders = report.max_holders,
                "Contention run finished"
            );
            if report.max_holders > 1 {
                anyhow::bail!(
                    "mutual exclusion violated: {} concurrent holders of '{}'",
                    report.max_holders,
                    key
                );
            }
            Ok(())
        }
    }
}

async fn acquire_and_hold(
    coordinator: &dyn LockCoordinator,
    request: &LockRequest,
    timeout: Option<Duration>,
    hold: Duration,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let lock = match timeout {
        Some(timeout) => coordinator.acquire_blocking(request, timeout).await?,
        None => coordinator.acquire(request).await?,
    };
    info!(key = %lock.key(), token = %lock.token(), "Holding lock for {:?}", hold);

    tokio::select! {
        _ = tokio::time::sleep(hold) => {}
        _ = shutdown.cancelled() => {
            warn!(key = %lock.key(), "Interrupted, releasing lock early");
        }
    }

    if !lock.renewal().is_active() && !shutdown.is_cancelled() {
        warn!(key = %lock.key(), "Lock renewal stopped while holding, the lock may have expired");
    }

    match coordinator.release(&lock).await {
        // shutdown already detached the store; the lease or TTL runs out on its own
        Err(LockError::NotInitialized) => Ok(()),
        other => Ok(other?),
    }
}

/// Request for one contention worker. The owner id stays unique across
/// processes so overlapping runs never mistake each other's locks for their own.
fn worker_request(settings: &LockSettings, key: &str, worker: usize) -> LockRequest {
    LockRequest::new(key, settings.ttl())
        .with_owner(format!("{}-worker-{}", new_owner_id(), worker))
        .with_retry_count(settings.retry_count)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ContentionReport {
    pub acquisitions: usize,
    pub failures: usize,
    pub max_holders: usize,
}

/// Run `workers` tasks that each take and release the lock `rounds` times,
/// tracking the largest number of simultaneous holders seen
pub async fn contend(
    coordinator: Arc<dyn LockCoordinator>,
    settings: &LockSettings,
    key: &str,
    workers: usize,
    rounds: u32,
    hold: Duration,
) -> ContentionReport {
    let holders = Arc::new(AtomicUsize::new(0));
    let max_holders = Arc::new(AtomicUsize::new(0));
    let acquisitions = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let coordinator = coordinator.clone();
        let holders = holders.clone();
        let max_holders = max_holders.clone();
        let acquisitions = acquisitions.clone();
        let failures = failures.clone();
        let request = worker_request(settings, key, worker);
        let timeout = settings.wait_timeout();

        handles.push(tokio::spawn(async move {
            for round in 0..rounds {
                let lock = match coordinator.acquire_blocking(&request, timeout).await {
                    Ok(lock) => lock,
                    Err(e) => {
                        warn!(worker, round, error = %e, "Worker failed to acquire lock");
                        failures.fetch_add(1, Ordering::SeqCst);
                        if matches!(e, LockError::Cancelled(_) | LockError::NotInitialized) {
                            return;
                        }
                        continue;
                    }
                };

                let now_holding = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_holders.fetch_max(now_holding, Ordering::SeqCst);
                acquisitions.fetch_add(1, Ordering::SeqCst);
                if now_holding > 1 {
                    error!(worker, round, now_holding, "More than one holder of the lock");
                }

                tokio::time::sleep(hold).await;
                holders.fetch_sub(1, Ordering::SeqCst);

                if let Err(e) = coordinator.release(&lock).await {
                    warn!(worker, round, error = %e, "Worker failed to release lock");
                    failures.fetch_add(1, Ordering::SeqCst);
                }
            }
        }));
    }

    for handle in futures::future::join_all(handles).await {
        if let Err(e) = handle {
            error!(error = %e, "Contention worker panicked");
        }
    }

    ContentionReport {
        acquisitions: acquisitions.load(Ordering::SeqCst),
        failures: failures.load(Ordering::SeqCst),
        max_holders: max_holders.load(Ordering::SeqCst),
    }
}
