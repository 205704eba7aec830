//! Coordinator construction from settings

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{Backend, LockSettings};
use crate::lease::{LeaseLockService, MemoryLeaseStore};
use crate::lock::LockCoordinator;

/// Build the coordinator for the configured backend.
///
/// Cancelling `shutdown` stops every renewal task and ends every blocked
/// acquisition of the returned coordinator.
pub async fn connect(
    settings: &LockSettings,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn LockCoordinator>> {
    info!(backend = %settings.backend, "Creating lock coordinator");

    match settings.backend {
        Backend::Memory => Ok(Arc::new(LeaseLockService::new(
            Arc::new(MemoryLeaseStore::new()),
            shutdown,
        ))),
        Backend::Etcd => connect_etcd(settings, shutdown).await,
        Backend::Redis => connect_redis(settings, shutdown).await,
    }
}

#[cfg(feature = "etcd")]
async fn connect_etcd(
    settings: &LockSettings,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn LockCoordinator>> {
    let store = crate::lease::EtcdLeaseStore::connect(&settings.etcd).await?;
    Ok(Arc::new(LeaseLockService::new(Arc::new(store), shutdown)))
}

#[cfg(not(feature = "etcd"))]
async fn connect_etcd(
    _settings: &LockSettings,
    _shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn LockCoordinator>> {
    anyhow::bail!("etcd backend not enabled, rebuild with the 'etcd' feature")
}

#[cfg(feature = "redis")]
async fn connect_redis(
    settings: &LockSettings,
    shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn LockCoordinator>> {
    let store = crate::ttl::RedisTtlStore::connect(&settings.redis).await?;
    Ok(Arc::new(
        crate::ttl::TtlLockService::new(Arc::new(store), shutdown)
            .with_retry_count(settings.retry_count),
    ))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _settings: &LockSettings,
    _shutdown: CancellationToken,
) -> anyhow::Result<Arc<dyn LockCoordinator>> {
    anyhow::bail!("redis backend not enabled, rebuild with the 'redis' feature")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{BackendKind, LockRequest};

    #[tokio::test]
    async fn test_memory_backend() {
        let coordinator = connect(&LockSettings::default(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(coordinator.backend(), BackendKind::Lease);

        let request = LockRequest::new("k", std::time::Duration::from_secs(5));
        let lock = coordinator.acquire(&request).await.unwrap();
        coordinator.release(&lock).await.unwrap();
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_disabled_backend_is_an_error() {
        let settings = LockSettings {
            backend: Backend::Redis,
            ..Default::default()
        };
        assert!(connect(&settings, CancellationToken::new()).await.is_err());
    }
}
