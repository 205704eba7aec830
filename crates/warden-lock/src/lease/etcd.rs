//! etcd adapter for the lease backend

use anyhow::Context;
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, EventType, Identity, PutOptions,
    TlsOptions, Txn, TxnOp, WatchOptions, WatchStream as EtcdWatchStream, Watcher,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use super::{EventKind, LeaseStore, TxnOutcome, WatchEvent, WatchStream};
use crate::config::EtcdSettings;

/// [`LeaseStore`] over an etcd v3 cluster
#[derive(Clone)]
pub struct EtcdLeaseStore {
    client: Client,
}

impl EtcdLeaseStore {
    /// Connect to the configured endpoints and check the cluster answers
    pub async fn connect(settings: &EtcdSettings) -> anyhow::Result<Self> {
        if settings.endpoints.is_empty() {
            anyhow::bail!("no etcd endpoints specified");
        }

        let mut options = ConnectOptions::new().with_connect_timeout(settings.dial_timeout);
        if let Some((user, password)) = settings.credentials() {
            options = options.with_user(user, password);
        }
        if let Some((ca, cert, key)) = settings.tls_files() {
            let ca = tokio::fs::read(ca)
                .await
                .with_context(|| format!("failed to read etcd CA file {}", ca.display()))?;
            let cert = tokio::fs::read(cert)
                .await
                .with_context(|| format!("failed to read etcd cert file {}", cert.display()))?;
            let key = tokio::fs::read(key)
                .await
                .with_context(|| format!("failed to read etcd key file {}", key.display()))?;
            options = options.with_tls(
                TlsOptions::new()
                    .ca_certificate(Certificate::from_pem(ca))
                    .identity(Identity::from_pem(cert, key)),
            );
        }

        info!(endpoints = ?settings.endpoints, "Connecting to etcd");
        let mut client = Client::connect(&settings.endpoints, Some(options))
            .await
            .context("failed to connect to etcd")?;

        let status = client
            .status()
            .await
            .context("failed to query etcd cluster status")?;
        debug!(version = %status.version(), leader = status.leader(), "etcd cluster reachable");

        Ok(Self { client })
    }

    fn is_lease_not_found(error: &etcd_client::Error) -> bool {
        error.to_string().contains("requested lease not found")
    }
}

#[async_trait]
impl LeaseStore for EtcdLeaseStore {
    async fn grant(&self, ttl_secs: i64) -> anyhow::Result<i64> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?;
        Ok(lease.id())
    }

    async fn revoke(&self, lease_id: i64) -> anyhow::Result<bool> {
        let mut client = self.client.clone();
        match client.lease_revoke(lease_id).await {
            Ok(_) => Ok(true),
            Err(e) if Self::is_lease_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn keep_alive_once(&self, lease_id: i64) -> anyhow::Result<Option<i64>> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease_id).await?;
        keeper.keep_alive().await?;

        match responses.message().await? {
            Some(response) if response.ttl() > 0 => Ok(Some(response.ttl())),
            Some(_) => Ok(None),
            None => anyhow::bail!("etcd keep-alive stream closed for lease {:x}", lease_id),
        }
    }

    async fn time_to_live(&self, lease_id: i64) -> anyhow::Result<Option<i64>> {
        let mut client = self.client.clone();
        match client.lease_time_to_live(lease_id, None).await {
            // -1 for an expired lease, 0 for a lease granted without expiry
            Ok(response) if response.ttl() >= 0 => Ok(Some(response.ttl())),
            Ok(_) => Ok(None),
            Err(e) if Self::is_lease_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease_id: i64,
    ) -> anyhow::Result<TxnOutcome> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when([Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then([TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )]);

        let response = client.txn(txn).await?;
        let revision = response
            .header()
            .map(|header| header.revision())
            .context("etcd transaction response carries no header")?;

        Ok(TxnOutcome {
            succeeded: response.succeeded(),
            revision,
        })
    }

    async fn watch(&self, key: &str, start_revision: i64) -> anyhow::Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, stream) = client
            .watch(key, Some(WatchOptions::new().with_start_revision(start_revision)))
            .await?;

        // the watcher travels with the stream; dropping it ends the server-side watch
        let events = futures::stream::unfold(
            Some((watcher, stream)),
            |state: Option<(Watcher, EtcdWatchStream)>| async move {
                let (watcher, mut stream) = state?;
                match stream.message().await {
                    Ok(Some(response)) => {
                        let events: Vec<anyhow::Result<WatchEvent>> = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let kv = event.kv()?;
                                let kind = match event.event_type() {
                                    EventType::Put => EventKind::Put,
                                    EventType::Delete => EventKind::Delete,
                                };
                                Some(Ok(WatchEvent {
                                    key: kv.key_str().unwrap_or_default().to_string(),
                                    kind,
                                    revision: kv.mod_revision(),
                                }))
                            })
                            .collect();
                        if response.canceled() {
                            warn!(reason = %response.cancel_reason(), "etcd watch cancelled by server");
                            return Some((events, None));
                        }
                        Some((events, Some((watcher, stream))))
                    }
                    Ok(None) => None,
                    Err(e) => Some((vec![Err(e.into())], None)),
                }
            },
        )
        .flat_map(futures::stream::iter);

        Ok(events.boxed())
    }
}
