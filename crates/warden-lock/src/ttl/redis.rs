//! Redis adapter for the TTL backend

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use super::{Extension, Removal, TtlStore};
use crate::config::RedisSettings;

/// Reset the expiry only while the key still holds our value and has not
/// expired. Returns 1 extended, 0 expired, -1 held by someone else.
static EXTEND_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if current == false then
            return 0
        end
        if current ~= ARGV[1] then
            return -1
        end
        if redis.call('PTTL', KEYS[1]) <= 0 then
            return 0
        end
        redis.call('PEXPIRE', KEYS[1], ARGV[2])
        return 1
        ",
    )
});

/// Delete the key only while it holds our value.
/// Returns 1 deleted, 0 missing, -1 held by someone else.
static DELETE_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if current == false then
            return 0
        end
        if current ~= ARGV[1] then
            return -1
        end
        redis.call('DEL', KEYS[1])
        return 1
        ",
    )
});

/// Remaining lifetime in milliseconds while the key holds our value.
/// Returns -2 missing, -3 held by someone else, -1 no expiry.
static OWNER_TTL_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local current = redis.call('GET', KEYS[1])
        if current == false then
            return -2
        end
        if current ~= ARGV[1] then
            return -3
        end
        return redis.call('PTTL', KEYS[1])
        ",
    )
});

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// [`TtlStore`] over a Redis connection manager, which reconnects on its own
#[derive(Clone)]
pub struct RedisTtlStore {
    manager: ConnectionManager,
}

impl RedisTtlStore {
    pub async fn connect(settings: &RedisSettings) -> anyhow::Result<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .with_context(|| format!("invalid redis url '{}'", settings.url))?;
        let manager = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;

        info!(url = %settings.url, "Connected to redis");
        Ok(Self { manager })
    }
}

#[async_trait]
impl TtlStore for RedisTtlStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn remaining_ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let mut conn = self.manager.clone();
        let pttl: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2 missing, -1 no expiry
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn owner_ttl(&self, key: &str, value: &str) -> anyhow::Result<Option<Duration>> {
        let mut conn = self.manager.clone();
        let pttl: i64 = OWNER_TTL_SCRIPT
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok((pttl >= 0).then(|| Duration::from_millis(pttl as u64)))
    }

    async fn extend_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<Extension> {
        let mut conn = self.manager.clone();
        let reply: i64 = EXTEND_SCRIPT
            .key(key)
            .arg(value)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(match reply {
            1 => Extension::Extended,
            -1 => Extension::Stolen,
            _ => Extension::Expired,
        })
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> anyhow::Result<Removal> {
        let mut conn = self.manager.clone();
        let reply: i64 = DELETE_SCRIPT
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(match reply {
            1 => Removal::Deleted,
            -1 => Removal::Mismatch,
            _ => Removal::Missing,
        })
    }
}
