//! Lock backend configuration
//!
//! Settings are plain structs with defaults; [`Configuration`] reads them
//! from a layered `config::Config` (file, environment, overrides) built by
//! the embedding application.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use config::Config;
use warden_common::DEFAULT_RETRY_COUNT;

pub const LOCK_BACKEND: &str = "warden.lock.backend";
pub const LOCK_TTL: &str = "warden.lock.ttl";
pub const LOCK_WAIT_TIMEOUT: &str = "warden.lock.wait_timeout";
pub const LOCK_RETRY_COUNT: &str = "warden.lock.retry_count";
pub const ETCD_ENDPOINTS: &str = "warden.etcd.endpoints";
pub const ETCD_DIAL_TIMEOUT: &str = "warden.etcd.dial_timeout";
pub const ETCD_USERNAME: &str = "warden.etcd.username";
pub const ETCD_PASSWORD: &str = "warden.etcd.password";
pub const ETCD_CA_FILE: &str = "warden.etcd.ca_file";
pub const ETCD_CERT_FILE: &str = "warden.etcd.cert_file";
pub const ETCD_KEY_FILE: &str = "warden.etcd.key_file";
pub const REDIS_URL: &str = "warden.redis.url";

pub const DEFAULT_LOCK_TTL_SECS: u64 = 10;
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_ETCD_ENDPOINTS: &str = "127.0.0.1:2379";
pub const DEFAULT_ETCD_DIAL_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Coordination store a coordinator is built on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// In-process lease store, for tests and single-process use
    #[default]
    Memory,
    Etcd,
    Redis,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Backend::Memory),
            "etcd" => Ok(Backend::Etcd),
            "redis" => Ok(Backend::Redis),
            other => anyhow::bail!("unknown lock backend '{}', expected etcd, redis or memory", other),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Memory => "memory",
            Backend::Etcd => "etcd",
            Backend::Redis => "redis",
        };
        write!(f, "{}", name)
    }
}

/// etcd connection settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdSettings {
    pub endpoints: Vec<String>,
    pub dial_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            endpoints: parse_endpoints(DEFAULT_ETCD_ENDPOINTS),
            dial_timeout: Duration::from_secs(DEFAULT_ETCD_DIAL_TIMEOUT_SECS),
            username: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

impl EtcdSettings {
    /// CA, certificate and key, when all three are configured
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf, &PathBuf)> {
        match (&self.ca_file, &self.cert_file, &self.key_file) {
            (Some(ca), Some(cert), Some(key)) => Some((ca, cert, key)),
            _ => None,
        }
    }

    /// Credentials, when a username is configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.username
            .as_deref()
            .map(|user| (user, self.password.as_deref().unwrap_or_default()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

/// Everything needed to build a coordinator and to issue lock requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSettings {
    pub backend: Backend,
    pub ttl_secs: u64,
    pub wait_timeout_secs: u64,
    pub retry_count: u32,
    pub etcd: EtcdSettings,
    pub redis: RedisSettings,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            ttl_secs: DEFAULT_LOCK_TTL_SECS,
            wait_timeout_secs: DEFAULT_WAIT_TIMEOUT_SECS,
            retry_count: DEFAULT_RETRY_COUNT,
            etcd: EtcdSettings::default(),
            redis: RedisSettings::default(),
        }
    }
}

impl LockSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

fn parse_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
        .collect()
}

/// Application configuration loaded from config files and environment
#[derive(Clone, Debug, Default)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    fn optional_string(&self, key: &str) -> Option<String> {
        self.config
            .get_string(key)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    pub fn backend(&self) -> anyhow::Result<Backend> {
        self.optional_string(LOCK_BACKEND)
            .map_or(Ok(Backend::default()), |v| v.parse())
    }

    pub fn lock_ttl_secs(&self) -> u64 {
        self.config
            .get_int(LOCK_TTL)
            .map_or(DEFAULT_LOCK_TTL_SECS, |v| v.max(0) as u64)
    }

    pub fn lock_wait_timeout_secs(&self) -> u64 {
        self.config
            .get_int(LOCK_WAIT_TIMEOUT)
            .map_or(DEFAULT_WAIT_TIMEOUT_SECS, |v| v.max(0) as u64)
    }

    pub fn lock_retry_count(&self) -> u32 {
        self.config
            .get_int(LOCK_RETRY_COUNT)
            .map_or(DEFAULT_RETRY_COUNT, |v| v.clamp(1, u32::MAX as i64) as u32)
    }

    pub fn etcd_settings(&self) -> anyhow::Result<EtcdSettings> {
        let endpoints = parse_endpoints(
            &self
                .config
                .get_string(ETCD_ENDPOINTS)
                .unwrap_or_else(|_| DEFAULT_ETCD_ENDPOINTS.to_string()),
        );
        if endpoints.is_empty() {
            anyhow::bail!("no etcd endpoints specified in '{}'", ETCD_ENDPOINTS);
        }

        let dial_timeout = self
            .config
            .get_int(ETCD_DIAL_TIMEOUT)
            .ok()
            .filter(|v| *v > 0)
            .map_or(DEFAULT_ETCD_DIAL_TIMEOUT_SECS, |v| v as u64);

        Ok(EtcdSettings {
            endpoints,
            dial_timeout: Duration::from_secs(dial_timeout),
            username: self.optional_string(ETCD_USERNAME),
            password: self.optional_string(ETCD_PASSWORD),
            ca_file: self.optional_string(ETCD_CA_FILE).map(PathBuf::from),
            cert_file: self.optional_string(ETCD_CERT_FILE).map(PathBuf::from),
            key_file: self.optional_string(ETCD_KEY_FILE).map(PathBuf::from),
        })
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self
                .optional_string(REDIS_URL)
                .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
        }
    }

    /// Collect every lock setting, failing on values that cannot be used
    pub fn lock_settings(&self) -> anyhow::Result<LockSettings> {
        Ok(LockSettings {
            backend: self.backend()?,
            ttl_secs: self.lock_ttl_secs(),
            wait_timeout_secs: self.lock_wait_timeout_secs(),
            retry_count: self.lock_retry_count(),
            etcd: self.etcd_settings()?,
            redis: self.redis_settings(),
        })
    }
}
