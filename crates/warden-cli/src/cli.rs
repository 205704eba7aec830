//! Command line arguments and configuration loading

use clap::{Parser, Subcommand};
use config::{Config, Environment};
use warden_lock::Configuration;
use warden_lock::config::{ETCD_ENDPOINTS, LOCK_BACKEND, REDIS_URL};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Distributed lock client")]
pub struct Cli {
    /// Configuration file; missing files are ignored
    #[arg(short = 'c', long = "config", default_value = "conf/warden.yml")]
    pub config_file: String,
    /// Lock backend: etcd, redis or memory
    #[arg(short = 'b', long = "backend")]
    pub backend: Option<String>,
    /// Comma separated etcd endpoints
    #[arg(long = "etcd-endpoints")]
    pub etcd_endpoints: Option<String>,
    #[arg(long = "redis-url", env = "REDIS_URL")]
    pub redis_url: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Acquire a lock, hold it for a while, then release it
    Acquire {
        key: String,
        /// Lock TTL in seconds (default: warden.lock.ttl)
        #[arg(long)]
        ttl: Option<u64>,
        /// Seconds to hold the lock before releasing it
        #[arg(long, default_value_t = 5)]
        hold: u64,
        /// Block until the lock is free instead of failing immediately
        #[arg(long)]
        wait: bool,
        /// Blocking wait timeout in seconds (default: warden.lock.wait_timeout)
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Run several workers contending for one key and check they never overlap
    Contend {
        key: String,
        #[arg(long, default_value_t = 4)]
        workers: usize,
        /// Acquisitions per worker
        #[arg(long, default_value_t = 3)]
        rounds: u32,
        /// Milliseconds each worker holds the lock per round
        #[arg(long, default_value_t = 200)]
        hold_ms: u64,
    },
}

/// Layer the configuration file, the environment and command line overrides
pub fn load_configuration(cli: &Cli) -> anyhow::Result<Configuration> {
    let mut builder = Config::builder()
        .add_source(config::File::with_name(&cli.config_file).required(false))
        .add_source(Environment::default().separator("__").try_parsing(true));

    if let Some(v) = &cli.backend {
        builder = builder.set_override(LOCK_BACKEND, v.as_str())?;
    }
    if let Some(v) = &cli.etcd_endpoints {
        builder = builder.set_override(ETCD_ENDPOINTS, v.as_str())?;
    }
    if let Some(v) = &cli.redis_url {
        builder = builder.set_override(REDIS_URL, v.as_str())?;
    }

    Ok(Configuration::from_config(builder.build()?))
}
