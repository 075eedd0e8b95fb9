// Node configuration from environment variables.
use anyhow::{Context, Result};
use courier_pool::PoolConfig;
use courier_transport::Url;

pub struct NodeConfig {
    pub listen: Url,
    pub pool: PoolConfig,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let listen = std::env::var("COURIER_LISTEN")
            .unwrap_or_else(|_| "tcp://127.0.0.1:9559".to_string())
            .parse::<Url>()
            .context("parse COURIER_LISTEN")?;
        let defaults = PoolConfig::default();
        let pool = PoolConfig {
            min_workers: env_usize("COURIER_POOL_MIN", defaults.min_workers)?,
            max_workers: env_usize("COURIER_POOL_MAX", defaults.max_workers)?,
            min_idle: env_usize("COURIER_POOL_MIN_IDLE", defaults.min_idle)?,
            max_idle: env_usize("COURIER_POOL_MAX_IDLE", defaults.max_idle)?,
        };
        Ok(Self { listen, pool })
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(value) => value.parse().with_context(|| format!("parse {name}")),
        Err(_) => Ok(default),
    }
}
