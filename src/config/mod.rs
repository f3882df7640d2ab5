//! Environment-resolved configuration.
//!
//! Each subsystem owns a config struct with a `resolve()` constructor that
//! reads `TOOLGATE_*` environment variables and falls back to documented
//! defaults. `.env` files are loaded by `main.rs` via dotenvy before
//! resolution. There is no YAML layer: the environment is the single
//! source of configuration.

mod executor;
mod helpers;
mod jobs;
mod router;
mod upstream;

use std::path::PathBuf;

pub use executor::{ExecutorConfig, SandboxConfig};
pub use helpers::{optional_env, parse_optional_env};
pub use jobs::JobsConfig;
pub use router::{LlmApiKind, LlmProviderConfig, RouterConfig};
pub use upstream::{BreakerConfig, PoolConfig};

use crate::error::ConfigError;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding durable state (sled databases).
    pub data_dir: PathBuf,
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub executor: ExecutorConfig,
    pub sandbox: SandboxConfig,
    pub jobs: JobsConfig,
    pub router: RouterConfig,
}

impl Config {
    /// Resolve the full configuration from the environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            data_dir: resolve_data_dir()?,
            pool: PoolConfig::resolve()?,
            breaker: BreakerConfig::resolve()?,
            executor: ExecutorConfig::resolve()?,
            sandbox: SandboxConfig::resolve()?,
            jobs: JobsConfig::resolve()?,
            router: RouterConfig::resolve()?,
        })
    }
}

/// Default data directory: `$TOOLGATE_DATA_DIR`, else `~/.toolgate`.
fn resolve_data_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = optional_env("TOOLGATE_DATA_DIR")? {
        return Ok(PathBuf::from(dir));
    }
    Ok(dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolgate"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_numbers() {
        let pool = PoolConfig::default();
        assert_eq!(pool.sweep_interval.as_secs(), 30);
        assert_eq!(pool.health_check_timeout.as_secs(), 2);
        assert_eq!(pool.init_timeout.as_secs(), 10);
        assert_eq!(pool.max_connection_errors, 5);
        assert_eq!(PoolConfig::STDIO_MAX_CONNECTIONS, 3);

        let breaker = BreakerConfig::default();
        assert_eq!(breaker.window.as_secs(), 10);
        assert_eq!(breaker.min_requests, 5);
        assert!((breaker.failure_ratio - 0.6).abs() < f64::EPSILON);
        assert_eq!(breaker.open_timeout.as_secs(), 30);
        assert_eq!(breaker.half_open_max, 3);

        let jobs = JobsConfig::default();
        assert_eq!(jobs.queue_size, 1000);
        assert_eq!(jobs.num_workers, 10);
        assert_eq!(jobs.job_timeout.as_secs(), 300);
        assert_eq!(jobs.cleanup_interval.as_secs(), 300);

        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.pool_size, 10);
        assert_eq!(sandbox.acquire_timeout.as_secs(), 5);
        assert_eq!(sandbox.max_call_levels, 1000);

        assert_eq!(ExecutorConfig::default().timeout.as_secs(), 30);
    }
}
