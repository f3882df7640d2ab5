//! Upstream connection pool and circuit breaker configuration.

use std::time::Duration;

use crate::config::helpers::{parse_duration_secs, parse_optional_env};
use crate::error::ConfigError;

/// Per-server connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections per upstream server.
    pub max_connections: usize,
    /// Connections idle longer than this are closed by the sweeper.
    pub idle_timeout: Duration,
    /// Sweeper period.
    pub sweep_interval: Duration,
    /// Budget for the borrow-time health probe (`tools/list`).
    pub health_check_timeout: Duration,
    /// Budget for creating and initializing a fresh connection.
    pub init_timeout: Duration,
    /// A connection whose error count exceeds this on release is closed.
    pub max_connection_errors: u64,
    /// Restart policy applied to subprocess transports.
    pub stdio_auto_restart: bool,
    pub stdio_max_restarts: u32,
    pub stdio_restart_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(2),
            init_timeout: Duration::from_secs(10),
            max_connection_errors: 5,
            stdio_auto_restart: true,
            stdio_max_restarts: 3,
            stdio_restart_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Pools over subprocess transports are capped regardless of
    /// `max_connections`: each connection owns a child process.
    pub const STDIO_MAX_CONNECTIONS: usize = 3;

    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_connections: parse_optional_env(
                "TOOLGATE_POOL_MAX_CONNECTIONS",
                defaults.max_connections,
            )?,
            idle_timeout: parse_duration_secs("TOOLGATE_POOL_IDLE_TIMEOUT", defaults.idle_timeout)?,
            sweep_interval: defaults.sweep_interval,
            health_check_timeout: defaults.health_check_timeout,
            init_timeout: defaults.init_timeout,
            max_connection_errors: defaults.max_connection_errors,
            stdio_auto_restart: parse_optional_env(
                "TOOLGATE_STDIO_AUTO_RESTART",
                defaults.stdio_auto_restart,
            )?,
            stdio_max_restarts: parse_optional_env(
                "TOOLGATE_STDIO_MAX_RESTARTS",
                defaults.stdio_max_restarts,
            )?,
            stdio_restart_interval: parse_duration_secs(
                "TOOLGATE_STDIO_RESTART_INTERVAL",
                defaults.stdio_restart_interval,
            )?,
        })
    }
}

/// Circuit breaker settings, shared by every per-server breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window over which requests and failures are counted.
    pub window: Duration,
    /// Minimum requests in the window before the breaker may trip.
    pub min_requests: u64,
    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
    /// How long the breaker stays open before probing.
    pub open_timeout: Duration,
    /// Trial requests admitted while half-open.
    pub half_open_max: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            min_requests: 5,
            failure_ratio: 0.6,
            open_timeout: Duration::from_secs(30),
            half_open_max: 3,
        }
    }
}

impl BreakerConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            window: parse_duration_secs("TOOLGATE_BREAKER_WINDOW", defaults.window)?,
            min_requests: parse_optional_env("TOOLGATE_BREAKER_MIN_REQUESTS", defaults.min_requests)?,
            failure_ratio: parse_optional_env(
                "TOOLGATE_BREAKER_FAILURE_RATIO",
                defaults.failure_ratio,
            )?,
            open_timeout: parse_duration_secs("TOOLGATE_BREAKER_OPEN_TIMEOUT", defaults.open_timeout)?,
            half_open_max: parse_optional_env("TOOLGATE_BREAKER_HALF_OPEN_MAX", defaults.half_open_max)?,
        })
    }
}
