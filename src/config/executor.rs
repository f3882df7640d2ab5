//! Execution engine configuration.

use std::time::Duration;

use crate::config::helpers::{parse_duration_secs, parse_optional_env};
use crate::error::ConfigError;

/// Direct executor settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Wall-clock bound for a single upstream `tools/call`.
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            timeout: parse_duration_secs("TOOLGATE_EXECUTOR_TIMEOUT", Self::default().timeout)?,
        })
    }
}

/// Script sandbox settings.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Number of pre-built interpreters kept in the pool.
    pub pool_size: usize,
    /// How long to wait for a pooled interpreter before building an
    /// emergency instance outside the pool.
    pub acquire_timeout: Duration,
    /// Wall-clock bound for a single script run, enforced by interrupt.
    pub timeout: Duration,
    /// Call-stack depth cap inside the interpreter.
    pub max_call_levels: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            acquire_timeout: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
            max_call_levels: 1000,
        }
    }
}

impl SandboxConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            pool_size: parse_optional_env("TOOLGATE_SANDBOX_POOL_SIZE", defaults.pool_size)?,
            acquire_timeout: defaults.acquire_timeout,
            timeout: parse_duration_secs("TOOLGATE_SANDBOX_TIMEOUT", defaults.timeout)?,
            max_call_levels: defaults.max_call_levels,
        })
    }
}
