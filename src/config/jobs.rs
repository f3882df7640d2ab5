//! Job queue and job manager configuration.

use std::time::Duration;

use crate::config::helpers::{parse_duration_secs, parse_optional_env};
use crate::error::ConfigError;

/// Settings for the durable job queue and its manager.
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Capacity of the buffered submission channel (and the events channel).
    pub queue_size: usize,
    /// Number of worker tasks.
    pub num_workers: usize,
    /// Wall-clock bound for a single job execution.
    pub job_timeout: Duration,
    /// Period of the storage cleanup ticker.
    pub cleanup_interval: Duration,
    /// Terminal jobs older than this are dropped by cleanup.
    pub max_job_age: Duration,
    /// When set, a completed job is deleted after its first successful
    /// `get_job` ("delivery is consumption").
    pub auto_delete_completed: bool,
    /// When set, failed jobs are retained regardless of auto-delete.
    pub keep_failed_jobs: bool,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue_size: 1000,
            num_workers: 10,
            job_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(300),
            max_job_age: Duration::from_secs(24 * 3600),
            auto_delete_completed: false,
            keep_failed_jobs: false,
        }
    }
}

impl JobsConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            queue_size: parse_optional_env("TOOLGATE_QUEUE_SIZE", defaults.queue_size)?,
            num_workers: parse_optional_env("TOOLGATE_NUM_WORKERS", defaults.num_workers)?,
            job_timeout: parse_duration_secs("TOOLGATE_JOB_TIMEOUT", defaults.job_timeout)?,
            cleanup_interval: parse_duration_secs(
                "TOOLGATE_CLEANUP_INTERVAL",
                defaults.cleanup_interval,
            )?,
            max_job_age: parse_duration_secs("TOOLGATE_MAX_JOB_AGE", defaults.max_job_age)?,
            auto_delete_completed: parse_optional_env(
                "TOOLGATE_AUTO_DELETE_COMPLETED",
                defaults.auto_delete_completed,
            )?,
            keep_failed_jobs: parse_optional_env(
                "TOOLGATE_KEEP_FAILED_JOBS",
                defaults.keep_failed_jobs,
            )?,
        })
    }
}
