//! Job records and job events.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::JobError;
use crate::executor::ExecutionResult;

/// Lifecycle of a job.
///
/// ```text
/// pending ──▶ running ──▶ completed | failed | cancelled
///    └───────────────────▶ cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A durable execution task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Qualified `<toolbox>.<tool>` name; populated by the worker when the
    /// job was submitted with only a query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_id: Option<Uuid>,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 0..=100.
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_message: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Time-to-live in seconds from creation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Job {
    pub fn new(
        tool_name: Option<String>,
        tool_id: Option<Uuid>,
        args: Value,
        query: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool_name,
            tool_id,
            args,
            query,
            status: JobStatus::Pending,
            result: None,
            error: None,
            progress: 0,
            progress_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            ttl: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// pending → running. Stamps `started_at`.
    pub fn mark_running(&mut self) -> Result<(), JobError> {
        if self.status != JobStatus::Pending {
            return Err(JobError::InvalidTransition {
                from: self.status.to_string(),
            });
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// running → completed. Progress is forced to 100.
    pub fn mark_completed(&mut self, result: ExecutionResult) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// → failed, from any non-terminal state.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// pending|running → cancelled; terminal states reject.
    pub fn mark_cancelled(&mut self) -> Result<(), JobError> {
        if self.is_terminal() {
            return Err(JobError::TerminalCancel);
        }
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Whether the TTL (counted from creation) has lapsed.
    pub fn ttl_expired(&self, now: DateTime<Utc>) -> bool {
        match self.ttl {
            Some(secs) => {
                now.signed_duration_since(self.created_at)
                    >= chrono::Duration::from_std(Duration::from_secs(secs))
                        .unwrap_or(chrono::Duration::MAX)
            }
            None => false,
        }
    }
}

/// Event kinds mirrored from job transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobEventType {
    Created,
    Started,
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl JobEventType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One broadcast event for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub job_id: Uuid,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    fn base(event_type: JobEventType, job: &Job) -> Self {
        Self {
            event_type,
            job_id: job.id,
            status: job.status,
            progress: None,
            message: None,
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn created(job: &Job) -> Self {
        Self::base(JobEventType::Created, job)
    }

    pub fn started(job: &Job) -> Self {
        Self::base(JobEventType::Started, job)
    }

    pub fn progress(job: &Job) -> Self {
        let mut event = Self::base(JobEventType::Progress, job);
        event.progress = Some(job.progress);
        event.message = job.progress_message.clone();
        event
    }

    pub fn completed(job: &Job) -> Self {
        let mut event = Self::base(JobEventType::Completed, job);
        event.progress = Some(100);
        event.result = job.result.clone();
        event
    }

    pub fn failed(job: &Job) -> Self {
        let mut event = Self::base(JobEventType::Failed, job);
        event.error = job.error.clone();
        event
    }

    pub fn cancelled(job: &Job) -> Self {
        Self::base(JobEventType::Cancelled, job)
    }

    /// The synthetic event reflecting a job's current status, used to open
    /// a stream.
    pub fn snapshot(job: &Job) -> Self {
        match job.status {
            JobStatus::Pending => Self::created(job),
            JobStatus::Running => Self::started(job),
            JobStatus::Completed => Self::completed(job),
            JobStatus::Failed => Self::failed(job),
            JobStatus::Cancelled => Self::cancelled(job),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_transitions() {
        let mut job = Job::new(Some("weather.get_current".to_string()), None, Value::Null, None);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        job.mark_running().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        // running → running is rejected
        assert!(job.mark_running().is_err());

        job.mark_completed(ExecutionResult::success(Value::Null, Duration::from_secs(1)));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert!(job.completed_at.is_some());

        // terminal jobs cannot be cancelled
        let err = job.mark_cancelled().unwrap_err();
        assert_eq!(err.to_string(), "cannot cancel job in terminal state");
    }

    #[test]
    fn pending_jobs_can_be_cancelled() {
        let mut job = Job::new(None, None, Value::Null, Some("weather in Berlin".to_string()));
        job.mark_cancelled().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn ttl_expiry() {
        let mut job = Job::new(Some("a.b".to_string()), None, Value::Null, None);
        job.ttl = Some(60);
        assert!(!job.ttl_expired(Utc::now()));
        assert!(job.ttl_expired(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn snapshot_event_mirrors_status() {
        let mut job = Job::new(Some("a.b".to_string()), None, Value::Null, None);
        assert_eq!(JobEvent::snapshot(&job).event_type, JobEventType::Created);
        job.mark_running().unwrap();
        assert_eq!(JobEvent::snapshot(&job).event_type, JobEventType::Started);
        job.mark_failed("boom");
        let event = JobEvent::snapshot(&job);
        assert_eq!(event.event_type, JobEventType::Failed);
        assert_eq!(event.error.as_deref(), Some("boom"));
        assert!(event.is_terminal());
    }

    #[test]
    fn status_roundtrip() {
        for status in ["pending", "running", "completed", "failed", "cancelled"] {
            let parsed: JobStatus = status.parse().unwrap();
            assert_eq!(parsed.as_str(), status);
        }
        assert!("limbo".parse::<JobStatus>().is_err());
    }
}
