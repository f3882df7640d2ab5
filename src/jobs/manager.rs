//! Public job API: a thin façade over the queue and storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::JobError;

use super::model::{Job, JobEvent, JobStatus};
use super::queue::{JobQueue, QueueStats};
use super::storage::{JobFilter, JobStorage};

/// Interval between keep-alive pings on a job stream.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// A job creation request.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct JobRequest {
    pub tool_name: Option<String>,
    pub tool_id: Option<Uuid>,
    #[serde(default)]
    pub args: Value,
    pub query: Option<String>,
    /// Time-to-live in seconds.
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// Job manager: create, inspect, wait on, stream and cancel jobs.
pub struct JobManager {
    storage: Arc<JobStorage>,
    queue: Arc<JobQueue>,
    config: JobsConfig,
}

impl JobManager {
    pub fn new(storage: Arc<JobStorage>, queue: Arc<JobQueue>, config: JobsConfig) -> Self {
        Self {
            storage,
            queue,
            config,
        }
    }

    /// Validate and submit a new job.
    pub fn create_job(&self, request: JobRequest) -> Result<Job, JobError> {
        let has_target = request.tool_name.as_deref().is_some_and(|s| !s.is_empty())
            || request.tool_id.is_some()
            || request.query.as_deref().is_some_and(|s| !s.is_empty());
        if !has_target {
            return Err(JobError::MissingTarget);
        }

        let mut job = Job::new(
            request.tool_name.filter(|s| !s.is_empty()),
            request.tool_id,
            request.args,
            request.query.filter(|s| !s.is_empty()),
        );
        job.ttl = request.ttl;
        job.metadata = request.metadata;

        self.queue.submit(&job)?;
        tracing::info!(job_id = %job.id, "job created");
        Ok(job)
    }

    /// Fetch a job.
    ///
    /// With `auto_delete_completed`, delivery is consumption: a completed
    /// job is deleted in the background after this read returns it. Failed
    /// jobs are exempt while `keep_failed_jobs` is set.
    pub fn get_job(&self, id: Uuid) -> Result<Job, JobError> {
        let job = self.storage.get(id)?.ok_or(JobError::NotFound(id))?;

        if self.config.auto_delete_completed {
            let consumed = match job.status {
                JobStatus::Completed => true,
                JobStatus::Failed => !self.config.keep_failed_jobs,
                _ => false,
            };
            if consumed {
                let storage = Arc::clone(&self.storage);
                tokio::spawn(async move {
                    if let Err(e) = storage.delete(id) {
                        tracing::warn!(job_id = %id, error = %e, "auto-delete failed");
                    }
                });
            }
        }

        Ok(job)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.storage.list(filter)?)
    }

    /// Delete a terminal job.
    pub fn delete(&self, id: Uuid) -> Result<(), JobError> {
        let job = self.storage.get(id)?.ok_or(JobError::NotFound(id))?;
        if !job.is_terminal() {
            return Err(JobError::NonTerminalDelete);
        }
        self.storage.delete(id)?;
        Ok(())
    }

    pub fn cancel(&self, id: Uuid) -> Result<Job, JobError> {
        self.queue.cancel(id)
    }

    pub async fn subscribe(&self, id: Uuid) -> tokio::sync::mpsc::Receiver<JobEvent> {
        self.queue.subscribe(id).await
    }

    /// Subscription as a `Stream`, for surfaces that adapt events into
    /// their own framing.
    pub async fn subscribe_stream(
        &self,
        id: Uuid,
    ) -> tokio_stream::wrappers::ReceiverStream<JobEvent> {
        tokio_stream::wrappers::ReceiverStream::new(self.queue.subscribe(id).await)
    }

    pub fn get_stats(&self) -> Result<QueueStats, JobError> {
        self.queue.stats()
    }

    pub fn cleanup(&self) -> Result<usize, JobError> {
        Ok(self.storage.cleanup(self.config.max_job_age)?)
    }

    /// Block until the job reaches a terminal state or the timeout lapses.
    pub async fn wait_for_job(&self, id: Uuid, timeout: Duration) -> Result<Job, JobError> {
        // Subscribe before the status check so the terminal event cannot
        // slip between the two.
        let mut events = self.queue.subscribe(id).await;

        let job = self.storage.get(id)?.ok_or(JobError::NotFound(id))?;
        if job.is_terminal() {
            return Ok(job);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Err(JobError::WaitTimeout(id)),
                event = events.recv() => event,
            };
            match event {
                Some(event) if event.is_terminal() => {
                    return self.storage.get(id)?.ok_or(JobError::NotFound(id));
                }
                Some(_) => continue,
                None => {
                    // Channel closed after the terminal grace; re-read.
                    return self.storage.get(id)?.ok_or(JobError::NotFound(id));
                }
            }
        }
    }

    /// Stream a job's events as SSE-style frames
    /// (`event: <type>\ndata: <json>\n\n`), starting with a synthetic
    /// event for the current status and pinging every 30 s.
    pub async fn stream_job<W>(&self, id: Uuid, writer: &mut W) -> Result<(), JobError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut events = self.queue.subscribe(id).await;

        let job = self.storage.get(id)?.ok_or(JobError::NotFound(id))?;
        let snapshot = JobEvent::snapshot(&job);
        let terminal = snapshot.is_terminal();
        write_frame(writer, &snapshot).await?;
        if terminal {
            return Ok(());
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = ping.tick() => {
                    write_ping(writer).await?;
                }
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            let terminal = event.is_terminal();
                            write_frame(writer, &event).await?;
                            if terminal {
                                return Ok(());
                            }
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}

async fn write_frame<W>(writer: &mut W, event: &JobEvent) -> Result<(), JobError>
where
    W: AsyncWrite + Unpin + Send,
{
    let data =
        serde_json::to_string(event).map_err(|e| JobError::Stream(e.to_string()))?;
    let frame = format!("event: {}\ndata: {data}\n\n", event.event_type);
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| JobError::Stream(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| JobError::Stream(e.to_string()))?;
    Ok(())
}

async fn write_ping<W>(writer: &mut W) -> Result<(), JobError>
where
    W: AsyncWrite + Unpin + Send,
{
    writer
        .write_all(b"event: ping\ndata: {}\n\n")
        .await
        .map_err(|e| JobError::Stream(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| JobError::Stream(e.to_string()))?;
    Ok(())
}
