//! Worker-pool-backed job queue.
//!
//! Submission persists first, then feeds a bounded channel; on overflow the
//! job simply stays pending in storage and is picked up by hydration at the
//! next start. Per-job events flow through one events channel and are
//! fanned out by the broadcaster to per-job subscriber lists. Subscribers
//! are dropped-on-full for intermediate events; terminal events are
//! delivered with a grace period, after which the subscriber list is freed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::JobsConfig;
use crate::error::JobError;
use crate::executor::{DirectExecutor, ExecutionResult};
use crate::router::{Intent, SemanticRouter};
use crate::tools::{RegisteredTool, SearchIndexer, ToolRegistry};

use super::model::{Job, JobEvent, JobStatus};
use super::storage::{JobCounts, JobStorage};

/// Per-subscriber queue depth; intermediate events are dropped when full.
const SUBSCRIBER_CAPACITY: usize = 10;
/// Grace granted to terminal-event delivery before a job's subscriber
/// list is freed.
const TERMINAL_GRACE: Duration = Duration::from_secs(5);
/// How long `stop` waits for workers to drain.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub active_workers: usize,
    pub counts: JobCounts,
}

/// Durable job queue with a worker pool and event pub/sub.
pub struct JobQueue {
    storage: Arc<JobStorage>,
    registry: Arc<ToolRegistry>,
    direct: Arc<DirectExecutor>,
    router: Option<Arc<SemanticRouter>>,
    indexer: Option<Arc<dyn SearchIndexer>>,
    config: JobsConfig,
    submit_tx: mpsc::Sender<Job>,
    submit_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    events_tx: mpsc::Sender<JobEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<JobEvent>>>,
    subscribers: Arc<RwLock<HashMap<Uuid, Vec<mpsc::Sender<JobEvent>>>>>,
    running: AtomicBool,
    active_workers: Arc<AtomicUsize>,
    queue_depth: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(
        storage: Arc<JobStorage>,
        registry: Arc<ToolRegistry>,
        direct: Arc<DirectExecutor>,
        router: Option<Arc<SemanticRouter>>,
        indexer: Option<Arc<dyn SearchIndexer>>,
        config: JobsConfig,
    ) -> Arc<Self> {
        let (submit_tx, submit_rx) = mpsc::channel(config.queue_size.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            storage,
            registry,
            direct,
            router,
            indexer,
            config,
            submit_tx,
            submit_rx: Arc::new(Mutex::new(submit_rx)),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            active_workers: Arc::new(AtomicUsize::new(0)),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            handles: StdMutex::new(Vec::new()),
        })
    }

    /// Spawn workers, the broadcaster and the cleanup ticker, then hydrate
    /// pending jobs from storage.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handles = Vec::new();

        if let Some(events_rx) = self.take_events_rx() {
            let queue = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                queue.broadcaster(events_rx, shutdown_rx).await;
            }));
        }

        for worker_id in 0..self.config.num_workers {
            let queue = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, shutdown_rx).await;
            }));
        }

        {
            let queue = Arc::clone(self);
            let shutdown_rx = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                queue.cleanup_loop(shutdown_rx).await;
            }));
        }

        {
            let queue = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                queue.hydrate();
            }));
        }

        self.lock_handles().extend(handles);
        tracing::info!(workers = self.config.num_workers, "job queue started");
    }

    fn take_events_rx(&self) -> Option<mpsc::Receiver<JobEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Persist, announce, and enqueue a job. A full channel is not an
    /// error: the job stays pending in storage for the next hydration.
    pub fn submit(&self, job: &Job) -> Result<(), JobError> {
        self.storage.save(job)?;
        self.emit(JobEvent::created(job));

        match self.submit_tx.try_send(job.clone()) {
            Ok(()) => {
                self.queue_depth.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(job_id = %job.id, "queue full, job left pending in storage");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::warn!(job_id = %job.id, "submission channel closed");
            }
        }
        Ok(())
    }

    /// Subscribe to a job's events.
    pub async fn subscribe(&self, job_id: Uuid) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        self.subscribers
            .write()
            .await
            .entry(job_id)
            .or_default()
            .push(tx);
        rx
    }

    /// Cancel a job. Terminal jobs reject; running jobs are cancelled
    /// cooperatively (the worker re-checks before recording its result).
    pub fn cancel(&self, job_id: Uuid) -> Result<Job, JobError> {
        let mut job = self
            .storage
            .get(job_id)?
            .ok_or(JobError::NotFound(job_id))?;
        job.mark_cancelled()?;
        self.storage.save(&job)?;
        self.emit(JobEvent::cancelled(&job));
        Ok(job)
    }

    pub fn stats(&self) -> Result<QueueStats, JobError> {
        Ok(QueueStats {
            queued: self.queue_depth.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            counts: self.storage.counts()?,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the queue and wait up to 30 s for the workers to drain.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.lock_handles());
        let drain = futures::future::join_all(handles);
        if tokio::time::timeout(STOP_TIMEOUT, drain).await.is_err() {
            tracing::warn!(timeout = ?STOP_TIMEOUT, "workers did not drain before stop timeout");
        }
        tracing::info!("job queue stopped");
    }

    fn emit(&self, event: JobEvent) {
        if self.events_tx.try_send(event).is_err() {
            tracing::warn!("events channel full, dropping event");
        }
    }

    /// Load pending jobs in FIFO creation order until the channel is
    /// saturated or the page runs out.
    fn hydrate(&self) {
        let pending = match self.storage.get_pending(self.config.queue_size) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "pending hydration failed");
                return;
            }
        };

        let mut queued = 0;
        for job in pending {
            match self.submit_tx.try_send(job) {
                Ok(()) => {
                    self.queue_depth.fetch_add(1, Ordering::Relaxed);
                    queued += 1;
                }
                Err(_) => break,
            }
        }
        if queued > 0 {
            tracing::info!(count = queued, "hydrated pending jobs from storage");
        }
    }

    async fn worker_loop(&self, worker_id: usize, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let job = tokio::select! {
                _ = shutdown_rx.changed() => break,
                job = async { self.submit_rx.lock().await.recv().await } => job,
            };
            let Some(job) = job else { break };

            self.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.active_workers.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = self.process(job).await {
                tracing::error!(worker_id, error = %e, "job processing failed");
            }
            self.active_workers.fetch_sub(1, Ordering::Relaxed);
        }
        tracing::debug!(worker_id, "worker exiting");
    }

    async fn process(&self, submitted: Job) -> Result<(), JobError> {
        // Re-read the latest record: the job may have been cancelled while
        // queued.
        let Some(mut job) = self.storage.get(submitted.id)? else {
            return Ok(());
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = %job.id, status = %job.status, "skipping non-pending job");
            return Ok(());
        }

        job.mark_running()?;
        self.storage.save(&job)?;
        self.emit(JobEvent::started(&job));

        let Some(resolved) = self.resolve_tool(&mut job).await else {
            let target = job
                .query
                .clone()
                .or_else(|| job.tool_name.clone())
                .unwrap_or_default();
            job.mark_failed(format!("no tool found for query '{target}'"));
            self.storage.save(&job)?;
            self.emit(JobEvent::failed(&job));
            return Ok(());
        };

        let result = match tokio::time::timeout(
            self.config.job_timeout,
            self.direct.execute(&resolved.tool, job.args.clone()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => ExecutionResult::failure(
                format!("job timed out after {:?}", self.config.job_timeout),
                self.config.job_timeout,
            ),
        };

        // Cooperative cancellation: a cancel recorded while we were
        // executing wins; the result is discarded.
        if let Some(latest) = self.storage.get(job.id)?
            && latest.status == JobStatus::Cancelled
        {
            tracing::debug!(job_id = %job.id, "job cancelled during execution, discarding result");
            return Ok(());
        }

        if result.success {
            job.mark_completed(result);
            self.storage.save(&job)?;
            self.emit(JobEvent::completed(&job));
        } else {
            let reason = result
                .error
                .clone()
                .unwrap_or_else(|| "execution failed".to_string());
            job.result = Some(result);
            job.mark_failed(reason);
            self.storage.save(&job)?;
            self.emit(JobEvent::failed(&job));
        }
        Ok(())
    }

    /// Resolve the tool for a job, in order: by id, by qualified name, and
    /// finally from the natural-language query (router intent → indexer →
    /// registry search on "<action> <entity>" → keyword scan). The
    /// resolved identity is written back onto the job.
    async fn resolve_tool(&self, job: &mut Job) -> Option<RegisteredTool> {
        if let Some(id) = job.tool_id
            && let Ok(tool) = self.registry.get_tool(id)
        {
            return Some(tool);
        }

        if let Some(name) = job.tool_name.clone()
            && let Ok(tool) = self.registry.get_tool_by_name(&name)
        {
            job.tool_id = Some(tool.tool.id);
            return Some(tool);
        }

        let query = job.query.clone()?;

        let intent = match &self.router {
            Some(router) => match router.parse_intent(&query).await {
                Ok(intent) => Some(intent),
                Err(e) => {
                    tracing::debug!(error = %e, "intent parse failed, falling back to search");
                    None
                }
            },
            None => None,
        };

        let tool = self.find_tool_for_query(&query, intent.as_ref()).await?;
        job.tool_name = Some(tool.qualified_name.clone());
        job.tool_id = Some(tool.tool.id);

        // Arguments the caller did not supply are recovered from the
        // query: intent filters first, LLM-extracted parameters on top.
        let extracted = match &self.router {
            Some(router) => {
                router
                    .extract_parameters(&query, &tool.tool.input_schema)
                    .await
            }
            None => HashMap::new(),
        };
        enrich_args(job, intent.as_ref(), extracted);

        Some(tool)
    }

    /// Query → tool, in order: indexer (limit 1), registry search on
    /// "<action> <entity>", keyword hit on any tool.
    async fn find_tool_for_query(
        &self,
        query: &str,
        intent: Option<&Intent>,
    ) -> Option<RegisteredTool> {
        if let Some(indexer) = &self.indexer
            && let Ok(hits) = indexer.search(query, 1).await
            && let Some(hit) = hits.first()
            && let Ok(tool) = self.registry.get_tool(hit.tool_id)
        {
            return Some(tool);
        }

        if let Some(intent) = intent {
            let needle = format!("{} {}", intent.action, intent.entity);
            if let Some(tool) = self.registry.search(&needle, &[]).into_iter().next() {
                return Some(tool);
            }
        }

        // Last resort: keyword hit on any tool's name or description.
        let lowered = query.to_lowercase();
        self.registry.list_all_tools().into_iter().find(|tool| {
            lowered.split_whitespace().any(|word| {
                tool.tool.name.to_lowercase().contains(word)
                    || tool.toolbox.to_lowercase().contains(word)
                    || tool.tool.description.to_lowercase().contains(word)
            })
        })
    }

    /// Fan events out to the subscribers of their job id.
    async fn broadcaster(
        &self,
        mut events_rx: mpsc::Receiver<JobEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown_rx.changed() => break,
                event = events_rx.recv() => event,
            };
            let Some(event) = event else { break };

            let subs = {
                let map = self.subscribers.read().await;
                map.get(&event.job_id).cloned().unwrap_or_default()
            };

            if event.is_terminal() {
                // Terminal delivery is retried within the grace window,
                // then the subscriber list is freed so late readers can
                // still observe the end of stream until it expires.
                let subscribers = Arc::clone(&self.subscribers);
                let job_id = event.job_id;
                tokio::spawn(async move {
                    for sub in subs {
                        let _ = tokio::time::timeout(TERMINAL_GRACE, sub.send(event.clone())).await;
                    }
                    tokio::time::sleep(TERMINAL_GRACE).await;
                    subscribers.write().await.remove(&job_id);
                });
            } else {
                for sub in subs {
                    // Drop for this subscriber only.
                    let _ = sub.try_send(event.clone());
                }
            }
        }
    }

    async fn cleanup_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = ticker.tick() => {
                    match self.storage.cleanup(self.config.max_job_age) {
                        Ok(0) => {}
                        Ok(deleted) => tracing::info!(deleted, "cleaned up expired jobs"),
                        Err(e) => tracing::warn!(error = %e, "job cleanup failed"),
                    }
                }
            }
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.handles.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Merge query-derived arguments under the caller's explicit ones:
/// explicit args win, extracted parameters beat plain intent filters.
fn enrich_args(
    job: &mut Job,
    intent: Option<&Intent>,
    extracted: HashMap<String, serde_json::Value>,
) {
    let mut merged = serde_json::Map::new();
    if let Some(intent) = intent {
        for (key, value) in &intent.filters {
            merged.insert(key.clone(), serde_json::Value::String(value.clone()));
        }
    }
    for (key, value) in extracted {
        merged.insert(key, value);
    }
    if let serde_json::Value::Object(explicit) = &job.args {
        for (key, value) in explicit {
            merged.insert(key.clone(), value.clone());
        }
    }
    if !merged.is_empty() {
        job.args = serde_json::Value::Object(merged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent_with_city() -> Intent {
        Intent {
            action: "get".to_string(),
            domain: "weather".to_string(),
            entity: "current".to_string(),
            filters: HashMap::from([("city".to_string(), "Berlin".to_string())]),
            confidence: 0.9,
            raw_query: "weather in Berlin".to_string(),
        }
    }

    #[test]
    fn enrich_fills_gaps_but_keeps_explicit_args() {
        let mut job = Job::new(
            None,
            None,
            serde_json::json!({ "city": "Moscow" }),
            Some("weather in Berlin".to_string()),
        );
        let extracted = HashMap::from([(
            "units".to_string(),
            serde_json::Value::String("metric".to_string()),
        )]);

        enrich_args(&mut job, Some(&intent_with_city()), extracted);

        // Explicit city survives; units and nothing else were added.
        assert_eq!(job.args["city"], "Moscow");
        assert_eq!(job.args["units"], "metric");
    }

    #[test]
    fn enrich_with_no_sources_leaves_args_alone() {
        let mut job = Job::new(None, None, serde_json::Value::Null, Some("q".to_string()));
        enrich_args(&mut job, None, HashMap::new());
        assert!(job.args.is_null());
    }
}
