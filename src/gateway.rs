//! Startup wiring: construct every component in dependency order.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{GatewayError, StorageError};
use crate::executor::{DirectExecutor, ExecutionEngine, ScriptExecutor};
use crate::jobs::{JobManager, JobQueue, JobStorage};
use crate::router::{build_provider, SemanticRouter};
use crate::rpc::Dispatcher;
use crate::tools::{InMemoryIndexer, SearchIndexer, SledRegistryStore, ToolRegistry};
use crate::upstream::{BreakerManager, PoolManager};

/// Point-in-time view across all subsystems.
#[derive(Debug, serde::Serialize)]
pub struct GatewayStats {
    pub registry: crate::tools::RegistryTotals,
    pub pools: Vec<crate::upstream::PoolStats>,
    /// Server → breaker state ("closed", "open", "half-open").
    pub breakers: Vec<(String, String)>,
    pub jobs: crate::jobs::QueueStats,
}

/// The assembled core: registry, executors, job subsystem, router and the
/// dispatcher any gateway surface talks to.
pub struct Gateway {
    db: sled::Db,
    pub registry: Arc<ToolRegistry>,
    pub engine: Arc<ExecutionEngine>,
    pub router: Arc<SemanticRouter>,
    pub jobs: Arc<JobManager>,
    pub dispatcher: Arc<Dispatcher>,
    queue: Arc<JobQueue>,
}

impl Gateway {
    /// Build and start the core from configuration.
    pub async fn start(config: Config) -> Result<Self, GatewayError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| StorageError::Open {
            path: config.data_dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let db_path = config.data_dir.join("toolgate.db");
        let db = sled::open(&db_path).map_err(|e| StorageError::Open {
            path: db_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let indexer: Arc<dyn SearchIndexer> = Arc::new(InMemoryIndexer::new());
        let registry = Arc::new(ToolRegistry::new(
            Some(Arc::new(SledRegistryStore::new(&db)?)),
            Some(Arc::clone(&indexer)),
        ));
        registry.load_from_storage().await?;

        let pools = Arc::new(PoolManager::new(config.pool.clone()));
        let breakers = Arc::new(BreakerManager::new(config.breaker.clone()));
        let direct = Arc::new(DirectExecutor::new(pools, breakers, config.executor.clone()));
        let script = Arc::new(ScriptExecutor::new(
            Arc::clone(&direct),
            config.sandbox.clone(),
        ));
        let engine = Arc::new(ExecutionEngine::new(Arc::clone(&direct), script));

        let provider = build_provider(&config.router)?;
        let router = Arc::new(SemanticRouter::new(
            Arc::clone(&registry),
            provider,
            config.router.cache_capacity,
        ));

        let job_storage = Arc::new(JobStorage::new(&db)?);
        let queue = JobQueue::new(
            Arc::clone(&job_storage),
            Arc::clone(&registry),
            Arc::clone(&direct),
            Some(Arc::clone(&router)),
            Some(Arc::clone(&indexer)),
            config.jobs.clone(),
        );
        queue.start();
        let jobs = Arc::new(JobManager::new(
            job_storage,
            Arc::clone(&queue),
            config.jobs.clone(),
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&engine),
            Some(Arc::clone(&router)),
            Arc::clone(&jobs),
        ));

        tracing::info!(data_dir = %config.data_dir.display(), "gateway core started");
        Ok(Self {
            db,
            registry,
            engine,
            router,
            jobs,
            dispatcher,
            queue,
        })
    }

    /// Aggregate statistics across the registry, pools, breakers and the
    /// job queue.
    pub fn stats(&self) -> Result<GatewayStats, crate::error::JobError> {
        Ok(GatewayStats {
            registry: self.registry.totals(),
            pools: self.engine.direct().pools().stats(),
            breakers: self
                .engine
                .direct()
                .breakers()
                .states()
                .into_iter()
                .map(|(server, state)| (server, state.to_string()))
                .collect(),
            jobs: self.jobs.get_stats()?,
        })
    }

    /// Stop workers, close upstream pools, flush storage.
    pub async fn shutdown(&self) {
        self.queue.stop().await;
        self.engine.close().await;
        if let Err(e) = self.db.flush_async().await {
            tracing::warn!(error = %e, "storage flush failed during shutdown");
        }
        tracing::info!("gateway core stopped");
    }
}
