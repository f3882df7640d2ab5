//! Direct executor: forward a tool call to its upstream server.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::ExecutorConfig;
use crate::tools::Tool;
use crate::upstream::{BreakerManager, PoolManager};

use super::ExecutionResult;

/// Executes `(tool, args)` through the pool and circuit breaker of the
/// tool's `mcp_server`.
pub struct DirectExecutor {
    pools: Arc<PoolManager>,
    breakers: Arc<BreakerManager>,
    config: ExecutorConfig,
}

impl DirectExecutor {
    pub fn new(pools: Arc<PoolManager>, breakers: Arc<BreakerManager>, config: ExecutorConfig) -> Self {
        Self {
            pools,
            breakers,
            config,
        }
    }

    /// Run one `tools/call`. Pool and breaker failures come back as a
    /// failed result, never as an error.
    pub async fn execute(&self, tool: &Tool, args: Value) -> ExecutionResult {
        let start = Instant::now();
        let server = tool.mcp_server.clone();
        let timeout = tool
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.config.timeout);

        let pool = self.pools.get_or_create(&server);
        let breaker = self.breakers.get_or_create(&server);

        let outcome = breaker
            .execute(|| async {
                let mut conn = pool.acquire().await.map_err(|e| e.to_string())?;

                let call = conn.client.call_tool(&tool.name, args);
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(value)) => {
                        conn.record_call();
                        Ok(value)
                    }
                    Ok(Err(e)) => {
                        conn.record_call();
                        conn.record_error();
                        Err(e.to_string())
                    }
                    Err(_) => {
                        conn.record_error();
                        Err(format!("tool call timed out after {timeout:?}"))
                    }
                };
                pool.release(conn).await;
                result
            })
            .await;

        let duration = start.elapsed();
        let result = match outcome {
            Ok(Ok(value)) => ExecutionResult::success(value, duration),
            Ok(Err(reason)) => {
                tracing::debug!(tool = %tool.name, server = %server, error = %reason, "tool call failed");
                ExecutionResult::failure(reason, duration)
            }
            Err(rejected) => {
                tracing::debug!(tool = %tool.name, server = %server, error = %rejected, "breaker rejected call");
                ExecutionResult::failure(rejected.to_string(), duration)
            }
        };

        result
            .with_metadata("server", server)
            .with_metadata("mode", "direct")
    }

    pub async fn close(&self) {
        self.pools.close_all().await;
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }
}
