//! Script sandbox: pooled rhai interpreters with tools injected as
//! callables.
//!
//! Scripts run on blocking worker threads; each injected callable
//! re-enters the direct executor synchronously. Timeouts are enforced by
//! an interrupt flag observed through the interpreter's progress hook.
//! Interpreters are reused across runs and only the interrupt state is
//! cleared between them: scripts must not rely on a clean global scope.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine};
use tokio::sync::{oneshot, Semaphore};

use crate::config::SandboxConfig;
use crate::tools::RegisteredTool;

use super::{DirectExecutor, ExecutionResult};

/// How long a timed-out script is given to observe the interrupt before
/// its worker thread is abandoned.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

/// Sandboxed script executor.
pub struct ScriptExecutor {
    config: SandboxConfig,
    direct: Arc<DirectExecutor>,
    engines: StdMutex<Vec<Engine>>,
    permits: Arc<Semaphore>,
    emergency_count: AtomicU64,
}

impl ScriptExecutor {
    /// Pre-build the interpreter pool. The direct executor reference is
    /// one-way and fixed here; injected callables re-enter it.
    pub fn new(direct: Arc<DirectExecutor>, config: SandboxConfig) -> Self {
        let engines = (0..config.pool_size)
            .map(|_| Self::build_engine(&config))
            .collect();

        Self {
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            engines: StdMutex::new(engines),
            emergency_count: AtomicU64::new(0),
            direct,
            config,
        }
    }

    fn build_engine(config: &SandboxConfig) -> Engine {
        let mut engine = Engine::new();
        // No dynamic code loading inside the sandbox.
        engine.disable_symbol("eval");
        engine.set_max_call_levels(config.max_call_levels);
        engine.on_print(|text| tracing::debug!(target: "toolgate::sandbox", "{text}"));
        engine
    }

    /// Run a script with the given tools in scope.
    pub async fn execute(&self, code: &str, tools: &[RegisteredTool]) -> ExecutionResult {
        let start = Instant::now();

        let (permit, mut engine) = self.acquire_engine().await;
        let interrupt = Arc::new(AtomicBool::new(false));
        {
            let flag = Arc::clone(&interrupt);
            engine.on_progress(move |_| {
                if flag.load(Ordering::Relaxed) {
                    Some("interrupted".into())
                } else {
                    None
                }
            });
        }
        self.inject_globals(&mut engine, tools);

        let (tx, mut rx) = oneshot::channel();
        let source = code.to_string();
        tokio::task::spawn_blocking(move || {
            let outcome = engine.eval::<Dynamic>(&source);
            let _ = tx.send((engine, outcome));
        });

        match tokio::time::timeout(self.config.timeout, &mut rx).await {
            Ok(Ok((engine, outcome))) => {
                interrupt.store(false, Ordering::Relaxed);
                self.release_engine(permit, engine);
                self.fold_outcome(outcome, start)
            }
            Ok(Err(_)) => {
                ExecutionResult::failure("sandbox worker died", start.elapsed())
                    .with_metadata("mode", "script")
            }
            Err(_) => {
                interrupt.store(true, Ordering::Relaxed);
                // Give the interpreter a short grace to observe the
                // interrupt; otherwise abandon the worker with its engine.
                if let Ok(Ok((engine, _))) =
                    tokio::time::timeout(INTERRUPT_GRACE, &mut rx).await
                {
                    interrupt.store(false, Ordering::Relaxed);
                    self.release_engine(permit, engine);
                } else {
                    tracing::warn!("abandoning sandbox worker after timeout");
                    drop(permit);
                }
                ExecutionResult::failure(
                    format!("script timed out after {:?}", self.config.timeout),
                    start.elapsed(),
                )
                .with_metadata("mode", "script")
            }
        }
    }

    /// Register one callable per tool plus the `log` sink.
    fn inject_globals(&self, engine: &mut Engine, tools: &[RegisteredTool]) {
        engine.register_fn("log", |value: Dynamic| {
            tracing::debug!(target: "toolgate::sandbox", "{value}");
        });

        let handle = tokio::runtime::Handle::current();
        for registered in tools {
            let tool = registered.tool.clone();
            let direct = Arc::clone(&self.direct);
            let handle = handle.clone();
            let name = tool.name.clone();

            engine.register_fn(
                name.as_str(),
                move |args: rhai::Map| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
                    let json_args = rhai::serde::from_dynamic::<serde_json::Value>(
                        &Dynamic::from_map(args),
                    )?;
                    let result = handle.block_on(direct.execute(&tool, json_args));
                    if result.success {
                        rhai::serde::to_dynamic(&result.result)
                    } else {
                        Err(format!(
                            "tool '{}' failed: {}",
                            tool.name,
                            result.error.unwrap_or_else(|| "unknown error".to_string())
                        )
                        .into())
                    }
                },
            );
        }
    }

    fn fold_outcome(
        &self,
        outcome: Result<Dynamic, Box<rhai::EvalAltResult>>,
        start: Instant,
    ) -> ExecutionResult {
        let duration = start.elapsed();
        let result = match outcome {
            Ok(value) => match rhai::serde::from_dynamic::<serde_json::Value>(&value) {
                Ok(json) => ExecutionResult::success(json, duration),
                Err(e) => ExecutionResult::failure(
                    format!("script result not serializable: {e}"),
                    duration,
                ),
            },
            Err(e) => ExecutionResult::failure(format!("script error: {e}"), duration),
        };
        result.with_metadata("mode", "script")
    }

    /// Pop a pooled interpreter, waiting up to the configured bound; build
    /// an emergency instance (counted, never returned) on exhaustion.
    async fn acquire_engine(&self) -> (Option<tokio::sync::OwnedSemaphorePermit>, Engine) {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await;

        match permit {
            Ok(Ok(permit)) => {
                let engine = {
                    let mut engines = self.lock_engines();
                    engines.pop()
                };
                // The pool may be short an engine after an abandoned run.
                let engine = engine.unwrap_or_else(|| Self::build_engine(&self.config));
                (Some(permit), engine)
            }
            _ => {
                let count = self.emergency_count.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(count, "sandbox pool exhausted, building emergency interpreter");
                (None, Self::build_engine(&self.config))
            }
        }
    }

    fn release_engine(&self, permit: Option<tokio::sync::OwnedSemaphorePermit>, engine: Engine) {
        // Emergency engines (no permit) are dropped, not pooled.
        if permit.is_some() {
            self.lock_engines().push(engine);
        }
    }

    pub fn emergency_count(&self) -> u64 {
        self.emergency_count.load(Ordering::Relaxed)
    }

    fn lock_engines(&self) -> std::sync::MutexGuard<'_, Vec<Engine>> {
        self.engines.lock().unwrap_or_else(|p| p.into_inner())
    }
}
