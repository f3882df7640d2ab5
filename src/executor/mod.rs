//! Execution engine: direct upstream calls and sandboxed scripts.
//!
//! A failed execution is a value, not an error: both executors fold every
//! failure (pool exhaustion, breaker rejection, upstream error, timeout)
//! into an [`ExecutionResult`] with `success = false`, so the job worker
//! can persist and broadcast uniformly.

mod direct;
mod script;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use direct::DirectExecutor;
pub use script::ScriptExecutor;

use crate::error::ExecutorError;

/// How a `tools/call` should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Forward the call to the tool's upstream server.
    #[default]
    Direct,
    /// Run a script in the sandbox; tools are injected as callables.
    Script,
}

impl std::str::FromStr for ExecutionMode {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "script" | "code" => Ok(Self::Script),
            other => Err(ExecutorError::UnknownMode(other.to_string())),
        }
    }
}

/// Outcome of one execution, serialized verbatim into the job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall-clock duration in fractional seconds.
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl ExecutionResult {
    pub fn success(result: Value, duration: Duration) -> Self {
        Self {
            success: true,
            result,
            error: None,
            duration: duration.as_secs_f64(),
            tokens_used: None,
            metadata: HashMap::new(),
        }
    }

    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            duration: duration.as_secs_f64(),
            tokens_used: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The two executors, wired once at startup.
///
/// The sandbox holds its own reference to the direct executor (for the
/// injected tool callables); the reference is one-way and set at
/// construction.
pub struct ExecutionEngine {
    direct: Arc<DirectExecutor>,
    script: Arc<ScriptExecutor>,
}

impl ExecutionEngine {
    pub fn new(direct: Arc<DirectExecutor>, script: Arc<ScriptExecutor>) -> Self {
        Self { direct, script }
    }

    pub fn direct(&self) -> &Arc<DirectExecutor> {
        &self.direct
    }

    pub fn script(&self) -> &Arc<ScriptExecutor> {
        &self.script
    }

    pub async fn close(&self) {
        self.direct.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("direct".parse::<ExecutionMode>().unwrap(), ExecutionMode::Direct);
        assert_eq!("code".parse::<ExecutionMode>().unwrap(), ExecutionMode::Script);
        assert!("quantum".parse::<ExecutionMode>().is_err());
    }

    #[test]
    fn result_serialization_carries_spec_fields() {
        let result = ExecutionResult::success(serde_json::json!({"ok": 1}), Duration::from_millis(1500))
            .with_metadata("server", "http://u")
            .with_metadata("mode", "direct");
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["success"], true);
        assert!((encoded["duration"].as_f64().unwrap() - 1.5).abs() < 1e-9);
        assert_eq!(encoded["metadata"]["mode"], "direct");
        assert!(encoded.get("error").is_none());
    }
}
