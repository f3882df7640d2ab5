//! Error types for every subsystem.
//!
//! Each subsystem gets its own `thiserror` enum so callers can match on the
//! failure class without string inspection. A failed tool execution is *not*
//! an error: executors fold upstream failures into an
//! [`ExecutionResult`](crate::executor::ExecutionResult) with
//! `success = false` so the job worker can persist and broadcast uniformly.

use std::time::Duration;

use thiserror::Error;

/// Errors from the wire-level upstream transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("process exited")]
    ProcessExited,

    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: u64, timeout: Duration },

    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("upstream returned malformed frame: {0}")]
    Parse(String),

    #[error("upstream error {code}: {message}")]
    Rpc { code: i64, message: String },
}

/// Errors from the per-server connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("max connections reached for {server}")]
    MaxConnections { server: String },

    #[error("pool for {server} is closed")]
    Closed { server: String },

    #[error("failed to initialize connection to {server}: {reason}")]
    Initialize { server: String, reason: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Errors from the circuit breaker wrapping upstream calls.
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit breaker open for {server}")]
    Open { server: String },

    #[error("circuit breaker limiting requests for {server}")]
    TooManyRequests { server: String },
}

/// Errors from the execution engine.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("unknown execution mode: {0}")]
    UnknownMode(String),
}

/// Errors from the tool registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("toolkit {0} not found")]
    ToolkitNotFound(uuid::Uuid),

    #[error("tool {0} not found")]
    ToolNotFound(String),

    #[error("invalid qualified tool name '{0}', expected '<toolbox>.<tool>'")]
    InvalidToolName(String),

    #[error("toolkit validation failed: {0}")]
    Invalid(String),
}

/// Errors from durable storage (sled).
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage open failed at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Write(e.to_string())
    }
}

/// Errors from the job queue and manager.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(uuid::Uuid),

    #[error("job must have tool_name, tool_id or query")]
    MissingTarget,

    #[error("cannot cancel job in terminal state")]
    TerminalCancel,

    #[error("invalid transition from {from} status")]
    InvalidTransition { from: String },

    #[error("cannot delete job in non-terminal state")]
    NonTerminalDelete,

    #[error("timed out waiting for job {0}")]
    WaitTimeout(uuid::Uuid),

    #[error("stream write failed: {0}")]
    Stream(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the semantic router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("LLM provider not configured")]
    NoProvider,

    #[error("no tool found for query '{0}'")]
    NoMatch(String),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("[{provider}] request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("[{provider}] authentication failed")]
    AuthFailed { provider: String },

    #[error("[{provider}] invalid response: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

/// Errors from gateway startup and shutdown.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from configuration resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// JSON-RPC 2.0 error codes surfaced by the dispatcher.
pub mod rpc_code {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
}

/// Error carried back through the JSON-RPC dispatcher.
#[derive(Debug, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(rpc_code::INVALID_PARAMS, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(rpc_code::METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(rpc_code::INTERNAL_ERROR, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(rpc_code::SERVER_ERROR, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_error_messages_match_gateway_surface() {
        let open = BreakerError::Open {
            server: "http://u".to_string(),
        };
        assert_eq!(open.to_string(), "circuit breaker open for http://u");

        let limited = BreakerError::TooManyRequests {
            server: "http://u".to_string(),
        };
        assert_eq!(
            limited.to_string(),
            "circuit breaker limiting requests for http://u"
        );
    }

    #[test]
    fn terminal_cancel_message() {
        assert_eq!(
            JobError::TerminalCancel.to_string(),
            "cannot cancel job in terminal state"
        );
    }

    #[test]
    fn pool_error_wraps_transport() {
        let err: PoolError = TransportError::NotConnected.into();
        assert!(matches!(err, PoolError::Transport(_)));
    }
}
