//! Subprocess transport: line-delimited JSON-RPC over a child's stdio.
//!
//! One child process per transport. All sends are serialized through a
//! single writer; a dedicated reader task parses stdout line by line and
//! completes pending requests by id. Stderr is drained to the debug log.
//! When the child exits unexpectedly and `auto_restart` is set, the
//! transport respawns it up to `max_restarts` times.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::protocol::{normalize_id, JsonRpcRequest, JsonRpcResponse};

/// How long `close` waits for the reader loop to drain after stdin closes.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Configuration for a subprocess upstream.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub auto_restart: bool,
    pub max_restarts: u32,
    pub restart_interval: Duration,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            auto_restart: false,
            max_restarts: 3,
            restart_interval: Duration::from_secs(1),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_auto_restart(mut self, max_restarts: u32, interval: Duration) -> Self {
        self.auto_restart = true;
        self.max_restarts = max_restarts;
        self.restart_interval = interval;
        self
    }
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, TransportError>>>;

struct Inner {
    config: StdioConfig,
    /// Single writer: every outgoing frame goes through this lock.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pending: StdMutex<PendingMap>,
    connected: AtomicBool,
    closed: AtomicBool,
    restart_count: AtomicU32,
}

/// Removes the pending entry if the send future is dropped before the
/// response arrives (caller timeout or cancellation).
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Ok(mut pending) = self.inner.pending.lock()
        {
            pending.remove(&self.id);
        }
    }
}

/// Subprocess transport over stdio.
pub struct StdioTransport {
    inner: Arc<Inner>,
}

impl StdioTransport {
    /// Spawn the child and start the reader loop.
    pub async fn connect(config: StdioConfig) -> Result<Self, TransportError> {
        let inner = Arc::new(Inner {
            config,
            stdin: Mutex::new(None),
            child: Mutex::new(None),
            reader: Mutex::new(None),
            pending: StdMutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            restart_count: AtomicU32::new(0),
        });

        Inner::spawn_process(Arc::clone(&inner)).await?;
        Ok(Self { inner })
    }

    /// Send a request and wait for the response with the same id.
    pub async fn send(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let id = req
            .id
            .as_ref()
            .and_then(normalize_id)
            .ok_or_else(|| TransportError::Parse("request without integer id".to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self
                .inner
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.insert(id, tx);
        }
        let mut guard = PendingGuard {
            inner: self.inner.as_ref(),
            id,
            armed: true,
        };

        // On write failure the guard removes the pending entry.
        self.write_frame(req).await?;

        let result = rx.await;
        guard.armed = false;

        match result {
            Ok(outcome) => outcome,
            // Sender dropped without a reply: the transport was torn down.
            Err(_) => Err(TransportError::Closed),
        }
    }

    /// Send a notification; nothing is awaited.
    pub async fn notify(&self, req: &JsonRpcRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.write_frame(req).await
    }

    async fn write_frame(&self, req: &JsonRpcRequest) -> Result<(), TransportError> {
        let mut line =
            serde_json::to_vec(req).map_err(|e| TransportError::Parse(e.to_string()))?;
        line.push(b'\n');

        let mut stdin = self.inner.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(if self.inner.closed.load(Ordering::SeqCst) {
                TransportError::Closed
            } else {
                TransportError::ProcessExited
            });
        };

        writer
            .write_all(&line)
            .await
            .map_err(|_| TransportError::ProcessExited)?;
        writer
            .flush()
            .await
            .map_err(|_| TransportError::ProcessExited)?;
        Ok(())
    }

    /// Close stdin, drain the reader with a grace period, kill the child
    /// if it is still alive, and fail every pending request. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);

        // Dropping stdin signals cooperative shutdown (EOF on the child's stdin).
        self.inner.stdin.lock().await.take();

        let handle = self.inner.reader.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, handle).await.is_err() {
                tracing::warn!(
                    command = %self.inner.config.command,
                    "reader loop did not drain within grace period"
                );
            }
        }

        if let Some(mut child) = self.inner.child.lock().await.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }

        self.inner.fail_pending(|| TransportError::Closed);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Respawn the child after an explicit `close` (or a dead process).
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        if self.is_connected() {
            return Ok(());
        }
        Inner::spawn_process(Arc::clone(&self.inner)).await
    }

    /// How many automatic restarts have happened so far.
    pub fn restart_count(&self) -> u32 {
        self.inner.restart_count.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn spawn_process(
        inner: Arc<Inner>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), TransportError>> + Send>>
    {
        Box::pin(Inner::spawn_process_inner(inner))
    }

    async fn spawn_process_inner(inner: Arc<Inner>) -> Result<(), TransportError> {
        let config = &inner.config;
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| TransportError::Spawn {
            command: config.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| TransportError::Spawn {
            command: config.command.clone(),
            reason: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| TransportError::Spawn {
            command: config.command.clone(),
            reason: "stdout not captured".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TransportError::Spawn {
            command: config.command.clone(),
            reason: "stderr not captured".to_string(),
        })?;

        // Stderr is freeform; stream it to the debug log.
        let command_name = config.command.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(command = %command_name, "upstream stderr: {line}");
            }
        });

        *inner.stdin.lock().await = Some(stdin);
        *inner.child.lock().await = Some(child);
        inner.connected.store(true, Ordering::SeqCst);

        let reader_inner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => reader_inner.handle_line(&line),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdout read failed");
                        break;
                    }
                }
            }
            // EOF observed: only now is it safe to tear down the channel
            // state, otherwise a racing restart could drop fresh entries.
            Inner::on_process_exit(reader_inner).await;
        });
        *inner.reader.lock().await = Some(handle);

        Ok(())
    }

    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let value: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed frame");
                return;
            }
        };

        let Some(raw_id) = value.get("id").filter(|id| !id.is_null()) else {
            // Notification from the upstream; never correlated.
            let method = value
                .get("method")
                .and_then(|m| m.as_str())
                .unwrap_or("<none>");
            tracing::debug!(method = %method, "upstream notification");
            return;
        };

        // JSON numbers may arrive as floats from dynamically typed peers;
        // canonicalize before the table lookup.
        let Some(id) = normalize_id(raw_id) else {
            tracing::warn!(id = %raw_id, "dropping frame with uncorrelatable id");
            return;
        };

        let response: JsonRpcResponse = match serde_json::from_value(value) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed response");
                return;
            }
        };

        let sender = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(&id)
        };
        match sender {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => tracing::warn!(id, "dropping response with unknown id"),
        }
    }

    async fn on_process_exit(inner: Arc<Inner>) {
        inner.connected.store(false, Ordering::SeqCst);
        inner.stdin.lock().await.take();
        if let Some(mut child) = inner.child.lock().await.take() {
            let _ = child.wait().await;
        }
        inner.fail_pending(|| TransportError::ProcessExited);

        if inner.closed.load(Ordering::SeqCst) || !inner.config.auto_restart {
            return;
        }

        let attempt = inner.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > inner.config.max_restarts {
            inner.restart_count.store(inner.config.max_restarts, Ordering::SeqCst);
            tracing::error!(
                command = %inner.config.command,
                max_restarts = inner.config.max_restarts,
                "upstream process exited, restart budget exhausted"
            );
            return;
        }

        tracing::warn!(
            command = %inner.config.command,
            attempt,
            "upstream process exited, restarting"
        );
        tokio::time::sleep(inner.config.restart_interval).await;
        if inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = Inner::spawn_process(Arc::clone(&inner)).await {
            tracing::error!(command = %inner.config.command, error = %e, "restart failed");
        }
    }

    fn fail_pending(&self, make_error: impl Fn() -> TransportError) {
        let drained: PendingMap = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::take(&mut *pending)
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(make_error()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canned_responder(response: &str) -> StdioConfig {
        // Reads one line, answers with a canned frame, then waits for EOF.
        StdioConfig::new("sh").with_args(vec![
            "-c".to_string(),
            format!("read line; printf '%s\\n' '{response}'; cat >/dev/null"),
        ])
    }

    #[tokio::test]
    async fn send_correlates_by_id() {
        let config = canned_responder(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#);
        let transport = StdioTransport::connect(config).await.unwrap();

        let req = JsonRpcRequest::new(1, "tools/list", None);
        let resp = transport.send(&req).await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);

        transport.close().await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn float_ids_correlate_with_integer_pending_entries() {
        // The child replies with id 1.0; the pending entry is keyed by 1.
        let config = canned_responder(r#"{"jsonrpc":"2.0","id":1.0,"result":"pong"}"#);
        let transport = StdioTransport::connect(config).await.unwrap();

        let req = JsonRpcRequest::new(1, "ping", None);
        let resp = transport.send(&req).await.unwrap();
        assert_eq!(resp.result.unwrap(), "pong");

        transport.close().await;
    }

    #[tokio::test]
    async fn pending_requests_fail_when_process_exits() {
        // Child exits immediately without answering.
        let config = StdioConfig::new("sh").with_args(vec!["-c".to_string(), "exit 0".to_string()]);
        let transport = StdioTransport::connect(config).await.unwrap();

        let req = JsonRpcRequest::new(1, "tools/list", None);
        let err = transport.send(&req).await.unwrap_err();
        assert!(
            matches!(
                err,
                TransportError::ProcessExited | TransportError::Closed | TransportError::NotConnected
            ),
            "unexpected error: {err}"
        );

        transport.close().await;
    }

    #[tokio::test]
    async fn auto_restart_respawns_the_child() {
        // Each incarnation exits immediately; the monitor restarts it.
        let config = StdioConfig::new("sh")
            .with_args(vec!["-c".to_string(), "cat >/dev/null".to_string()])
            .with_auto_restart(3, Duration::from_millis(50));
        let transport = StdioTransport::connect(config).await.unwrap();
        assert!(transport.is_connected());

        // Kill the child externally.
        {
            let mut child_guard = transport.inner.child.lock().await;
            if let Some(child) = child_guard.as_mut() {
                let _ = child.start_kill();
            }
        }

        // Within ~500ms the transport should be connected again.
        let mut restarted = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if transport.is_connected() && transport.restart_count() == 1 {
                restarted = true;
                break;
            }
        }
        assert!(restarted, "transport did not restart in time");

        transport.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let config = StdioConfig::new("sh").with_args(vec!["-c".to_string(), "cat >/dev/null".to_string()]);
        let transport = StdioTransport::connect(config).await.unwrap();
        transport.close().await;
        transport.close().await;
        assert!(!transport.is_connected());
    }
}
