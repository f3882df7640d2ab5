//! Initialized JSON-RPC client to one upstream server.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::TransportError;
use crate::protocol::{JsonRpcRequest, ToolDescriptor, PROTOCOL_VERSION};

use super::stdio::{StdioConfig, StdioTransport};
use super::transport::{Transport, TransportKind};
use super::{HttpTransport, UpstreamAddress};

/// A client owns one transport and generates the monotonically-increasing
/// request ids the correlation layer relies on.
pub struct UpstreamClient {
    server: String,
    transport: Transport,
    next_id: AtomicU64,
}

impl UpstreamClient {
    /// Connect a transport for `address` without performing the handshake.
    pub async fn connect(address: &UpstreamAddress) -> Result<Self, TransportError> {
        let (server, transport) = match address {
            UpstreamAddress::Http(url) => {
                (url.clone(), Transport::Http(HttpTransport::new(url)?))
            }
            UpstreamAddress::Stdio { command, args } => {
                let config = StdioConfig::new(command.as_str()).with_args(args.clone());
                let label = if args.is_empty() {
                    command.clone()
                } else {
                    format!("{command} {}", args.join(" "))
                };
                (label, Transport::Stdio(StdioTransport::connect(config).await?))
            }
        };

        Ok(Self {
            server,
            transport,
            next_id: AtomicU64::new(1),
        })
    }

    /// Connect over an explicit stdio configuration (restart policy etc.).
    pub async fn connect_stdio(config: StdioConfig) -> Result<Self, TransportError> {
        let server = config.command.clone();
        let transport = Transport::Stdio(StdioTransport::connect(config).await?);
        Ok(Self {
            server,
            transport,
            next_id: AtomicU64::new(1),
        })
    }

    /// MCP handshake: `initialize`, then the `notifications/initialized`
    /// fire-and-forget.
    pub async fn initialize(&self) -> Result<(), TransportError> {
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        )
        .await?;

        let note = JsonRpcRequest::notification("notifications/initialized", None);
        self.transport.notify(&note).await
    }

    /// Issue a request and unwrap the JSON-RPC result.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.transport.send(&req).await?;

        if let Some(err) = resp.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp.result.unwrap_or(Value::Null))
    }

    /// `tools/list`, also used as the borrow-time health probe.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, TransportError> {
        let result = self.request("tools/list", None).await?;
        let tools = result.get("tools").cloned().unwrap_or(Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| TransportError::Parse(e.to_string()))
    }

    /// `tools/call` with the upstream's short tool name.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    /// Health probe with an explicit budget.
    pub async fn probe(&self, budget: Duration) -> Result<(), TransportError> {
        match tokio::time::timeout(budget, self.list_tools()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout {
                id: 0,
                timeout: budget,
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        self.transport.reconnect().await
    }
}
