//! Shared test fixtures: an in-process mock upstream MCP server and
//! component builders.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use serde_json::{json, Value};
use uuid::Uuid;

use toolgate::config::{BreakerConfig, ExecutorConfig, PoolConfig};
use toolgate::executor::DirectExecutor;
use toolgate::tools::{Tool, Toolbox, Toolkit};
use toolgate::upstream::{BreakerManager, PoolManager};

/// Everything recorded and served by the mock upstream.
#[derive(Clone)]
pub struct MockUpstream {
    /// Params of every `tools/call` received.
    pub calls: Arc<Mutex<Vec<Value>>>,
    /// Canned `tools/call` result.
    pub response: Arc<Mutex<Value>>,
    pub addr: SocketAddr,
}

impl MockUpstream {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn recorded_calls(&self) -> Vec<Value> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_response(&self, value: Value) {
        *self.response.lock().unwrap() = value;
    }
}

async fn mcp_handler(
    State(mock): State<MockUpstream>,
    Json(request): Json<Value>,
) -> Json<Value> {
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let id = request["id"].clone();

    // Notifications get no envelope back.
    if id.is_null() {
        return Json(Value::Null);
    }

    let result = match method.as_str() {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mock-upstream", "version": "0.0.1" },
        }),
        "tools/list" => json!({ "tools": [] }),
        "tools/call" => {
            let params = request["params"].clone();
            mock.calls.lock().unwrap().push(params);
            mock.response.lock().unwrap().clone()
        }
        _ => json!({}),
    };

    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

/// Start a mock upstream on an ephemeral port.
pub async fn spawn_mock_upstream() -> MockUpstream {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mock = MockUpstream {
        calls: Arc::new(Mutex::new(Vec::new())),
        response: Arc::new(Mutex::new(json!({ "ok": true }))),
        addr,
    };

    let router = Router::new()
        .route("/", post(mcp_handler))
        .with_state(mock.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    mock
}

/// A Weather toolkit whose single tool points at `server`.
pub fn weather_toolkit(server: &str) -> Toolkit {
    Toolkit {
        id: Uuid::nil(),
        name: "Weather".to_string(),
        description: "weather tools".to_string(),
        status: Default::default(),
        toolboxes: vec![Toolbox {
            id: Uuid::nil(),
            name: "weather".to_string(),
            version: "1.0".to_string(),
            description: "weather lookups".to_string(),
            rating: None,
            tags: BTreeSet::from(["forecast".to_string()]),
            tools: vec![Tool {
                id: Uuid::nil(),
                name: "get_current".to_string(),
                description: "current conditions for a city".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"],
                }),
                mcp_server: server.to_string(),
                timeout_secs: None,
            }],
        }],
        registered_at: None,
        updated_at: None,
    }
}

/// A direct executor with default pool and breaker settings.
pub fn direct_executor() -> Arc<DirectExecutor> {
    Arc::new(DirectExecutor::new(
        Arc::new(PoolManager::new(PoolConfig::default())),
        Arc::new(BreakerManager::new(BreakerConfig::default())),
        ExecutorConfig::default(),
    ))
}
