//! JSON-RPC dispatcher: the core's interface to any gateway surface.
//!
//! Surfaces (HTTP servers, stdio bridges) are external collaborators; they
//! hand raw frames or parsed requests to [`Dispatcher`] and write back
//! whatever it returns. Notifications produce no response.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{rpc_code, JobError, RegistryError, RpcError};
use crate::executor::{ExecutionEngine, ExecutionMode};
use crate::jobs::{JobFilter, JobManager, JobRequest, JobStatus};
use crate::protocol::{ContentBlock, InitializeResult, JsonRpcRequest, JsonRpcResponse, ToolDescriptor};
use crate::router::SemanticRouter;
use crate::tools::{RegisteredTool, ToolRegistry};

/// Parameters of `tools/call` / `call_tool`.
#[derive(Debug, Default, Deserialize)]
struct CallParams {
    name: Option<String>,
    query: Option<String>,
    /// Script source; implies the sandbox execution mode.
    code: Option<String>,
    /// Explicit execution mode ("direct" or "script"/"code"); defaults to
    /// script when `code` is present, direct otherwise.
    mode: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
    #[serde(default, rename = "async")]
    is_async: bool,
}

#[derive(Debug, Deserialize)]
struct JobIdParams {
    job_id: Uuid,
}

#[derive(Debug, Default, Deserialize)]
struct ListJobsParams {
    status: Option<JobStatus>,
    tool_name: Option<String>,
    limit: Option<usize>,
}

/// Core request dispatcher.
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    engine: Arc<ExecutionEngine>,
    router: Option<Arc<SemanticRouter>>,
    jobs: Arc<JobManager>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        engine: Arc<ExecutionEngine>,
        router: Option<Arc<SemanticRouter>>,
        jobs: Arc<JobManager>,
    ) -> Self {
        Self {
            registry,
            engine,
            router,
            jobs,
        }
    }

    /// Handle a raw frame. Malformed JSON yields a parse-error response
    /// with a null id.
    pub async fn handle_raw(&self, raw: &str) -> Option<JsonRpcResponse> {
        match serde_json::from_str::<JsonRpcRequest>(raw) {
            Ok(request) => self.handle(request).await,
            Err(e) => Some(JsonRpcResponse::error(
                Value::Null,
                rpc_code::PARSE_ERROR,
                format!("parse error: {e}"),
            )),
        }
    }

    /// Handle a parsed request. Notifications return `None`.
    pub async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            tracing::debug!(method = %request.method, "client notification");
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);

        let result = self
            .dispatch(&request.method, request.params.unwrap_or(Value::Null))
            .await;
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::error(id, e.code, e.message),
        })
    }

    async fn dispatch(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        match method {
            "initialize" => Ok(serde_json::to_value(InitializeResult::gateway())
                .map_err(|e| RpcError::internal(e.to_string()))?),
            "tools/list" | "list_tools" => self.list_tools(),
            "tools/call" | "call_tool" => self.call_tool(params).await,
            "resources/list" => Ok(json!({ "resources": [] })),
            "get_job" => self.get_job(params),
            "list_jobs" => self.list_jobs(params),
            "cancel_job" => self.cancel_job(params),
            other => Err(RpcError::method_not_found(other)),
        }
    }

    fn list_tools(&self) -> Result<Value, RpcError> {
        let tools: Vec<ToolDescriptor> = self
            .registry
            .list_all_tools()
            .into_iter()
            .map(|registered| ToolDescriptor {
                name: registered.qualified_name,
                description: registered.tool.description,
                input_schema: registered.tool.input_schema,
            })
            .collect();
        Ok(json!({ "tools": tools }))
    }

    async fn call_tool(&self, params: Value) -> Result<Value, RpcError> {
        let params: CallParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?;

        let mode = match &params.mode {
            Some(raw) => raw
                .parse::<ExecutionMode>()
                .map_err(|e| RpcError::invalid_params(e.to_string()))?,
            None if params.code.is_some() => ExecutionMode::Script,
            None => ExecutionMode::Direct,
        };

        // Script mode: the source runs in the sandbox with every
        // registered tool in scope.
        if mode == ExecutionMode::Script {
            let code = params
                .code
                .as_deref()
                .ok_or_else(|| RpcError::invalid_params("script mode requires 'code'"))?;
            let tools = self.registry.list_all_tools();
            let result = self.engine.script().execute(code, &tools).await;
            return Ok(json!({
                "content": [ContentBlock::text(render_result(&result.result, &result.error))],
                "isError": !result.success,
                "tool_used": "script",
            }));
        }

        let (tool, arguments) = self.resolve_call(&params).await?;

        if params.is_async {
            let job = self
                .jobs
                .create_job(JobRequest {
                    tool_name: Some(tool.qualified_name.clone()),
                    tool_id: Some(tool.tool.id),
                    args: arguments,
                    query: params.query.clone(),
                    ttl: None,
                    metadata: HashMap::new(),
                })
                .map_err(|e| RpcError::server(e.to_string()))?;

            return Ok(json!({
                "content": [ContentBlock::text(format!("job {} accepted", job.id))],
                "isError": false,
                "job": {
                    "id": job.id,
                    "status": job.status,
                    "tool": tool.qualified_name,
                    "created_at": job.created_at,
                },
            }));
        }

        let result = self.engine.direct().execute(&tool.tool, arguments).await;
        Ok(json!({
            "content": [ContentBlock::text(render_result(&result.result, &result.error))],
            "isError": !result.success,
            "tool_used": tool.qualified_name,
        }))
    }

    /// Resolve the target tool and arguments: an explicit name wins, a
    /// query goes through the router (which also extracts arguments the
    /// caller did not supply).
    async fn resolve_call(&self, params: &CallParams) -> Result<(RegisteredTool, Value), RpcError> {
        if let Some(name) = params.name.as_deref().filter(|s| !s.is_empty()) {
            let tool = self.registry.get_tool_by_name(name).map_err(|e| match e {
                RegistryError::ToolNotFound(_) => {
                    RpcError::new(rpc_code::METHOD_NOT_FOUND, e.to_string())
                }
                _ => RpcError::invalid_params(e.to_string()),
            })?;
            let arguments = params.arguments.clone().unwrap_or(json!({}));
            return Ok((tool, arguments));
        }

        if let Some(query) = params.query.as_deref().filter(|s| !s.is_empty()) {
            let router = self
                .router
                .as_ref()
                .ok_or_else(|| RpcError::server("LLM provider not configured"))?;
            let (tool, intent) = router
                .route(query)
                .await
                .map_err(|e| RpcError::server(e.to_string()))?;

            // Explicit arguments win; router filters fill the gaps.
            let mut arguments = serde_json::Map::new();
            for (key, value) in &intent.filters {
                arguments.insert(key.clone(), Value::String(value.clone()));
            }
            let extracted = router.extract_parameters(query, &tool.tool.input_schema).await;
            for (key, value) in extracted {
                arguments.insert(key, value);
            }
            if let Some(Value::Object(explicit)) = &params.arguments {
                for (key, value) in explicit {
                    arguments.insert(key.clone(), value.clone());
                }
            }
            return Ok((tool, Value::Object(arguments)));
        }

        Err(RpcError::invalid_params(
            "either 'name', 'query' or 'code' is required",
        ))
    }

    fn get_job(&self, params: Value) -> Result<Value, RpcError> {
        let params: JobIdParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?;
        let job = self.jobs.get_job(params.job_id).map_err(|e| match e {
            JobError::NotFound(_) => RpcError::new(rpc_code::METHOD_NOT_FOUND, e.to_string()),
            other => RpcError::server(other.to_string()),
        })?;
        serde_json::to_value(job).map_err(|e| RpcError::internal(e.to_string()))
    }

    fn list_jobs(&self, params: Value) -> Result<Value, RpcError> {
        let params: ListJobsParams = if params.is_null() {
            ListJobsParams::default()
        } else {
            serde_json::from_value(params)
                .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?
        };

        let jobs = self
            .jobs
            .list(&JobFilter {
                status: params.status,
                tool_name: params.tool_name,
                limit: params.limit,
                ..JobFilter::default()
            })
            .map_err(|e| RpcError::server(e.to_string()))?;

        let count = jobs.len();
        Ok(json!({ "jobs": jobs, "count": count }))
    }

    fn cancel_job(&self, params: Value) -> Result<Value, RpcError> {
        let params: JobIdParams = serde_json::from_value(params)
            .map_err(|e| RpcError::invalid_params(format!("invalid params: {e}")))?;
        let job = self
            .jobs
            .cancel(params.job_id)
            .map_err(|e| RpcError::server(e.to_string()))?;
        serde_json::to_value(job).map_err(|e| RpcError::internal(e.to_string()))
    }
}

/// Render a result (or error) as the text content of a call response.
fn render_result(result: &Value, error: &Option<String>) -> String {
    if let Some(error) = error {
        return error.clone();
    }
    match result {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| other.to_string()),
    }
}
