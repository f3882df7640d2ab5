//! Script sandbox calling injected tools that hit a real (mock) upstream.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use uuid::Uuid;

use toolgate::config::SandboxConfig;
use toolgate::executor::ScriptExecutor;
use toolgate::tools::{Tool, Toolbox, Toolkit, ToolRegistry};

use common::{direct_executor, spawn_mock_upstream};

fn issues_toolkit(server: &str) -> Toolkit {
    Toolkit {
        id: Uuid::nil(),
        name: "Issues".to_string(),
        description: String::new(),
        status: Default::default(),
        toolboxes: vec![Toolbox {
            id: Uuid::nil(),
            name: "github".to_string(),
            version: "1.0".to_string(),
            description: "issue tracking".to_string(),
            rating: None,
            tags: BTreeSet::new(),
            tools: vec![Tool {
                id: Uuid::nil(),
                name: "list_issues".to_string(),
                description: "list repository issues".to_string(),
                input_schema: json!({ "type": "object", "properties": {} }),
                mcp_server: server.to_string(),
                timeout_secs: None,
            }],
        }],
        registered_at: None,
        updated_at: None,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn script_chains_tool_results() {
    let mock = spawn_mock_upstream().await;
    mock.set_response(json!([
        { "labels": ["critical"] },
        { "labels": ["enhancement"] },
    ]));

    let registry = ToolRegistry::new(None, None);
    registry.register(issues_toolkit(&mock.url())).unwrap();

    let sandbox = ScriptExecutor::new(direct_executor(), SandboxConfig::default());
    let tools = registry.list_all_tools();

    let result = sandbox
        .execute(
            r#"
            let xs = list_issues(#{});
            xs.filter(|i| "critical" in i.labels).len()
            "#,
            &tools,
        )
        .await;

    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.result, json!(1));
    assert_eq!(mock.recorded_calls().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_tool_call_raises_in_script() {
    let registry = ToolRegistry::new(None, None);
    // Unreachable upstream: the injected callable must raise.
    registry.register(issues_toolkit("http://127.0.0.1:1")).unwrap();

    let sandbox = ScriptExecutor::new(direct_executor(), SandboxConfig::default());
    let tools = registry.list_all_tools();

    let result = sandbox.execute("list_issues(#{})", &tools).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("list_issues"));
}

#[tokio::test(flavor = "multi_thread")]
async fn script_sees_tool_errors_and_can_recover(){
    let mock = spawn_mock_upstream().await;
    mock.set_response(json!({ "count": 2 }));

    let registry = ToolRegistry::new(None, None);
    registry.register(issues_toolkit(&mock.url())).unwrap();

    let sandbox = ScriptExecutor::new(direct_executor(), SandboxConfig::default());
    let tools = registry.list_all_tools();

    let result = sandbox
        .execute(
            r#"
            let r = list_issues(#{});
            log(r);
            r.count * 10
            "#,
            &tools,
        )
        .await;
    assert!(result.success, "error: {:?}", result.error);
    assert_eq!(result.result, json!(20));
}
