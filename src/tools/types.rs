//! The three-level tool taxonomy: toolkit → toolbox → tool.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RegistryError;

/// The leaf unit of execution: one callable tool on one upstream server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    /// Globally unique; assigned at registration when absent (nil).
    #[serde(default)]
    pub id: Uuid,
    /// Unique within the enclosing toolbox.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: serde_json::Value,
    /// Address of the responsible upstream server: a URL or a subprocess
    /// command line.
    pub mcp_server: String,
    /// Per-tool timeout in seconds, overriding the executor default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// Tag-bearing logical group of tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolbox {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub tools: Vec<Tool>,
}

impl Toolbox {
    /// `<toolbox>.<tool>` for one of this toolbox's tools.
    pub fn qualified_name(&self, tool: &Tool) -> String {
        format!("{}.{}", self.name, tool.name)
    }
}

/// Deployment status of a toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolkitStatus {
    #[default]
    Active,
    Inactive,
}

/// Deployment unit grouping toolboxes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Toolkit {
    #[serde(default)]
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: ToolkitStatus,
    #[serde(default)]
    pub toolboxes: Vec<Toolbox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Toolkit {
    /// Structural validation, run before registration.
    ///
    /// Checks: every tool carries a non-empty `mcp_server` and an object
    /// `input_schema`; tool names are unique within their toolbox; toolbox
    /// ids (where assigned) are distinct.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::Invalid("toolkit name is empty".to_string()));
        }

        let mut seen_boxes = BTreeSet::new();
        for toolbox in &self.toolboxes {
            if !toolbox.id.is_nil() && !seen_boxes.insert(toolbox.id) {
                return Err(RegistryError::Invalid(format!(
                    "duplicate toolbox id {} in toolkit '{}'",
                    toolbox.id, self.name
                )));
            }

            let mut seen_tools = BTreeSet::new();
            for tool in &toolbox.tools {
                if !seen_tools.insert(tool.name.as_str()) {
                    return Err(RegistryError::Invalid(format!(
                        "duplicate tool name '{}' in toolbox '{}'",
                        tool.name, toolbox.name
                    )));
                }
                if tool.mcp_server.trim().is_empty() {
                    return Err(RegistryError::Invalid(format!(
                        "tool '{}' has no mcp_server",
                        toolbox.qualified_name(tool)
                    )));
                }
                if !tool.input_schema.is_object() {
                    return Err(RegistryError::Invalid(format!(
                        "tool '{}' input_schema is not an object",
                        toolbox.qualified_name(tool)
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Split a qualified `<toolbox>.<tool>` name, validating the structure.
pub fn split_qualified_name(qualified: &str) -> Result<(&str, &str), RegistryError> {
    match qualified.split_once('.') {
        Some((toolbox, tool)) if !toolbox.is_empty() && !tool.is_empty() => Ok((toolbox, tool)),
        _ => Err(RegistryError::InvalidToolName(qualified.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn sample_tool(name: &str) -> Tool {
        Tool {
            id: Uuid::nil(),
            name: name.to_string(),
            description: format!("{name} tool"),
            input_schema: json!({"type": "object", "properties": {}}),
            mcp_server: "http://upstream".to_string(),
            timeout_secs: None,
        }
    }

    #[test]
    fn validates_duplicate_tool_names() {
        let toolkit = Toolkit {
            id: Uuid::nil(),
            name: "kit".to_string(),
            description: String::new(),
            status: ToolkitStatus::Active,
            toolboxes: vec![Toolbox {
                id: Uuid::nil(),
                name: "box".to_string(),
                version: "1".to_string(),
                description: String::new(),
                rating: None,
                tags: BTreeSet::new(),
                tools: vec![sample_tool("dup"), sample_tool("dup")],
            }],
            registered_at: None,
            updated_at: None,
        };
        assert!(matches!(toolkit.validate(), Err(RegistryError::Invalid(_))));
    }

    #[test]
    fn validates_missing_server() {
        let mut tool = sample_tool("t");
        tool.mcp_server = String::new();
        let toolkit = Toolkit {
            id: Uuid::nil(),
            name: "kit".to_string(),
            description: String::new(),
            status: ToolkitStatus::Active,
            toolboxes: vec![Toolbox {
                id: Uuid::nil(),
                name: "box".to_string(),
                version: String::new(),
                description: String::new(),
                rating: None,
                tags: BTreeSet::new(),
                tools: vec![tool],
            }],
            registered_at: None,
            updated_at: None,
        };
        assert!(toolkit.validate().is_err());
    }

    #[test]
    fn splits_qualified_names() {
        assert_eq!(split_qualified_name("weather.get_current").unwrap(), ("weather", "get_current"));
        assert!(split_qualified_name("weather").is_err());
        assert!(split_qualified_name(".x").is_err());
        assert!(split_qualified_name("x.").is_err());
    }
}
