//! Search indexer plug point.
//!
//! The indexer is the fast path for natural-language tool resolution; the
//! registry remains the source of truth. Index writes are best-effort and
//! dispatched in the background, so implementations must tolerate being
//! unavailable.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StorageError;

use super::types::Toolbox;

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub tool_id: Uuid,
    pub qualified_name: String,
    pub score: f32,
}

/// Narrow indexing interface; external engines are a drop-in.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index_toolbox(&self, toolkit_id: Uuid, toolbox: &Toolbox) -> Result<(), StorageError>;
    async fn delete_toolbox(&self, toolbox_id: Uuid) -> Result<(), StorageError>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StorageError>;
    async fn health_check(&self) -> bool;
}

#[derive(Debug, Clone)]
struct IndexedTool {
    tool_id: Uuid,
    qualified_name: String,
    haystack: String,
}

/// In-memory substring indexer.
pub struct InMemoryIndexer {
    toolboxes: RwLock<HashMap<Uuid, Vec<IndexedTool>>>,
}

impl InMemoryIndexer {
    pub fn new() -> Self {
        Self {
            toolboxes: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryIndexer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SearchIndexer for InMemoryIndexer {
    async fn index_toolbox(&self, _toolkit_id: Uuid, toolbox: &Toolbox) -> Result<(), StorageError> {
        let tags = toolbox.tags.iter().cloned().collect::<Vec<_>>().join(" ");
        let entries = toolbox
            .tools
            .iter()
            .map(|tool| IndexedTool {
                tool_id: tool.id,
                qualified_name: toolbox.qualified_name(tool),
                haystack: format!(
                    "{} {} {} {tags}",
                    tool.name, tool.description, toolbox.name
                )
                .to_lowercase(),
            })
            .collect();

        let mut toolboxes = self.toolboxes.write().unwrap_or_else(|p| p.into_inner());
        toolboxes.insert(toolbox.id, entries);
        Ok(())
    }

    async fn delete_toolbox(&self, toolbox_id: Uuid) -> Result<(), StorageError> {
        let mut toolboxes = self.toolboxes.write().unwrap_or_else(|p| p.into_inner());
        toolboxes.remove(&toolbox_id);
        Ok(())
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, StorageError> {
        let needles: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if needles.is_empty() {
            return Ok(Vec::new());
        }

        let toolboxes = self.toolboxes.read().unwrap_or_else(|p| p.into_inner());
        let mut hits: Vec<SearchHit> = toolboxes
            .values()
            .flatten()
            .filter_map(|entry| {
                let matched = needles
                    .iter()
                    .filter(|n| entry.haystack.contains(n.as_str()))
                    .count();
                if matched == 0 {
                    return None;
                }
                Some(SearchHit {
                    tool_id: entry.tool_id,
                    qualified_name: entry.qualified_name.clone(),
                    score: matched as f32 / needles.len() as f32,
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::types::Tool;
    use std::collections::BTreeSet;

    fn weather_toolbox() -> Toolbox {
        Toolbox {
            id: Uuid::new_v4(),
            name: "weather".to_string(),
            version: "1.0".to_string(),
            description: "weather lookups".to_string(),
            rating: None,
            tags: BTreeSet::from(["forecast".to_string()]),
            tools: vec![Tool {
                id: Uuid::new_v4(),
                name: "get_current".to_string(),
                description: "current conditions for a city".to_string(),
                input_schema: serde_json::json!({"type": "object"}),
                mcp_server: "http://u".to_string(),
                timeout_secs: None,
            }],
        }
    }

    #[tokio::test]
    async fn indexes_and_searches() {
        let indexer = InMemoryIndexer::new();
        let toolbox = weather_toolbox();
        indexer.index_toolbox(Uuid::new_v4(), &toolbox).await.unwrap();

        let hits = indexer.search("weather current", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].qualified_name, "weather.get_current");

        indexer.delete_toolbox(toolbox.id).await.unwrap();
        assert!(indexer.search("weather", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let indexer = InMemoryIndexer::new();
        assert!(indexer.search("   ", 5).await.unwrap().is_empty());
    }
}
