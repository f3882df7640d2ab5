//! In-memory tool registry.
//!
//! A single reader/writer lock guards the toolkit map. No I/O happens under
//! the lock: persistence and search-index writes are dispatched to
//! background tasks after the map is updated, and both are best-effort.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{RegistryError, StorageError};

use super::search::SearchIndexer;
use super::store::RegistryStore;
use super::types::{split_qualified_name, Tool, Toolbox, Toolkit, ToolkitStatus};

/// A tool together with its registry context.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub tool: Tool,
    pub toolbox: String,
    pub qualified_name: String,
}

/// Registry totals, recomputed on every mutation.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RegistryTotals {
    pub toolkits: usize,
    pub toolboxes: usize,
    pub tools: usize,
}

struct RegistryState {
    toolkits: std::collections::HashMap<Uuid, Arc<Toolkit>>,
    totals: RegistryTotals,
}

/// Thread-safe store of toolkits, toolboxes and tools.
pub struct ToolRegistry {
    state: RwLock<RegistryState>,
    store: Option<Arc<dyn RegistryStore>>,
    indexer: Option<Arc<dyn SearchIndexer>>,
}

impl ToolRegistry {
    pub fn new(
        store: Option<Arc<dyn RegistryStore>>,
        indexer: Option<Arc<dyn SearchIndexer>>,
    ) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                toolkits: std::collections::HashMap::new(),
                totals: RegistryTotals::default(),
            }),
            store,
            indexer,
        }
    }

    /// Register (or re-register) a toolkit.
    ///
    /// Missing ids are assigned, timestamps stamped, and the toolkit
    /// replaces any previous version with the same id, so registration is
    /// idempotent. Persistence and indexing are scheduled in the
    /// background.
    pub fn register(&self, mut toolkit: Toolkit) -> Result<Arc<Toolkit>, RegistryError> {
        toolkit.validate()?;

        if toolkit.id.is_nil() {
            toolkit.id = Uuid::new_v4();
        }
        for toolbox in &mut toolkit.toolboxes {
            if toolbox.id.is_nil() {
                toolbox.id = Uuid::new_v4();
            }
            for tool in &mut toolbox.tools {
                if tool.id.is_nil() {
                    tool.id = Uuid::new_v4();
                }
            }
        }

        let now = Utc::now();
        let toolkit = {
            let mut state = self.write_state();
            let registered_at = state
                .toolkits
                .get(&toolkit.id)
                .and_then(|existing| existing.registered_at)
                .unwrap_or(now);
            toolkit.registered_at = Some(registered_at);
            toolkit.updated_at = Some(now);

            let toolkit = Arc::new(toolkit);
            state.toolkits.insert(toolkit.id, Arc::clone(&toolkit));
            let totals = Self::recompute_totals(&state);
            state.totals = totals;
            toolkit
        };

        self.dispatch_save(Arc::clone(&toolkit));
        self.dispatch_index(Arc::clone(&toolkit));

        tracing::info!(
            toolkit = %toolkit.name,
            toolkit_id = %toolkit.id,
            "registered toolkit"
        );
        Ok(toolkit)
    }

    /// Unregister a toolkit; schedules storage and index deletes.
    pub fn unregister(&self, id: Uuid) -> Result<(), RegistryError> {
        let removed = {
            let mut state = self.write_state();
            let removed = state
                .toolkits
                .remove(&id)
                .ok_or(RegistryError::ToolkitNotFound(id))?;
            let totals = Self::recompute_totals(&state);
            state.totals = totals;
            removed
        };

        if let Some(store) = self.store.clone() {
            tokio::spawn(async move {
                if let Err(e) = store.delete(id).await {
                    tracing::warn!(toolkit_id = %id, error = %e, "toolkit delete failed");
                }
            });
        }
        if let Some(indexer) = self.indexer.clone() {
            let toolbox_ids: Vec<Uuid> = removed.toolboxes.iter().map(|b| b.id).collect();
            tokio::spawn(async move {
                for toolbox_id in toolbox_ids {
                    if let Err(e) = indexer.delete_toolbox(toolbox_id).await {
                        tracing::warn!(toolbox_id = %toolbox_id, error = %e, "index delete failed");
                    }
                }
            });
        }

        tracing::info!(toolkit_id = %id, "unregistered toolkit");
        Ok(())
    }

    pub fn get_toolkit(&self, id: Uuid) -> Option<Arc<Toolkit>> {
        self.read_state().toolkits.get(&id).cloned()
    }

    pub fn list_toolkits(&self) -> Vec<Arc<Toolkit>> {
        self.read_state().toolkits.values().cloned().collect()
    }

    pub fn list_toolboxes(&self) -> Vec<Toolbox> {
        self.read_state()
            .toolkits
            .values()
            .flat_map(|kit| kit.toolboxes.iter().cloned())
            .collect()
    }

    pub fn list_all_tools(&self) -> Vec<RegisteredTool> {
        let state = self.read_state();
        let mut tools = Vec::with_capacity(state.totals.tools);
        for toolkit in state.toolkits.values() {
            for toolbox in &toolkit.toolboxes {
                for tool in &toolbox.tools {
                    tools.push(RegisteredTool {
                        tool: tool.clone(),
                        toolbox: toolbox.name.clone(),
                        qualified_name: toolbox.qualified_name(tool),
                    });
                }
            }
        }
        tools
    }

    /// Linear search by tool id.
    pub fn get_tool(&self, id: Uuid) -> Result<RegisteredTool, RegistryError> {
        let state = self.read_state();
        for toolkit in state.toolkits.values() {
            for toolbox in &toolkit.toolboxes {
                for tool in &toolbox.tools {
                    if tool.id == id {
                        return Ok(RegisteredTool {
                            tool: tool.clone(),
                            toolbox: toolbox.name.clone(),
                            qualified_name: toolbox.qualified_name(tool),
                        });
                    }
                }
            }
        }
        Err(RegistryError::ToolNotFound(id.to_string()))
    }

    /// Lookup by qualified `<toolbox>.<tool>` name.
    pub fn get_tool_by_name(&self, qualified: &str) -> Result<RegisteredTool, RegistryError> {
        let (toolbox_name, tool_name) = split_qualified_name(qualified)?;

        let state = self.read_state();
        for toolkit in state.toolkits.values() {
            for toolbox in &toolkit.toolboxes {
                if toolbox.name != toolbox_name {
                    continue;
                }
                for tool in &toolbox.tools {
                    if tool.name == tool_name {
                        return Ok(RegisteredTool {
                            tool: tool.clone(),
                            toolbox: toolbox.name.clone(),
                            qualified_name: qualified.to_string(),
                        });
                    }
                }
            }
        }
        Err(RegistryError::ToolNotFound(qualified.to_string()))
    }

    /// Substring search over tool name/description, restricted to
    /// toolboxes carrying every requested tag. Inactive toolkits stay
    /// addressable by name or id but are excluded from discovery.
    pub fn search(&self, query: &str, tags: &[String]) -> Vec<RegisteredTool> {
        let needle = query.to_lowercase();
        let state = self.read_state();
        let mut hits = Vec::new();

        for toolkit in state.toolkits.values() {
            if toolkit.status == ToolkitStatus::Inactive {
                continue;
            }
            for toolbox in &toolkit.toolboxes {
                if !tags.iter().all(|t| toolbox.tags.contains(t)) {
                    continue;
                }
                for tool in &toolbox.tools {
                    let matches = needle.is_empty()
                        || tool.name.to_lowercase().contains(&needle)
                        || tool.description.to_lowercase().contains(&needle);
                    if matches {
                        hits.push(RegisteredTool {
                            tool: tool.clone(),
                            toolbox: toolbox.name.clone(),
                            qualified_name: toolbox.qualified_name(tool),
                        });
                    }
                }
            }
        }
        hits
    }

    /// Populate the registry from durable backing at startup.
    ///
    /// Loaded toolkits are inserted as-is (no re-persist), but each
    /// toolbox is re-indexed so the search path works after a restart.
    pub async fn load_from_storage(&self) -> Result<usize, StorageError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };
        let toolkits = store.list().await?;
        let count = toolkits.len();

        {
            let mut state = self.write_state();
            for toolkit in toolkits {
                let toolkit = Arc::new(toolkit);
                state.toolkits.insert(toolkit.id, toolkit);
            }
            let totals = Self::recompute_totals(&state);
            state.totals = totals;
        }

        for toolkit in self.list_toolkits() {
            self.dispatch_index(toolkit);
        }

        tracing::info!(count, "loaded toolkits from storage");
        Ok(count)
    }

    pub fn totals(&self) -> RegistryTotals {
        self.read_state().totals
    }

    fn dispatch_save(&self, toolkit: Arc<Toolkit>) {
        if let Some(store) = self.store.clone() {
            tokio::spawn(async move {
                if let Err(e) = store.save(&toolkit).await {
                    tracing::warn!(toolkit_id = %toolkit.id, error = %e, "toolkit persist failed");
                }
            });
        }
    }

    fn dispatch_index(&self, toolkit: Arc<Toolkit>) {
        if let Some(indexer) = self.indexer.clone() {
            tokio::spawn(async move {
                for toolbox in &toolkit.toolboxes {
                    if let Err(e) = indexer.index_toolbox(toolkit.id, toolbox).await {
                        tracing::warn!(toolbox = %toolbox.name, error = %e, "toolbox index failed");
                    }
                }
            });
        }
    }

    fn recompute_totals(state: &RegistryState) -> RegistryTotals {
        let mut totals = RegistryTotals {
            toolkits: state.toolkits.len(),
            ..RegistryTotals::default()
        };
        for toolkit in state.toolkits.values() {
            totals.toolboxes += toolkit.toolboxes.len();
            totals.tools += toolkit.toolboxes.iter().map(|b| b.tools.len()).sum::<usize>();
        }
        totals
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}
