//! Tool taxonomy and registry.
//!
//! Toolkits are deployment units grouping toolboxes; toolboxes group tools;
//! a tool names the upstream server responsible for executing it. The
//! registry owns all three exclusively, with durable backing and a search
//! indexer as plug points.

mod registry;
mod search;
mod store;
mod types;

pub use registry::{RegisteredTool, RegistryTotals, ToolRegistry};
pub use search::{InMemoryIndexer, SearchHit, SearchIndexer};
pub use store::{RegistryStore, SledRegistryStore};
pub use types::{split_qualified_name, Tool, Toolbox, Toolkit, ToolkitStatus};
