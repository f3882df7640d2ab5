//! toolgate — federated MCP tool-execution gateway core.
//!
//! Sits between JSON-RPC (MCP) clients and a fleet of upstream tool
//! servers. Clients submit a `(tool, arguments)` call or a natural-language
//! query; the core discovers the right tool, invokes it on the responsible
//! upstream, and returns the result synchronously or as a tracked
//! asynchronous job with streamed progress.
//!
//! Subsystems, leaves first:
//!
//! - [`upstream`]: pooled, circuit-broken JSON-RPC clients over HTTP or
//!   child-process stdio.
//! - [`executor`]: direct upstream dispatch and the sandboxed script mode.
//! - [`tools`]: the toolkit → toolbox → tool registry with durable backing
//!   and a search-index plug point.
//! - [`jobs`]: durable job queue with a worker pool, event pub/sub and
//!   streaming.
//! - [`router`]: LLM-backed natural-language routing with a
//!   primary/fallback provider chain.
//! - [`rpc`]: the JSON-RPC dispatcher a gateway surface mounts.

pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod jobs;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod tools;
pub mod upstream;

pub use gateway::{Gateway, GatewayStats};
