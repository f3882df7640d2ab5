//! Resilient JSON-RPC clients to the upstream tool servers.
//!
//! An upstream is addressed by a single string: `http(s)://...` selects the
//! stateless HTTP transport, anything else is parsed as a subprocess
//! command line and run over stdio. Connections are pooled per server and
//! wrapped in a per-server circuit breaker.

mod breaker;
mod client;
mod http;
mod pool;
mod stdio;
mod transport;

pub use breaker::{BreakerManager, BreakerState, CircuitBreaker};
pub use client::UpstreamClient;
pub use http::HttpTransport;
pub use pool::{ConnectionPool, PoolManager, PoolStats, PooledConnection};
pub use stdio::{StdioConfig, StdioTransport};
pub use transport::{Transport, TransportKind};

/// How to reach one upstream server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddress {
    /// HTTP endpoint accepting one POST per JSON-RPC message.
    Http(String),
    /// Subprocess command line, framed as line-delimited JSON on stdio.
    Stdio { command: String, args: Vec<String> },
}

impl UpstreamAddress {
    /// Parse a tool's `mcp_server` field.
    ///
    /// `http://` and `https://` prefixes select HTTP; everything else is
    /// whitespace-split into a command and its arguments.
    pub fn parse(address: &str) -> Self {
        if address.starts_with("http://") || address.starts_with("https://") {
            return Self::Http(address.to_string());
        }
        let mut parts = address.split_whitespace().map(str::to_string);
        let command = parts.next().unwrap_or_default();
        Self::Stdio {
            command,
            args: parts.collect(),
        }
    }

    pub fn is_stdio(&self) -> bool {
        matches!(self, Self::Stdio { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_addresses() {
        assert_eq!(
            UpstreamAddress::parse("http://localhost:8080/mcp"),
            UpstreamAddress::Http("http://localhost:8080/mcp".to_string())
        );
    }

    #[test]
    fn parses_command_lines() {
        assert_eq!(
            UpstreamAddress::parse("mock-mcp --port 9"),
            UpstreamAddress::Stdio {
                command: "mock-mcp".to_string(),
                args: vec!["--port".to_string(), "9".to_string()],
            }
        );
    }
}
