//! Transport polymorphism.
//!
//! Only two transports exist by design, so this is a closed enum rather
//! than a trait object. Both variants share the same contract: `send`
//! blocks until the response with a matching id arrives (or the caller's
//! timeout cancels the future), notifications are fire-and-forget, and
//! `close` is idempotent.

use crate::error::TransportError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

use super::http::HttpTransport;
use super::stdio::StdioTransport;

/// Which transport a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Http,
    Stdio,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Stdio => write!(f, "stdio"),
        }
    }
}

/// A connection to one upstream server.
pub enum Transport {
    Http(HttpTransport),
    Stdio(StdioTransport),
}

impl Transport {
    /// Send a request and wait for the correlated response.
    ///
    /// Dropping the returned future (timeout, cancellation) removes the
    /// pending entry on the stdio path, so a late reply is discarded
    /// instead of leaking table space.
    pub async fn send(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        match self {
            Self::Http(t) => t.send(req).await,
            Self::Stdio(t) => t.send(req).await,
        }
    }

    /// Send a notification; no response is awaited.
    pub async fn notify(&self, req: &JsonRpcRequest) -> Result<(), TransportError> {
        match self {
            Self::Http(t) => t.notify(req).await,
            Self::Stdio(t) => t.notify(req).await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Http(t) => t.close(),
            Self::Stdio(t) => t.close().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Http(t) => t.is_connected(),
            Self::Stdio(t) => t.is_connected(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Http(_) => TransportKind::Http,
            Self::Stdio(_) => TransportKind::Stdio,
        }
    }

    pub async fn reconnect(&self) -> Result<(), TransportError> {
        match self {
            Self::Http(t) => {
                t.reconnect();
                Ok(())
            }
            Self::Stdio(t) => t.reconnect().await,
        }
    }
}
