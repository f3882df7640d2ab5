//! Stateless HTTP transport: one POST per JSON-RPC message.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::TransportError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// HTTP transport to one upstream endpoint.
///
/// There is no session: every `send` is an independent POST with the
/// JSON-RPC envelope as the body. `is_connected` is a soft flag cleared by
/// `close` and reset by `reconnect`.
pub struct HttpTransport {
    url: String,
    client: reqwest::Client,
    connected: AtomicBool,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        url::Url::parse(&url).map_err(|e| TransportError::Http(format!("invalid url '{url}': {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            url,
            client,
            connected: AtomicBool::new(true),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(TransportError::Http(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str(&body).map_err(|e| TransportError::Parse(e.to_string()))
    }

    /// Notifications are POSTed like requests; the reply body is ignored.
    pub async fn notify(&self, req: &JsonRpcRequest) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        self.client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(req)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        Ok(())
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails_fast() {
        let transport = HttpTransport::new("http://127.0.0.1:1/unreachable").unwrap();
        transport.close();

        let req = JsonRpcRequest::new(1, "tools/list", None);
        let err = transport.send(&req).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));

        transport.reconnect();
        assert!(transport.is_connected());
    }
}
