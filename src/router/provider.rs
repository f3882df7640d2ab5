//! LLM providers for intent parsing and parameter extraction.
//!
//! Two remote shapes are supported: an OpenAI-compatible chat-completion
//! endpoint and a single-prompt generate endpoint. Both expect the model
//! to reply with a JSON object embedded in free text, extracted by the
//! first-`{`/last-`}` span. A latched fallback provider composes two of
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::{json, Value};

use crate::config::LlmProviderConfig;
use crate::error::LlmError;

use super::intent::Intent;

const MAX_RETRIES: u32 = 3;
/// Token budget for the single-prompt generate shape.
const GENERATE_MAX_TOKENS: u32 = 200;
const GENERATE_TEMPERATURE: f64 = 0.1;

/// Provider interface consumed by the router.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_intent(&self, query: &str) -> Result<Intent, LlmError>;

    async fn generate_intent_with_context(
        &self,
        query: &str,
        tools_context: &str,
    ) -> Result<Intent, LlmError>;

    /// Map a query onto a tool's input schema. Unparseable model output
    /// yields an empty map rather than an error.
    async fn extract_parameters(
        &self,
        query: &str,
        schema: &Value,
    ) -> Result<HashMap<String, Value>, LlmError>;

    async fn health_check(&self) -> bool;
}

/// Extract the first `{...}` span (first opening to last closing brace).
///
/// Models wrap their JSON in prose and code fences; this recovers the
/// object without needing the reply to be pure JSON.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

fn parse_intent_reply(provider: &str, reply: &str, query: &str) -> Result<Intent, LlmError> {
    let span = extract_json_object(reply).ok_or_else(|| LlmError::InvalidResponse {
        provider: provider.to_string(),
        reason: format!("no JSON object in reply: {reply}"),
    })?;
    let mut intent: Intent =
        serde_json::from_str(span).map_err(|e| LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: format!("intent parse error: {e}"),
        })?;
    intent.raw_query = query.to_string();
    Ok(intent)
}

fn parse_parameters_reply(reply: &str) -> HashMap<String, Value> {
    let Some(span) = extract_json_object(reply) else {
        return HashMap::new();
    };
    serde_json::from_str(span).unwrap_or_default()
}

const INTENT_SYSTEM_PROMPT: &str = "You translate user requests into a JSON object with keys \
action, domain, entity, filters (string map) and confidence (0..1). \
Reply with the JSON object only.";

fn intent_user_prompt(query: &str, tools_context: &str) -> String {
    if tools_context.is_empty() {
        format!("Request: {query}")
    } else {
        format!("Available tools:\n{tools_context}\n\nRequest: {query}")
    }
}

fn extract_user_prompt(query: &str, schema: &Value) -> String {
    format!(
        "Extract the arguments for this JSON schema from the request. \
Reply with a JSON object only.\n\nSchema: {schema}\n\nRequest: {query}"
    )
}

fn is_retryable_status(status: u16) -> bool {
    (500..600).contains(&status)
}

/// Shared request plumbing for the two remote shapes.
struct RemoteEndpoint {
    client: reqwest::Client,
    config: LlmProviderConfig,
    label: String,
}

impl RemoteEndpoint {
    fn new(config: LlmProviderConfig, label: &str) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: label.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            config,
            label: label.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        // A base already ending in /v1 keeps its prefix.
        if base.ends_with("/v1")
            && let Some(stripped) = path.strip_prefix("v1/")
        {
            return format!("{base}/{stripped}");
        }
        format!("{base}/{path}")
    }

    fn bearer(&self) -> Option<String> {
        self.config
            .api_key
            .as_ref()
            .map(|key| format!("Bearer {}", key.expose_secret()))
    }

    /// POST with up to 3 attempts on 5xx, `sleep(attempt)` between them.
    /// 4xx is surfaced immediately.
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, LlmError> {
        let url = self.url(path);

        for attempt in 1..=MAX_RETRIES {
            let mut request = self.client.post(&url).json(body);
            if let Some(auth) = self.bearer() {
                request = request.header("Authorization", auth);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        tracing::warn!(
                            provider = %self.label,
                            attempt,
                            error = %e,
                            "LLM request error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                        continue;
                    }
                    return Err(LlmError::RequestFailed {
                        provider: self.label.clone(),
                        reason: e.to_string(),
                    });
                }
            };

            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.is_success() {
                return serde_json::from_str(&text).map_err(|e| LlmError::InvalidResponse {
                    provider: self.label.clone(),
                    reason: format!("JSON parse error: {e}"),
                });
            }

            if status.as_u16() == 401 {
                return Err(LlmError::AuthFailed {
                    provider: self.label.clone(),
                });
            }

            if is_retryable_status(status.as_u16()) && attempt < MAX_RETRIES {
                tracing::warn!(
                    provider = %self.label,
                    attempt,
                    status = status.as_u16(),
                    "LLM endpoint error, retrying"
                );
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                continue;
            }

            return Err(LlmError::RequestFailed {
                provider: self.label.clone(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        Err(LlmError::RequestFailed {
            provider: self.label.clone(),
            reason: "retry loop exited unexpectedly".to_string(),
        })
    }

    async fn reachable(&self, probe_path: &str) -> bool {
        let mut request = self.client.get(self.url(probe_path));
        if let Some(auth) = self.bearer() {
            request = request.header("Authorization", auth);
        }
        request.send().await.is_ok()
    }
}

/// OpenAI-compatible chat-completion provider.
pub struct ChatCompletionProvider {
    endpoint: RemoteEndpoint,
}

impl ChatCompletionProvider {
    pub fn new(config: LlmProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: RemoteEndpoint::new(config, "chat_completion")?,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.endpoint.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        let reply = self.endpoint.post_json("v1/chat/completions", &body).await?;

        reply["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.endpoint.label.clone(),
                reason: "missing choices[0].message.content".to_string(),
            })
    }
}

#[async_trait]
impl LlmProvider for ChatCompletionProvider {
    fn name(&self) -> &str {
        &self.endpoint.label
    }

    async fn generate_intent(&self, query: &str) -> Result<Intent, LlmError> {
        self.generate_intent_with_context(query, "").await
    }

    async fn generate_intent_with_context(
        &self,
        query: &str,
        tools_context: &str,
    ) -> Result<Intent, LlmError> {
        let reply = self
            .chat(INTENT_SYSTEM_PROMPT, &intent_user_prompt(query, tools_context))
            .await?;
        parse_intent_reply(&self.endpoint.label, &reply, query)
    }

    async fn extract_parameters(
        &self,
        query: &str,
        schema: &Value,
    ) -> Result<HashMap<String, Value>, LlmError> {
        let reply = self
            .chat(
                "You extract tool arguments as JSON.",
                &extract_user_prompt(query, schema),
            )
            .await?;
        Ok(parse_parameters_reply(&reply))
    }

    async fn health_check(&self) -> bool {
        self.endpoint.reachable("v1/models").await
    }
}

/// Single-prompt generate provider (low temperature, small token budget).
pub struct GenerateProvider {
    endpoint: RemoteEndpoint,
}

impl GenerateProvider {
    pub fn new(config: LlmProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            endpoint: RemoteEndpoint::new(config, "generate")?,
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let body = json!({
            "model": self.endpoint.config.model,
            "prompt": prompt,
            "temperature": GENERATE_TEMPERATURE,
            "max_tokens": GENERATE_MAX_TOKENS,
            "stream": false,
        });
        let reply = self.endpoint.post_json("api/generate", &body).await?;

        reply["response"]
            .as_str()
            .or_else(|| reply["text"].as_str())
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: self.endpoint.label.clone(),
                reason: "missing response text".to_string(),
            })
    }
}

#[async_trait]
impl LlmProvider for GenerateProvider {
    fn name(&self) -> &str {
        &self.endpoint.label
    }

    async fn generate_intent(&self, query: &str) -> Result<Intent, LlmError> {
        self.generate_intent_with_context(query, "").await
    }

    async fn generate_intent_with_context(
        &self,
        query: &str,
        tools_context: &str,
    ) -> Result<Intent, LlmError> {
        let prompt = format!(
            "{INTENT_SYSTEM_PROMPT}\n\n{}",
            intent_user_prompt(query, tools_context)
        );
        let reply = self.generate(&prompt).await?;
        parse_intent_reply(&self.endpoint.label, &reply, query)
    }

    async fn extract_parameters(
        &self,
        query: &str,
        schema: &Value,
    ) -> Result<HashMap<String, Value>, LlmError> {
        let reply = self.generate(&extract_user_prompt(query, schema)).await?;
        Ok(parse_parameters_reply(&reply))
    }

    async fn health_check(&self) -> bool {
        self.endpoint.reachable("").await
    }
}

/// Primary/fallback composition with a latched switch.
///
/// Once the primary fails, every subsequent call goes to the fallback.
/// The latch never resets on its own; call [`FallbackProvider::reset`]
/// after the primary is known healthy again.
pub struct FallbackProvider {
    primary: Arc<dyn LlmProvider>,
    fallback: Arc<dyn LlmProvider>,
    use_fallback: AtomicBool,
}

impl FallbackProvider {
    pub fn new(primary: Arc<dyn LlmProvider>, fallback: Arc<dyn LlmProvider>) -> Self {
        Self {
            primary,
            fallback,
            use_fallback: AtomicBool::new(false),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.use_fallback.load(Ordering::SeqCst)
    }

    /// Clear the latch, restoring the primary for the next call.
    pub fn reset(&self) {
        self.use_fallback.store(false, Ordering::SeqCst);
    }

    fn latch(&self, error: &LlmError) {
        if !self.use_fallback.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                primary = %self.primary.name(),
                fallback = %self.fallback.name(),
                error = %error,
                "primary LLM provider failed, latching onto fallback"
            );
        }
    }
}

#[async_trait]
impl LlmProvider for FallbackProvider {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn generate_intent(&self, query: &str) -> Result<Intent, LlmError> {
        if !self.is_latched() {
            match self.primary.generate_intent(query).await {
                Ok(intent) => return Ok(intent),
                Err(e) => self.latch(&e),
            }
        }
        self.fallback.generate_intent(query).await
    }

    async fn generate_intent_with_context(
        &self,
        query: &str,
        tools_context: &str,
    ) -> Result<Intent, LlmError> {
        if !self.is_latched() {
            match self
                .primary
                .generate_intent_with_context(query, tools_context)
                .await
            {
                Ok(intent) => return Ok(intent),
                Err(e) => self.latch(&e),
            }
        }
        self.fallback
            .generate_intent_with_context(query, tools_context)
            .await
    }

    async fn extract_parameters(
        &self,
        query: &str,
        schema: &Value,
    ) -> Result<HashMap<String, Value>, LlmError> {
        if !self.is_latched() {
            match self.primary.extract_parameters(query, schema).await {
                Ok(map) => return Ok(map),
                Err(e) => self.latch(&e),
            }
        }
        self.fallback.extract_parameters(query, schema).await
    }

    async fn health_check(&self) -> bool {
        if self.is_latched() {
            self.fallback.health_check().await
        } else {
            self.primary.health_check().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn brace_extraction() {
        assert_eq!(
            extract_json_object(r#"Sure! {"a": 1} hope that helps"#),
            Some(r#"{"a": 1}"#)
        );
        assert_eq!(
            extract_json_object("```json\n{\"a\": {\"b\": 2}}\n```"),
            Some("{\"a\": {\"b\": 2}}")
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} {"), None);
    }

    #[test]
    fn parameters_reply_is_lenient() {
        assert!(parse_parameters_reply("garbage").is_empty());
        assert!(parse_parameters_reply(r#"{"not": "a map}"#).is_empty());
        let map = parse_parameters_reply(r#"args: {"city": "Berlin"}"#);
        assert_eq!(map["city"], "Berlin");
    }

    struct StubProvider {
        fail: bool,
        calls: AtomicU32,
        label: String,
    }

    impl StubProvider {
        fn new(label: &str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail,
                calls: AtomicU32::new(0),
                label: label.to_string(),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            &self.label
        }

        async fn generate_intent(&self, query: &str) -> Result<Intent, LlmError> {
            self.generate_intent_with_context(query, "").await
        }

        async fn generate_intent_with_context(
            &self,
            query: &str,
            _tools_context: &str,
        ) -> Result<Intent, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(LlmError::RequestFailed {
                    provider: self.label.clone(),
                    reason: "stubbed failure".to_string(),
                });
            }
            Ok(Intent {
                action: "get".to_string(),
                domain: self.label.clone(),
                entity: "thing".to_string(),
                filters: HashMap::new(),
                confidence: 1.0,
                raw_query: query.to_string(),
            })
        }

        async fn extract_parameters(
            &self,
            _query: &str,
            _schema: &Value,
        ) -> Result<HashMap<String, Value>, LlmError> {
            Ok(HashMap::new())
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    #[tokio::test]
    async fn failover_latches_onto_fallback() {
        let primary = StubProvider::new("primary", true);
        let fallback = StubProvider::new("secondary", false);
        let provider = FallbackProvider::new(
            Arc::clone(&primary) as Arc<dyn LlmProvider>,
            Arc::clone(&fallback) as Arc<dyn LlmProvider>,
        );

        let intent = provider.generate_intent("hello").await.unwrap();
        assert_eq!(intent.domain, "secondary");
        assert!(provider.is_latched());

        // The latch routes straight to the fallback: the primary is not
        // consulted again.
        provider.generate_intent("again").await.unwrap();
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 2);

        provider.reset();
        assert!(!provider.is_latched());
    }

    #[tokio::test]
    async fn healthy_primary_is_kept() {
        let primary = StubProvider::new("primary", false);
        let fallback = StubProvider::new("secondary", false);
        let provider = FallbackProvider::new(
            Arc::clone(&primary) as Arc<dyn LlmProvider>,
            Arc::clone(&fallback) as Arc<dyn LlmProvider>,
        );

        provider.generate_intent("hello").await.unwrap();
        provider.generate_intent("again").await.unwrap();
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 0);
        assert!(!provider.is_latched());
    }
}
