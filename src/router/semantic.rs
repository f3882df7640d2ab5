//! Semantic router: natural-language query → tool.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};

use lru::LruCache;
use serde_json::Value;

use crate::error::RouterError;
use crate::tools::{RegisteredTool, ToolRegistry};

use super::intent::Intent;
use super::provider::LlmProvider;

/// Routes queries by parsing an intent with the LLM provider and matching
/// it against the registry. Intents are cached by the literal query
/// string.
pub struct SemanticRouter {
    registry: Arc<ToolRegistry>,
    provider: Option<Arc<dyn LlmProvider>>,
    cache: StdMutex<LruCache<String, Intent>>,
}

impl SemanticRouter {
    pub fn new(
        registry: Arc<ToolRegistry>,
        provider: Option<Arc<dyn LlmProvider>>,
        cache_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).expect("capacity >= 1");
        Self {
            registry,
            provider,
            cache: StdMutex::new(LruCache::new(capacity)),
        }
    }

    /// Parse a query into an intent, consulting the cache first.
    pub async fn parse_intent(&self, query: &str) -> Result<Intent, RouterError> {
        {
            let mut cache = self.lock_cache();
            if let Some(intent) = cache.get(query) {
                return Ok(intent.clone());
            }
        }

        let provider = self.provider.as_ref().ok_or(RouterError::NoProvider)?;

        // LLM calls happen outside the cache lock.
        let tools_context = self.build_tools_context();
        let mut intent = provider
            .generate_intent_with_context(query, &tools_context)
            .await?;
        intent.raw_query = query.to_string();

        self.lock_cache().put(query.to_string(), intent.clone());
        Ok(intent)
    }

    /// Match an intent to a tool.
    ///
    /// Precedence: toolbox name vs. domain, toolbox tags vs. domain, tool
    /// name/description containing the domain, then registry search; each
    /// comparison is case-insensitive containment either way.
    pub fn match_tool(&self, intent: &Intent) -> Result<RegisteredTool, RouterError> {
        let domain = intent.domain.to_lowercase();

        if !domain.is_empty() {
            for toolbox in self.registry.list_toolboxes() {
                let name = toolbox.name.to_lowercase();
                if similar(&name, &domain)
                    && let Some(tool) = toolbox.tools.first()
                {
                    return Ok(RegisteredTool {
                        qualified_name: toolbox.qualified_name(tool),
                        toolbox: toolbox.name.clone(),
                        tool: tool.clone(),
                    });
                }
            }

            for toolbox in self.registry.list_toolboxes() {
                let tagged = toolbox.tags.iter().any(|t| similar(&t.to_lowercase(), &domain));
                if tagged && let Some(tool) = toolbox.tools.first() {
                    return Ok(RegisteredTool {
                        qualified_name: toolbox.qualified_name(tool),
                        toolbox: toolbox.name.clone(),
                        tool: tool.clone(),
                    });
                }
            }

            for registered in self.registry.list_all_tools() {
                if registered.tool.name.to_lowercase().contains(&domain)
                    || registered.tool.description.to_lowercase().contains(&domain)
                {
                    return Ok(registered);
                }
            }

            if let Some(hit) = self.registry.search(&domain, &[]).into_iter().next() {
                return Ok(hit);
            }
        }

        Err(RouterError::NoMatch(intent.raw_query.clone()))
    }

    /// Parse then match.
    pub async fn route(&self, query: &str) -> Result<(RegisteredTool, Intent), RouterError> {
        let intent = self.parse_intent(query).await?;
        let tool = self.match_tool(&intent)?;
        tracing::debug!(
            query = %query,
            tool = %tool.qualified_name,
            confidence = intent.confidence,
            "routed query"
        );
        Ok((tool, intent))
    }

    /// Extract arguments for a tool's schema from the query. Failures
    /// fold to an empty map; the caller treats arguments as optional.
    pub async fn extract_parameters(&self, query: &str, schema: &Value) -> HashMap<String, Value> {
        let Some(provider) = self.provider.as_ref() else {
            return HashMap::new();
        };
        match provider.extract_parameters(query, schema).await {
            Ok(map) => map,
            Err(e) => {
                tracing::debug!(error = %e, "parameter extraction failed");
                HashMap::new()
            }
        }
    }

    /// Enumerate toolboxes and their tools for the intent prompt.
    fn build_tools_context(&self) -> String {
        let mut context = String::new();
        for toolbox in self.registry.list_toolboxes() {
            context.push_str(&format!("- {}: {}\n", toolbox.name, toolbox.description));
            for tool in &toolbox.tools {
                context.push_str(&format!("  - {}: {}\n", tool.name, tool.description));
            }
        }
        context
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Intent>> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Case-insensitive "equals, contains, or is contained by".
fn similar(a: &str, b: &str) -> bool {
    a == b || a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::tools::{Tool, Toolbox, Toolkit};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    struct CountingProvider {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
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
            Ok(Intent {
                action: "get".to_string(),
                domain: "weather".to_string(),
                entity: "current".to_string(),
                filters: HashMap::from([("city".to_string(), "Berlin".to_string())]),
                confidence: 0.9,
                raw_query: query.to_string(),
            })
        }

        async fn extract_parameters(
            &self,
            _query: &str,
            _schema: &Value,
        ) -> Result<HashMap<String, Value>, LlmError> {
            Ok(HashMap::from([(
                "city".to_string(),
                Value::String("Berlin".to_string()),
            )]))
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn registry_with_weather() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new(None, None));
        registry
            .register(Toolkit {
                id: Uuid::nil(),
                name: "Weather".to_string(),
                description: String::new(),
                status: Default::default(),
                toolboxes: vec![Toolbox {
                    id: Uuid::nil(),
                    name: "weather".to_string(),
                    version: "1.0".to_string(),
                    description: "weather lookups".to_string(),
                    rating: None,
                    tags: BTreeSet::from(["forecast".to_string()]),
                    tools: vec![Tool {
                        id: Uuid::nil(),
                        name: "get_current".to_string(),
                        description: "current conditions".to_string(),
                        input_schema: serde_json::json!({"type": "object"}),
                        mcp_server: "http://u".to_string(),
                        timeout_secs: None,
                    }],
                }],
                registered_at: None,
                updated_at: None,
            })
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn cache_avoids_repeat_llm_calls() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
        });
        let router = SemanticRouter::new(
            registry_with_weather(),
            Some(Arc::clone(&provider) as Arc<dyn LlmProvider>),
            16,
        );

        router.parse_intent("weather in Berlin").await.unwrap();
        router.parse_intent("weather in Berlin").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        router.parse_intent("weather in Moscow").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_provider_fails_parse() {
        let router = SemanticRouter::new(registry_with_weather(), None, 16);
        let err = router.parse_intent("anything").await.unwrap_err();
        assert_eq!(err.to_string(), "LLM provider not configured");
    }

    #[tokio::test]
    async fn routes_by_toolbox_name() {
        let provider = Arc::new(CountingProvider {
            calls: AtomicU32::new(0),
        });
        let router = SemanticRouter::new(
            registry_with_weather(),
            Some(provider as Arc<dyn LlmProvider>),
            16,
        );

        let (tool, intent) = router.route("weather in Berlin").await.unwrap();
        assert_eq!(tool.qualified_name, "weather.get_current");
        assert_eq!(intent.filters["city"], "Berlin");
    }

    #[tokio::test]
    async fn unmatched_domain_is_an_error() {
        let router = SemanticRouter::new(registry_with_weather(), None, 16);
        let intent = Intent {
            action: "get".to_string(),
            domain: "astrology".to_string(),
            entity: String::new(),
            filters: HashMap::new(),
            confidence: 0.5,
            raw_query: "read my stars".to_string(),
        };
        let err = router.match_tool(&intent).unwrap_err();
        assert_eq!(err.to_string(), "no tool found for query 'read my stars'");
    }

    #[tokio::test]
    async fn matches_by_tag_when_name_misses() {
        let router = SemanticRouter::new(registry_with_weather(), None, 16);
        let intent = Intent {
            action: "get".to_string(),
            domain: "forecast".to_string(),
            entity: String::new(),
            filters: HashMap::new(),
            confidence: 0.5,
            raw_query: "forecast please".to_string(),
        };
        let tool = router.match_tool(&intent).unwrap();
        assert_eq!(tool.qualified_name, "weather.get_current");
    }
}
