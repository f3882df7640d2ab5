//! Semantic routing: natural-language queries to tools via an LLM
//! provider chain.

mod intent;
mod provider;
mod semantic;

pub use intent::Intent;
pub use provider::{
    extract_json_object, ChatCompletionProvider, FallbackProvider, GenerateProvider, LlmProvider,
};
pub use semantic::SemanticRouter;

use std::sync::Arc;

use crate::config::{LlmApiKind, LlmProviderConfig, RouterConfig};
use crate::error::LlmError;

/// Build the provider chain from configuration: primary alone, or primary
/// with a latched fallback. No configured primary yields `None` (queries
/// then fail with "LLM provider not configured").
pub fn build_provider(config: &RouterConfig) -> Result<Option<Arc<dyn LlmProvider>>, LlmError> {
    let Some(primary_config) = &config.primary else {
        return Ok(None);
    };
    let primary = instantiate(primary_config)?;

    let provider: Arc<dyn LlmProvider> = match &config.fallback {
        Some(fallback_config) => {
            let fallback = instantiate(fallback_config)?;
            Arc::new(FallbackProvider::new(primary, fallback))
        }
        None => primary,
    };
    Ok(Some(provider))
}

fn instantiate(config: &LlmProviderConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    Ok(match config.kind {
        LlmApiKind::ChatCompletion => Arc::new(ChatCompletionProvider::new(config.clone())?),
        LlmApiKind::Generate => Arc::new(GenerateProvider::new(config.clone())?),
    })
}
