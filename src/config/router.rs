//! Semantic router and LLM provider configuration.

use secrecy::SecretString;

use crate::config::helpers::{optional_env, parse_optional_env};
use crate::error::ConfigError;

/// Which remote call shape a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmApiKind {
    /// OpenAI-compatible `/v1/chat/completions` with system + user messages.
    #[default]
    ChatCompletion,
    /// Single-prompt `/api/generate` endpoint.
    Generate,
}

impl std::str::FromStr for LlmApiKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "chat" | "chat_completion" | "openai" => Ok(Self::ChatCompletion),
            "generate" => Ok(Self::Generate),
            _ => Err(format!("invalid LLM api kind '{s}', expected 'chat' or 'generate'")),
        }
    }
}

/// Connection settings for one remote LLM provider.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    pub kind: LlmApiKind,
}

/// Router settings: a primary provider, an optional fallback, and the
/// intent cache bound.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary: Option<LlmProviderConfig>,
    pub fallback: Option<LlmProviderConfig>,
    pub cache_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: None,
            fallback: None,
            cache_capacity: 1024,
        }
    }
}

impl RouterConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let primary = resolve_provider("TOOLGATE_LLM")?;
        let fallback = resolve_provider("TOOLGATE_LLM_FALLBACK")?;
        let cache_capacity =
            parse_optional_env("TOOLGATE_ROUTER_CACHE_CAPACITY", Self::default().cache_capacity)?;

        Ok(Self {
            primary,
            fallback,
            cache_capacity,
        })
    }
}

/// Resolve one provider from `<prefix>_URL`, `<prefix>_MODEL`,
/// `<prefix>_API_KEY`, `<prefix>_KIND`. Absent URL means no provider.
fn resolve_provider(prefix: &str) -> Result<Option<LlmProviderConfig>, ConfigError> {
    let Some(base_url) = optional_env(&format!("{prefix}_URL"))? else {
        return Ok(None);
    };

    let model = optional_env(&format!("{prefix}_MODEL"))?.ok_or_else(|| {
        ConfigError::MissingRequired {
            key: format!("{prefix}_MODEL"),
            hint: format!("{prefix}_URL is set, so a model name is required"),
        }
    })?;

    let api_key = optional_env(&format!("{prefix}_API_KEY"))?.map(SecretString::from);

    let kind: LlmApiKind = match optional_env(&format!("{prefix}_KIND"))? {
        Some(raw) => raw.parse().map_err(|e: String| ConfigError::InvalidValue {
            key: format!("{prefix}_KIND"),
            message: e,
        })?,
        None => LlmApiKind::default(),
    };

    Ok(Some(LlmProviderConfig {
        base_url,
        model,
        api_key,
        kind,
    }))
}
