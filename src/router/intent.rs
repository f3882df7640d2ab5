//! Parsed natural-language intents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The structured reading of a natural-language request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// What the user wants done ("get", "list", "create", ...).
    #[serde(default)]
    pub action: String,
    /// Subject area used for toolbox matching ("weather", "github", ...).
    #[serde(default)]
    pub domain: String,
    /// The specific thing acted on ("current", "issues", ...).
    #[serde(default)]
    pub entity: String,
    /// Extracted key/value constraints ("city" → "Berlin").
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Model confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    /// The literal query this intent was parsed from.
    #[serde(default)]
    pub raw_query: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_deserialization() {
        // Models frequently omit fields; all are defaulted.
        let intent: Intent = serde_json::from_str(r#"{"action":"get","domain":"weather"}"#).unwrap();
        assert_eq!(intent.action, "get");
        assert_eq!(intent.domain, "weather");
        assert!(intent.entity.is_empty());
        assert!(intent.filters.is_empty());
    }
}
