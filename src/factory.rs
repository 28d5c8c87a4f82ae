//! Provider registry and construction.
//!
//! Providers are looked up by [`ProviderKind`] in a [`ProviderRegistry`] that
//! maps each kind to a constructor closure. The defaults cover the built-in
//! providers; applications can register replacements (or entirely new kinds
//! are added here first) without touching call sites, which only ever hold a
//! [`ProviderConfig`].
//!
//! # Environment Variables
//!
//! When a [`ProviderConfig`] carries no API key the constructor falls back to
//! the provider's `from_env()`:
//!
//! - OpenAI: `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `OPENAI_MODEL`
//! - Anthropic: `ANTHROPIC_API_KEY`, `ANTHROPIC_BASE_URL`, `ANTHROPIC_MODEL`
//! - Gemini: `GEMINI_API_KEY`, `GEMINI_BASE_URL`, `GEMINI_MODEL`

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AiError, Result};
use crate::providers::{AnthropicProvider, GeminiProvider, MockProvider, OpenAIProvider};
use crate::traits::GenerationProvider;

// ============================================================================
// Provider Kind
// ============================================================================

/// The set of known provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat-completions API.
    OpenAI,
    /// Anthropic Messages API.
    Anthropic,
    /// Google AI Gemini API.
    Gemini,
    /// In-memory mock for tests.
    Mock,
}

impl ProviderKind {
    /// Canonical lowercase tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Mock => "mock",
        }
    }

    /// Parse a provider tag, accepting common aliases.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai" | "gpt" => Some(Self::OpenAI),
            "anthropic" | "claude" => Some(Self::Anthropic),
            "gemini" | "google" => Some(Self::Gemini),
            "mock" => Some(Self::Mock),
            _ => None,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Provider Config
// ============================================================================

/// Declarative description of the provider a generation should run on.
///
/// A missing `api_key` means the constructor reads the provider's usual
/// environment variables instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Which backend to construct.
    pub provider: ProviderKind,

    /// Explicit API key. Overrides the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model override applied after construction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Relative preference among configured backends, for operator routing
    /// policies. The registry itself does not interpret it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl ProviderConfig {
    /// Config for a kind with no overrides.
    pub fn new(provider: ProviderKind) -> Self {
        Self {
            provider,
            api_key: None,
            model: None,
            priority: None,
        }
    }

    /// Set an explicit API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set a model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set a routing priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

type ProviderCtor = Arc<dyn Fn(&ProviderConfig) -> Result<Arc<dyn GenerationProvider>> + Send + Sync>;

/// Registry mapping provider kinds to constructors.
#[derive(Clone)]
pub struct ProviderRegistry {
    constructors: HashMap<ProviderKind, ProviderCtor>,
}

impl ProviderRegistry {
    /// An empty registry. Every [`create`](Self::create) call fails until
    /// kinds are registered.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with constructors for all built-in providers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register(ProviderKind::OpenAI, |config| {
            let provider = match &config.api_key {
                Some(key) => OpenAIProvider::new(key.clone()),
                None => OpenAIProvider::from_env()?,
            };
            let provider = match &config.model {
                Some(model) => provider.with_model(model.clone()),
                None => provider,
            };
            Ok(Arc::new(provider))
        });

        registry.register(ProviderKind::Anthropic, |config| {
            let provider = match &config.api_key {
                Some(key) => AnthropicProvider::new(key.clone()),
                None => AnthropicProvider::from_env()?,
            };
            let provider = match &config.model {
                Some(model) => provider.with_model(model.clone()),
                None => provider,
            };
            Ok(Arc::new(provider))
        });

        registry.register(ProviderKind::Gemini, |config| {
            let provider = match &config.api_key {
                Some(key) => GeminiProvider::new(key.clone()),
                None => GeminiProvider::from_env()?,
            };
            let provider = match &config.model {
                Some(model) => provider.with_model(model.clone()),
                None => provider,
            };
            Ok(Arc::new(provider))
        });

        registry.register(ProviderKind::Mock, |config| {
            let provider = match &config.model {
                Some(model) => MockProvider::new().with_model(model.clone()),
                None => MockProvider::new(),
            };
            Ok(Arc::new(provider))
        });

        registry
    }

    /// Register (or replace) the constructor for a kind.
    pub fn register<F>(&mut self, kind: ProviderKind, ctor: F)
    where
        F: Fn(&ProviderConfig) -> Result<Arc<dyn GenerationProvider>> + Send + Sync + 'static,
    {
        self.constructors.insert(kind, Arc::new(ctor));
    }

    /// Construct a provider for the given config.
    ///
    /// Fails with [`AiError::Config`] when the kind has no registered
    /// constructor or when the constructor itself cannot assemble the
    /// provider (missing credentials, for example).
    pub fn create(&self, config: &ProviderConfig) -> Result<Arc<dyn GenerationProvider>> {
        let ctor = self.constructors.get(&config.provider).ok_or_else(|| {
            AiError::Config(format!(
                "no provider registered for '{}'",
                config.provider
            ))
        })?;
        ctor(config)
    }

    /// The kinds this registry can construct, in tag order.
    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<ProviderKind> = self.constructors.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn from_str_accepts_aliases_case_insensitively() {
        assert_eq!(ProviderKind::from_str("openai"), Some(ProviderKind::OpenAI));
        assert_eq!(ProviderKind::from_str("GPT"), Some(ProviderKind::OpenAI));
        assert_eq!(
            ProviderKind::from_str("Claude"),
            Some(ProviderKind::Anthropic)
        );
        assert_eq!(ProviderKind::from_str("google"), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::from_str("mock"), Some(ProviderKind::Mock));
    }

    #[test]
    fn from_str_rejects_unknown_tags() {
        assert_eq!(ProviderKind::from_str("llama-farm"), None);
        assert_eq!(ProviderKind::from_str(""), None);
    }

    #[test]
    fn provider_kind_serde_uses_lowercase_tags() {
        let json = serde_json::to_string(&ProviderKind::Anthropic).unwrap();
        assert_eq!(json, "\"anthropic\"");
        let kind: ProviderKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(kind, ProviderKind::Gemini);
    }

    #[test]
    fn provider_config_deserializes_with_defaults() {
        let config: ProviderConfig = serde_json::from_str(r#"{"provider":"mock"}"#).unwrap();
        assert_eq!(config.provider, ProviderKind::Mock);
        assert!(config.api_key.is_none());
        assert!(config.model.is_none());
        assert!(config.priority.is_none());
    }

    #[test]
    fn provider_config_round_trips_priority() {
        let config = ProviderConfig::new(ProviderKind::Gemini).with_priority(2);
        let json = serde_json::to_string(&config).unwrap();
        let back: ProviderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, Some(2));
    }

    #[test]
    fn create_mock_provider() {
        let registry = ProviderRegistry::with_defaults();
        let provider = registry
            .create(&ProviderConfig::new(ProviderKind::Mock))
            .unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn create_applies_model_override() {
        let registry = ProviderRegistry::with_defaults();
        let config = ProviderConfig::new(ProviderKind::Mock).with_model("mock-large");
        let provider = registry.create(&config).unwrap();
        assert_eq!(provider.model(), "mock-large");
    }

    #[test]
    fn create_openai_with_explicit_key() {
        let registry = ProviderRegistry::with_defaults();
        let config = ProviderConfig::new(ProviderKind::OpenAI)
            .with_api_key("sk-test")
            .with_model("gpt-4o");
        let provider = registry.create(&config).unwrap();
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), "gpt-4o");
    }

    #[test]
    #[serial]
    fn create_openai_without_credentials_fails() {
        std::env::remove_var("OPENAI_API_KEY");
        let registry = ProviderRegistry::with_defaults();
        let result = registry.create(&ProviderConfig::new(ProviderKind::OpenAI));
        assert!(matches!(result, Err(AiError::Config(_))));
    }

    #[test]
    fn create_unregistered_kind_fails_with_config_error() {
        let registry = ProviderRegistry::new();
        let error = registry
            .create(&ProviderConfig::new(ProviderKind::Mock))
            .err()
            .unwrap();
        match error {
            AiError::Config(message) => assert!(message.contains("mock")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn register_replaces_existing_constructor() {
        let mut registry = ProviderRegistry::with_defaults();
        registry.register(ProviderKind::Mock, |_| {
            Ok(Arc::new(MockProvider::new().with_model("replacement")))
        });

        let provider = registry
            .create(&ProviderConfig::new(ProviderKind::Mock))
            .unwrap();
        assert_eq!(provider.model(), "replacement");
    }

    #[test]
    fn kinds_lists_registered_kinds_sorted() {
        let registry = ProviderRegistry::with_defaults();
        assert_eq!(
            registry.kinds(),
            vec![
                ProviderKind::Anthropic,
                ProviderKind::Gemini,
                ProviderKind::Mock,
                ProviderKind::OpenAI,
            ]
        );
    }
}
