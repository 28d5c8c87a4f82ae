//! Provider abstraction for AI text generation.
//!
//! Every backend implements [`GenerationProvider`]: structured JSON
//! generation, plain-text generation, and streaming generation behind one
//! interface, so the orchestrator stays ignorant of which concrete backend
//! serves a request.
//!
//! # Key Types
//!
//! - [`GenerationProvider`]: the uniform backend trait
//! - [`GenerationRequest`] / [`GenerationOptions`]: what to generate
//! - [`Generation`] / [`StructuredGeneration`]: what came back
//!
//! # Example
//! ```ignore
//! use trendscope_ai::traits::{GenerationProvider, GenerationRequest};
//!
//! let request = GenerationRequest::new("Summarize the Rust language")
//!     .with_system_prompt("You are a concise technology analyst.")
//!     .with_temperature(0.3);
//! let generation = provider.generate(&request).await?;
//! println!("{}", generation.content);
//! ```

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{AiError, Result};

// ============================================================================
// Request Types
// ============================================================================

/// Optional per-request overrides. Unset fields fall back to
/// backend-defined defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Override the provider's configured model.
    pub model: Option<String>,

    /// Sampling temperature (typically 0.0 to 2.0).
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,

    /// System prompt prepended to the conversation.
    pub system_prompt: Option<String>,
}

impl GenerationOptions {
    /// Create empty options (all backend defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the model override.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the generation token cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// A single generation request. Passed by reference into a provider and
/// never mutated by it.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    /// The user-facing prompt text.
    pub prompt: String,

    /// JSON schema the structured output should conform to. Only consulted
    /// by [`GenerationProvider::generate_structured`].
    pub schema: Option<JsonValue>,

    /// Optional overrides.
    pub options: GenerationOptions,
}

impl GenerationRequest {
    /// Create a request with default options.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            schema: None,
            options: GenerationOptions::default(),
        }
    }

    /// Attach a response schema for structured generation.
    pub fn with_schema(mut self, schema: JsonValue) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Replace the options wholesale.
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the system prompt on the embedded options.
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(system_prompt.into());
        self
    }

    /// Set the temperature on the embedded options.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Set the max-token cap on the embedded options.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }

    /// The model this request should run on, given the provider's default.
    pub fn model_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.options.model.as_deref().unwrap_or(default)
    }
}

// ============================================================================
// Response Types
// ============================================================================

/// Result of a plain-text generation.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    /// Generated text.
    pub content: String,

    /// Model that produced the response (as reported by the backend when
    /// available, else the requested model).
    pub model: String,

    /// Input token count, when the backend reports usage.
    pub prompt_tokens: Option<u32>,

    /// Output token count, when the backend reports usage.
    pub completion_tokens: Option<u32>,

    /// Why generation stopped ("stop", "length", ...).
    pub finish_reason: Option<String>,

    /// Backend- or pipeline-specific extras (response ids, experiment arm).
    pub metadata: HashMap<String, JsonValue>,
}

impl Generation {
    /// Create a response with content and model.
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    /// Attach token usage.
    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.prompt_tokens = Some(prompt_tokens);
        self.completion_tokens = Some(completion_tokens);
        self
    }

    /// Attach a finish reason.
    pub fn with_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.finish_reason = Some(reason.into());
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Combined token count, when usage was reported.
    pub fn total_tokens(&self) -> Option<u32> {
        match (self.prompt_tokens, self.completion_tokens) {
            (Some(p), Some(c)) => Some(p + c),
            (Some(p), None) => Some(p),
            (None, Some(c)) => Some(c),
            (None, None) => None,
        }
    }
}

/// Result of a structured (schema-guided) generation: the parsed JSON value
/// plus the raw generation it was extracted from.
#[derive(Debug, Clone)]
pub struct StructuredGeneration {
    /// Parsed JSON output.
    pub value: JsonValue,

    /// The underlying generation (usage, model, finish reason).
    pub raw: Generation,
}

impl StructuredGeneration {
    /// Parse a generation's content into JSON, tolerating the markdown
    /// fences some models wrap around their output.
    pub fn from_generation(raw: Generation) -> Result<Self> {
        let value = extract_json(&raw.content)?;
        Ok(Self { value, raw })
    }
}

/// Parse model output as JSON.
///
/// Tries the content verbatim first, then the body of a ```json fenced
/// block, then the outermost `{...}` / `[...]` slice. Models frequently
/// decorate otherwise valid JSON with prose or fences.
pub fn extract_json(content: &str) -> Result<JsonValue> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        // Skip a language tag such as `json` on the fence line.
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        if let Some(end) = body.find("```") {
            if let Ok(value) = serde_json::from_str(body[..end].trim()) {
                return Ok(value);
            }
        }
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close)) {
            if start < end {
                if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                    return Ok(value);
                }
            }
        }
    }

    Err(AiError::InvalidInput(format!(
        "model output is not valid JSON: {}",
        truncate_for_log(trimmed, 120)
    )))
}

fn truncate_for_log(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Uniform interface over heterogeneous LLM backends.
///
/// Implementations perform the network call and nothing else: no caching,
/// no retries, no telemetry. Those concerns live upstream where they can be
/// applied uniformly.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Provider name for telemetry and cost breakdowns ("openai",
    /// "anthropic", "gemini", "mock").
    fn name(&self) -> &str;

    /// Default model when the request does not override it.
    fn model(&self) -> &str;

    /// Generate free-form text.
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation>;

    /// Generate a schema-guided JSON value. The request's `schema`, when
    /// present, constrains the output; the result is parsed and validated
    /// as JSON before returning.
    async fn generate_structured(
        &self,
        request: &GenerationRequest,
    ) -> Result<StructuredGeneration>;

    /// Generate a lazy, single-pass stream of text chunks. The stream is
    /// not restartable; it ends when the backend completes or yields an
    /// `Err` item.
    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_builder() {
        let options = GenerationOptions::new()
            .with_model("gpt-4o-mini")
            .with_temperature(0.2)
            .with_max_tokens(512)
            .with_system_prompt("Be terse.");

        assert_eq!(options.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.max_tokens, Some(512));
        assert_eq!(options.system_prompt.as_deref(), Some("Be terse."));
    }

    #[test]
    fn test_request_builder() {
        let request = GenerationRequest::new("Compare Rust and Go")
            .with_schema(json!({"type": "object"}))
            .with_temperature(0.7);

        assert_eq!(request.prompt, "Compare Rust and Go");
        assert!(request.schema.is_some());
        assert_eq!(request.options.temperature, Some(0.7));
    }

    #[test]
    fn test_model_or_prefers_override() {
        let request = GenerationRequest::new("x")
            .with_options(GenerationOptions::new().with_model("custom-model"));
        assert_eq!(request.model_or("default-model"), "custom-model");

        let plain = GenerationRequest::new("x");
        assert_eq!(plain.model_or("default-model"), "default-model");
    }

    #[test]
    fn test_generation_usage() {
        let generation = Generation::new("hello", "gpt-4o").with_usage(10, 5);
        assert_eq!(generation.prompt_tokens, Some(10));
        assert_eq!(generation.completion_tokens, Some(5));
        assert_eq!(generation.total_tokens(), Some(15));
    }

    #[test]
    fn test_generation_without_usage() {
        let generation = Generation::new("hello", "gpt-4o");
        assert_eq!(generation.total_tokens(), None);
    }

    #[test]
    fn test_generation_metadata() {
        let generation =
            Generation::new("hi", "m").with_metadata("response_id", json!("resp_123"));
        assert_eq!(generation.metadata["response_id"], json!("resp_123"));
    }

    #[test]
    fn test_extract_json_plain() {
        let value = extract_json(r#"{"score": 9, "summary": "solid"}"#).unwrap();
        assert_eq!(value["score"], 9);
    }

    #[test]
    fn test_extract_json_fenced() {
        let content = "Here you go:\n```json\n{\"score\": 7}\n```\nLet me know!";
        let value = extract_json(content).unwrap();
        assert_eq!(value["score"], 7);
    }

    #[test]
    fn test_extract_json_fence_without_language() {
        let content = "```\n[1, 2, 3]\n```";
        let value = extract_json(content).unwrap();
        assert_eq!(value, json!([1, 2, 3]));
    }

    #[test]
    fn test_extract_json_embedded_object() {
        let content = "The result is {\"ok\": true} as requested.";
        let value = extract_json(content).unwrap();
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        let err = extract_json("I could not produce JSON, sorry.").unwrap_err();
        assert!(matches!(err, AiError::InvalidInput(_)));
    }

    #[test]
    fn test_structured_from_generation() {
        let raw = Generation::new(r#"{"trend": "up"}"#, "gpt-4o").with_usage(20, 8);
        let structured = StructuredGeneration::from_generation(raw).unwrap();
        assert_eq!(structured.value["trend"], "up");
        assert_eq!(structured.raw.total_tokens(), Some(28));
    }
}
