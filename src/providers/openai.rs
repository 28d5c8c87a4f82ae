//! OpenAI chat-completions provider.
//!
//! Talks to `POST {base}/chat/completions` with bearer-token auth. Structured
//! output uses `response_format: {"type": "json_object"}` plus a schema
//! instruction folded into the system prompt. Streaming uses SSE via
//! `reqwest-eventsource` and terminates on the `[DONE]` sentinel.
//!
//! # Environment Variables
//!
//! - `OPENAI_API_KEY`: API key (required by [`OpenAIProvider::from_env`])
//! - `OPENAI_BASE_URL`: Override the API base URL (optional)
//! - `OPENAI_MODEL`: Override the default model (optional)

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{AiError, Result};
use crate::traits::{Generation, GenerationProvider, GenerationRequest, StructuredGeneration};

use super::{retry_after_hint, schema_instruction};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider backed by the OpenAI chat-completions API.
#[derive(Clone)]
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

// ============================================================================
// Provider Implementation
// ============================================================================

impl OpenAIProvider {
    /// Create a provider with the default base URL and model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a provider from environment variables.
    ///
    /// Requires `OPENAI_API_KEY`. `OPENAI_BASE_URL` and `OPENAI_MODEL`
    /// override the defaults when set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AiError::Config("OPENAI_API_KEY environment variable not set".into()))?;

        let mut provider = Self::new(api_key);
        if let Ok(base_url) = std::env::var("OPENAI_BASE_URL") {
            provider = provider.with_base_url(base_url);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the API base URL (should include the `/v1` prefix).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &GenerationRequest, json_mode: bool) -> ChatRequest {
        let mut messages = Vec::new();

        let system = if json_mode {
            request
                .schema
                .as_ref()
                .map(|schema| schema_instruction(request.options.system_prompt.as_deref(), schema))
                .or_else(|| request.options.system_prompt.clone())
        } else {
            request.options.system_prompt.clone()
        };

        if let Some(system) = system {
            messages.push(WireMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.push(WireMessage {
            role: "user".to_string(),
            content: request.prompt.clone(),
        });

        ChatRequest {
            model: request.model_or(&self.model).to_string(),
            messages,
            temperature: request.options.temperature,
            max_tokens: request.options.max_tokens,
            stream: None,
            response_format: json_mode.then(|| ResponseFormat {
                format_type: "json_object".to_string(),
            }),
        }
    }

    async fn send(&self, body: &ChatRequest) -> Result<ChatResponse> {
        let response = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after_hint(response.headers());
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error.message)
                .unwrap_or(text);

            let mut error = AiError::provider(status.as_u16(), "openai", message);
            if let Some(hint) = retry_after {
                error = error.with_retry_after(hint);
            }
            return Err(error);
        }

        Ok(response.json::<ChatResponse>().await?)
    }

    fn parse_response(response: ChatResponse, requested_model: &str) -> Result<Generation> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiError::provider(502, "openai", "response contained no choices"))?;

        let content = choice.message.content.unwrap_or_default();
        let model = response
            .model
            .unwrap_or_else(|| requested_model.to_string());

        let mut generation = Generation::new(content, model)
            .with_finish_reason(choice.finish_reason.unwrap_or_else(|| "stop".to_string()));
        if let Some(usage) = response.usage {
            generation = generation.with_usage(
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
            );
        }
        Ok(generation)
    }
}

#[async_trait]
impl GenerationProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let body = self.build_request(request, false);
        debug!(model = %body.model, "sending chat completion request");
        let response = self.send(&body).await?;
        Self::parse_response(response, &body.model)
    }

    async fn generate_structured(
        &self,
        request: &GenerationRequest,
    ) -> Result<StructuredGeneration> {
        let body = self.build_request(request, true);
        debug!(model = %body.model, "sending structured chat completion request");
        let response = self.send(&body).await?;
        let generation = Self::parse_response(response, &body.model)?;
        StructuredGeneration::from_generation(generation)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut body = self.build_request(request, false);
        body.stream = Some(true);

        let builder = self
            .client
            .post(self.chat_url())
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body);

        let event_source = EventSource::new(builder)
            .map_err(|e| AiError::Network(format!("failed to open event stream: {e}")))?;

        let stream = stream::unfold(event_source, |mut es| async move {
            match es.next().await {
                Some(Ok(Event::Open)) => Some((Ok(String::new()), es)),
                Some(Ok(Event::Message(message))) => {
                    if message.data == "[DONE]" {
                        es.close();
                        return None;
                    }
                    match serde_json::from_str::<StreamChunk>(&message.data) {
                        Ok(chunk) => {
                            let content = chunk
                                .choices
                                .first()
                                .and_then(|choice| choice.delta.content.clone())
                                .unwrap_or_default();
                            Some((Ok(content), es))
                        }
                        Err(e) => Some((Err(AiError::from(e)), es)),
                    }
                }
                Some(Err(e)) => {
                    es.close();
                    Some((Err(AiError::Network(format!("stream error: {e}"))), es))
                }
                None => None,
            }
        });

        Ok(stream.boxed())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    #[test]
    fn new_uses_defaults() {
        let provider = OpenAIProvider::new("test-key");
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.model(), DEFAULT_MODEL);
        assert_eq!(
            provider.chat_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn builders_override_model_and_base_url() {
        let provider = OpenAIProvider::new("test-key")
            .with_model("gpt-4o")
            .with_base_url("https://proxy.example.com/v1");
        assert_eq!(provider.model(), "gpt-4o");
        assert_eq!(
            provider.chat_url(),
            "https://proxy.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn chat_url_trims_trailing_slash() {
        let provider = OpenAIProvider::new("k").with_base_url("https://proxy.example.com/v1/");
        assert_eq!(
            provider.chat_url(),
            "https://proxy.example.com/v1/chat/completions"
        );
    }

    #[test]
    #[serial]
    fn from_env_requires_api_key() {
        std::env::remove_var("OPENAI_API_KEY");
        let result = OpenAIProvider::from_env();
        assert!(matches!(result, Err(AiError::Config(_))));
    }

    #[test]
    #[serial]
    fn from_env_applies_overrides() {
        std::env::set_var("OPENAI_API_KEY", "env-key");
        std::env::set_var("OPENAI_BASE_URL", "https://alt.example.com/v1");
        std::env::set_var("OPENAI_MODEL", "gpt-4o");

        let provider = OpenAIProvider::from_env().unwrap();
        assert_eq!(provider.model(), "gpt-4o");
        assert_eq!(
            provider.chat_url(),
            "https://alt.example.com/v1/chat/completions"
        );

        std::env::remove_var("OPENAI_API_KEY");
        std::env::remove_var("OPENAI_BASE_URL");
        std::env::remove_var("OPENAI_MODEL");
    }

    #[test]
    fn build_request_minimal() {
        let provider = OpenAIProvider::new("k");
        let request = GenerationRequest::new("hello");
        let body = provider.build_request(&request, false);

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["model"], DEFAULT_MODEL);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hello");
        assert!(value.get("temperature").is_none());
        assert!(value.get("max_tokens").is_none());
        assert!(value.get("stream").is_none());
        assert!(value.get("response_format").is_none());
    }

    #[test]
    fn build_request_with_options() {
        let provider = OpenAIProvider::new("k");
        let request = GenerationRequest::new("hello")
            .with_system_prompt("be brief")
            .with_temperature(0.2)
            .with_max_tokens(256);
        let body = provider.build_request(&request, false);

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][0]["content"], "be brief");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["max_tokens"], 256);
        let temperature = value["temperature"].as_f64().unwrap();
        assert!((temperature - 0.2).abs() < 1e-6);
    }

    #[test]
    fn build_request_json_mode_adds_schema_instruction() {
        let provider = OpenAIProvider::new("k");
        let request = GenerationRequest::new("summarize")
            .with_system_prompt("be brief")
            .with_schema(json!({"type": "object"}));
        let body = provider.build_request(&request, true);

        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["response_format"]["type"], "json_object");
        let system = value["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("be brief"));
        assert!(system.contains("\"type\":\"object\""));
    }

    #[test]
    fn build_request_honors_model_override() {
        let provider = OpenAIProvider::new("k");
        let request = GenerationRequest::new("hello")
            .with_options(crate::traits::GenerationOptions::new().with_model("gpt-4o"));
        let body = provider.build_request(&request, false);
        assert_eq!(body.model, "gpt-4o");
    }

    #[test]
    fn parse_response_extracts_content_and_usage() {
        let response = ChatResponse {
            choices: vec![Choice {
                message: ResponseMessage {
                    content: Some("hi there".to_string()),
                },
                finish_reason: Some("stop".to_string()),
            }],
            model: Some("gpt-4o-mini-2024".to_string()),
            usage: Some(Usage {
                prompt_tokens: Some(12),
                completion_tokens: Some(3),
            }),
        };

        let generation = OpenAIProvider::parse_response(response, "gpt-4o-mini").unwrap();
        assert_eq!(generation.content, "hi there");
        assert_eq!(generation.model, "gpt-4o-mini-2024");
        assert_eq!(generation.prompt_tokens, Some(12));
        assert_eq!(generation.completion_tokens, Some(3));
        assert_eq!(generation.total_tokens(), Some(15));
        assert_eq!(generation.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_response_defaults_missing_fields() {
        let response = ChatResponse {
            choices: vec![Choice {
                message: ResponseMessage { content: None },
                finish_reason: None,
            }],
            model: None,
            usage: None,
        };

        let generation = OpenAIProvider::parse_response(response, "gpt-4o-mini").unwrap();
        assert_eq!(generation.content, "");
        assert_eq!(generation.model, "gpt-4o-mini");
        assert_eq!(generation.prompt_tokens, None);
        assert_eq!(generation.total_tokens(), None);
        assert_eq!(generation.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn parse_response_rejects_empty_choices() {
        let response = ChatResponse {
            choices: vec![],
            model: None,
            usage: None,
        };

        let error = OpenAIProvider::parse_response(response, "gpt-4o-mini").unwrap_err();
        assert_eq!(error.status(), Some(502));
    }

    #[test]
    fn stream_chunk_parses_delta_content() {
        let data = r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));
    }

    #[test]
    fn error_body_extracts_message() {
        let text = r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#;
        let body: ErrorBody = serde_json::from_str(text).unwrap();
        assert_eq!(body.error.message, "Rate limit reached");
    }
}
