//! Anthropic (Claude) provider.
//!
//! Talks to the Messages API at `POST {base}/v1/messages` with `x-api-key`
//! and `anthropic-version` headers. The system prompt travels in a dedicated
//! top-level field rather than the message list, and `max_tokens` is
//! mandatory. There is no native JSON mode, so structured output relies on a
//! schema instruction plus tolerant extraction of the returned JSON.
//!
//! # Environment Variables
//!
//! - `ANTHROPIC_API_KEY`: API key (falls back to `ANTHROPIC_AUTH_TOKEN`)
//! - `ANTHROPIC_BASE_URL`: Override the API base URL (optional)
//! - `ANTHROPIC_MODEL`: Override the default model (optional)

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{AiError, Result};
use crate::traits::{Generation, GenerationProvider, GenerationRequest, StructuredGeneration};

use super::{retry_after_hint, schema_instruction};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-3-5-sonnet-20241022";
const API_VERSION: &str = "2023-06-01";

/// The Messages API rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider backed by the Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    api_version: String,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// SSE events emitted by the streaming Messages API. Unknown event types
/// fail to parse and are skipped.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart,
    #[serde(rename = "content_block_start")]
    ContentBlockStart,
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaBlock },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop,
    #[serde(rename = "message_delta")]
    MessageDelta,
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    Error { error: ErrorDetail },
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
}

// ============================================================================
// Provider Implementation
// ============================================================================

impl AnthropicProvider {
    /// Create a provider with the default base URL and model.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_version: API_VERSION.to_string(),
        }
    }

    /// Create a provider from environment variables.
    ///
    /// Requires `ANTHROPIC_API_KEY` (or `ANTHROPIC_AUTH_TOKEN`).
    /// `ANTHROPIC_BASE_URL` and `ANTHROPIC_MODEL` override the defaults.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .or_else(|_| std::env::var("ANTHROPIC_AUTH_TOKEN"))
            .map_err(|_| {
                AiError::Config("ANTHROPIC_API_KEY environment variable not set".into())
            })?;

        let mut provider = Self::new(api_key);
        if let Ok(base_url) = std::env::var("ANTHROPIC_BASE_URL") {
            provider = provider.with_base_url(base_url);
        }
        if let Ok(model) = std::env::var("ANTHROPIC_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the API base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Set the `anthropic-version` header value.
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    fn build_request(&self, request: &GenerationRequest, json_mode: bool) -> MessagesRequest {
        let system = if json_mode {
            request
                .schema
                .as_ref()
                .map(|schema| schema_instruction(request.options.system_prompt.as_deref(), schema))
                .or_else(|| request.options.system_prompt.clone())
        } else {
            request.options.system_prompt.clone()
        };

        MessagesRequest {
            model: request.model_or(&self.model).to_string(),
            max_tokens: request.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            system,
            temperature: request.options.temperature,
            stream: None,
        }
    }

    async fn post(&self, body: &MessagesRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
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

            let mut error = AiError::provider(status.as_u16(), "anthropic", message);
            if let Some(hint) = retry_after {
                error = error.with_retry_after(hint);
            }
            return Err(error);
        }
        Ok(response)
    }

    fn parse_response(response: MessagesResponse, requested_model: &str) -> Result<Generation> {
        let content: String = response
            .content
            .iter()
            .filter(|block| block.block_type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let model = response
            .model
            .unwrap_or_else(|| requested_model.to_string());

        let mut generation = Generation::new(content, model).with_finish_reason(
            response
                .stop_reason
                .unwrap_or_else(|| "end_turn".to_string()),
        );
        if let Some(usage) = response.usage {
            generation = generation.with_usage(
                usage.input_tokens.unwrap_or(0),
                usage.output_tokens.unwrap_or(0),
            );
        }
        Ok(generation)
    }
}

#[async_trait]
impl GenerationProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let body = self.build_request(request, false);
        debug!(model = %body.model, "sending messages request");
        let response = self.post(&body).await?.json::<MessagesResponse>().await?;
        Self::parse_response(response, &body.model)
    }

    async fn generate_structured(
        &self,
        request: &GenerationRequest,
    ) -> Result<StructuredGeneration> {
        let body = self.build_request(request, true);
        debug!(model = %body.model, "sending structured messages request");
        let response = self.post(&body).await?.json::<MessagesResponse>().await?;
        let generation = Self::parse_response(response, &body.model)?;
        StructuredGeneration::from_generation(generation)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let mut body = self.build_request(request, false);
        body.stream = Some(true);

        let response = self.post(&body).await?;

        let stream = response
            .bytes_stream()
            .map(|chunk| {
                let chunk = chunk.map_err(|e| AiError::Network(e.to_string()))?;
                let text = String::from_utf8_lossy(&chunk);

                let mut collected = String::new();
                for line in text.lines() {
                    let Some(data) = line.strip_prefix("data: ") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data) else {
                        continue;
                    };
                    match event {
                        StreamEvent::ContentBlockDelta { delta } => {
                            if delta.delta_type == "text_delta" {
                                if let Some(text) = delta.text {
                                    collected.push_str(&text);
                                }
                            }
                        }
                        StreamEvent::Error { error } => {
                            return Err(AiError::provider(500, "anthropic", error.message));
                        }
                        _ => {}
                    }
                }
                Ok(collected)
            })
            .filter(|item| {
                let keep = match item {
                    Ok(text) => !text.is_empty(),
                    Err(_) => true,
                };
                futures::future::ready(keep)
            });

        Ok(stream.boxed())
    }
}

// ============================================================================
// Tests
// ============================================================================
