//! Google Gemini provider.
//!
//! Talks to the Google AI `generateContent` API with the key passed as a
//! query parameter. Unlike the other providers, Gemini supports structured
//! output natively: the response schema goes into `generationConfig` as
//! `responseSchema` together with a JSON MIME type, so no schema instruction
//! needs to be folded into the prompt.
//!
//! Streaming uses `streamGenerateContent` with `alt=sse`; without it the API
//! returns one large JSON array instead of SSE `data:` lines.
//!
//! # Environment Variables
//!
//! - `GEMINI_API_KEY`: API key (falls back to `GOOGLE_API_KEY`)
//! - `GEMINI_BASE_URL`: Override the API base URL (optional)
//! - `GEMINI_MODEL`: Override the default model (optional)

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

use crate::error::{AiError, Result};
use crate::traits::{Generation, GenerationProvider, GenerationRequest, StructuredGeneration};

use super::retry_after_hint;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Provider backed by the Google AI Gemini API.
#[derive(Clone)]
pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Option<Vec<Candidate>>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
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

impl GeminiProvider {
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
    /// Requires `GEMINI_API_KEY` (or `GOOGLE_API_KEY`). `GEMINI_BASE_URL`
    /// and `GEMINI_MODEL` override the defaults when set.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| AiError::Config("GEMINI_API_KEY environment variable not set".into()))?;

        let mut provider = Self::new(api_key);
        if let Ok(base_url) = std::env::var("GEMINI_BASE_URL") {
            provider = provider.with_base_url(base_url);
        }
        if let Ok(model) = std::env::var("GEMINI_MODEL") {
            provider = provider.with_model(model);
        }
        Ok(provider)
    }

    /// Set the default model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the API base URL (should include the `/v1beta` prefix).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_url(&self, model: &str, action: &str) -> String {
        format!(
            "{}/models/{}:{}?key={}",
            self.base_url.trim_end_matches('/'),
            model,
            action,
            self.api_key
        )
    }

    fn build_request(&self, request: &GenerationRequest, json_mode: bool) -> GenerateContentRequest {
        let system_instruction = request.options.system_prompt.as_ref().map(|text| Content {
            role: None,
            parts: vec![Part {
                text: Some(text.clone()),
            }],
        });

        let response_mime_type = json_mode.then(|| "application/json".to_string());
        let response_schema = if json_mode {
            request.schema.clone()
        } else {
            None
        };

        let generation_config = if request.options.temperature.is_some()
            || request.options.max_tokens.is_some()
            || response_mime_type.is_some()
        {
            Some(GenerationConfig {
                temperature: request.options.temperature,
                max_output_tokens: request.options.max_tokens,
                response_mime_type,
                response_schema,
            })
        } else {
            None
        };

        GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: Some(request.prompt.clone()),
                }],
            }],
            system_instruction,
            generation_config,
        }
    }

    async fn post(&self, url: &str, body: &GenerateContentRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
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

            let mut error = AiError::provider(status.as_u16(), "gemini", message);
            if let Some(hint) = retry_after {
                error = error.with_retry_after(hint);
            }
            return Err(error);
        }
        Ok(response)
    }

    fn parse_response(
        response: GenerateContentResponse,
        requested_model: &str,
    ) -> Result<Generation> {
        let candidate = response
            .candidates
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| AiError::provider(502, "gemini", "response contained no candidates"))?;

        let content: String = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect()
            })
            .unwrap_or_default();

        let model = response
            .model_version
            .unwrap_or_else(|| requested_model.to_string());

        let mut generation = Generation::new(content, model).with_finish_reason(
            candidate
                .finish_reason
                .unwrap_or_else(|| "STOP".to_string()),
        );
        if let Some(usage) = response.usage_metadata {
            generation = generation.with_usage(
                usage.prompt_token_count.unwrap_or(0),
                usage.candidates_token_count.unwrap_or(0),
            );
        }
        Ok(generation)
    }
}

#[async_trait]
impl GenerationProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        let model = request.model_or(&self.model).to_string();
        let body = self.build_request(request, false);
        debug!(model = %model, "sending generateContent request");
        let url = self.build_url(&model, "generateContent");
        let response = self
            .post(&url, &body)
            .await?
            .json::<GenerateContentResponse>()
            .await?;
        Self::parse_response(response, &model)
    }

    async fn generate_structured(
        &self,
        request: &GenerationRequest,
    ) -> Result<StructuredGeneration> {
        let model = request.model_or(&self.model).to_string();
        let body = self.build_request(request, true);
        debug!(model = %model, "sending structured generateContent request");
        let url = self.build_url(&model, "generateContent");
        let response = self
            .post(&url, &body)
            .await?
            .json::<GenerateContentResponse>()
            .await?;
        let generation = Self::parse_response(response, &model)?;
        StructuredGeneration::from_generation(generation)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let model = request.model_or(&self.model).to_string();
        let body = self.build_request(request, false);
        let url = format!(
            "{}&alt=sse",
            self.build_url(&model, "streamGenerateContent")
        );

        let response = self.post(&url, &body).await?;

        // Each SSE `data:` line carries a complete GenerateContentResponse.
        let stream = response.bytes_stream().map(|chunk| {
            let chunk = chunk.map_err(|e| AiError::Network(e.to_string()))?;
            let text = String::from_utf8_lossy(&chunk);

            let mut collected = String::new();
            for line in text.lines() {
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                let Ok(piece) = serde_json::from_str::<GenerateContentResponse>(data) else {
                    continue;
                };
                let Some(candidate) = piece.candidates.unwrap_or_default().into_iter().next()
                else {
                    continue;
                };
                if let Some(content) = candidate.content {
                    collected.extend(content.parts.into_iter().filter_map(|part| part.text));
                }
            }
            Ok(collected)
        });

        Ok(stream.boxed())
    }
}

// ============================================================================
// Tests
// ============================================================================
