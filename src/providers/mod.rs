//! Generation provider implementations.
//!
//! Each provider adapts one upstream API to the [`GenerationProvider`]
//! trait. Shared plumbing that is identical across providers (Retry-After
//! parsing, the schema instruction for providers without native structured
//! output) lives here.
//!
//! [`GenerationProvider`]: crate::traits::GenerationProvider

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value as JsonValue;
use std::time::Duration;

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use mock::MockProvider;
pub use openai::OpenAIProvider;

/// Parse a `Retry-After` header into a wait duration.
///
/// Only the delta-seconds form is recognized; the HTTP-date form is rare in
/// practice and callers fall back to computed backoff without a hint.
pub(crate) fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let seconds: u64 = value.trim().parse().ok()?;
    Some(Duration::from_secs(seconds))
}

/// Build the system text that asks a model without native structured output
/// to answer with schema-conforming JSON.
pub(crate) fn schema_instruction(system_prompt: Option<&str>, schema: &JsonValue) -> String {
    let instruction = format!(
        "Respond with a single JSON object that conforms to this JSON schema:\n{schema}\nDo not include any text outside the JSON object."
    );
    match system_prompt {
        Some(system) => format!("{system}\n\n{instruction}"),
        None => instruction,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), Some(Duration::from_secs(30)));
    }

    #[test]
    fn retry_after_ignores_http_date_form() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after_hint(&headers), None);
    }

    #[test]
    fn retry_after_absent_yields_none() {
        assert_eq!(retry_after_hint(&HeaderMap::new()), None);
    }

    #[test]
    fn schema_instruction_appends_to_system_prompt() {
        let text = schema_instruction(Some("be brief"), &json!({"type": "object"}));
        assert!(text.starts_with("be brief\n\n"));
        assert!(text.contains("{\"type\":\"object\"}"));
    }

    #[test]
    fn schema_instruction_stands_alone_without_system_prompt() {
        let text = schema_instruction(None, &json!({"type": "array"}));
        assert!(text.starts_with("Respond with a single JSON object"));
    }
}
