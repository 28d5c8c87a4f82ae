//! Generation telemetry: what ran, how long it took, what it cost to run.
//!
//! Every orchestrated call produces exactly one outcome event (`generation`
//! on success, `error` on final failure) plus one `retry` event per failed
//! attempt in between. Cache probes, rate-limit denials and feedback
//! submissions emit their own kinds. Events flow through the [`EventSink`]
//! trait; the bundled [`MemoryEventSink`] keeps them in process for tests
//! and single-instance setups.
//!
//! Recording is fire-and-forget: [`TelemetryRecorder::record`] hands the
//! event to a detached task and returns immediately. A sink failure is
//! logged and dropped rather than surfaced to the caller.
//!
//! # Example
//!
//! ```ignore
//! use trendscope_ai::telemetry::{EventKind, MemoryEventSink, TelemetryEvent, TelemetryRecorder};
//! use std::sync::Arc;
//!
//! let recorder = TelemetryRecorder::new(Arc::new(MemoryEventSink::new()));
//! recorder.record(
//!     TelemetryEvent::new(EventKind::Generation)
//!         .with_provider("anthropic")
//!         .with_model("claude-3-5-sonnet-20241022")
//!         .with_use_case("ask")
//!         .with_latency_ms(840)
//!         .with_usage(412, 220),
//! );
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::Result;

// ============================================================================
// Event model
// ============================================================================

/// Classification of a telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A generation completed and was returned to the caller.
    Generation,
    /// A cached generation was served without calling a provider.
    CacheHit,
    /// The cache was consulted and had no usable entry.
    CacheMiss,
    /// A generation was produced but failed a quality gate.
    QualityFail,
    /// One failed attempt inside a retry loop.
    Retry,
    /// A secondary provider served the request after the primary failed.
    Fallback,
    /// A provider was skipped because its circuit is open.
    CircuitOpen,
    /// A request was denied by the rate limiter.
    RateLimited,
    /// A user submitted feedback on generated content.
    FeedbackReceived,
    /// A generation failed after all retries.
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Generation => "generation",
            EventKind::CacheHit => "cache_hit",
            EventKind::CacheMiss => "cache_miss",
            EventKind::QualityFail => "quality_fail",
            EventKind::Retry => "retry",
            EventKind::Fallback => "fallback",
            EventKind::CircuitOpen => "circuit_open",
            EventKind::RateLimited => "rate_limited",
            EventKind::FeedbackReceived => "feedback_received",
            EventKind::Error => "error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry record. All fields beyond `kind` and `timestamp` are
/// optional so each kind carries only what it knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Which dashboard feature triggered the call ("ask", "compare", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_case: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Free-form context: experiment arm, prompt version, cache key, ...
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,

    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Event of the given kind, stamped with the current time.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            provider: None,
            model: None,
            use_case: None,
            latency_ms: None,
            input_tokens: None,
            output_tokens: None,
            quality_score: None,
            error: None,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_use_case(mut self, use_case: impl Into<String>) -> Self {
        self.use_case = Some(use_case.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_usage(mut self, input_tokens: u32, output_tokens: u32) -> Self {
        self.input_tokens = Some(input_tokens);
        self.output_tokens = Some(output_tokens);
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Override the timestamp. Events default to creation time; summaries
    /// over historical ranges are tested through this.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

// ============================================================================
// Event sink
// ============================================================================

/// Append-only event storage.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one event.
    async fn append(&self, event: TelemetryEvent) -> Result<()>;

    /// All events with `timestamp >= cutoff`, oldest first.
    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<TelemetryEvent>>;
}

/// In-process sink backed by a `Vec`. Events are lost on restart.
#[derive(Default)]
pub struct MemoryEventSink {
    events: RwLock<Vec<TelemetryEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub async fn all(&self) -> Vec<TelemetryEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: TelemetryEvent) -> Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<TelemetryEvent>> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|event| event.timestamp >= cutoff)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Writes events to a sink without ever failing the caller.
#[derive(Clone)]
pub struct TelemetryRecorder {
    sink: Arc<dyn EventSink>,
}

impl TelemetryRecorder {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self { sink }
    }

    /// The underlying sink, shared with consumers that read events back
    /// (cost summaries, feedback analysis).
    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    /// Record an event on a detached task and return immediately.
    ///
    /// Requires a running Tokio runtime. Sink errors are logged at `warn`
    /// and dropped.
    pub fn record(&self, event: TelemetryEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let kind = event.kind;
            if let Err(error) = sink.append(event).await {
                warn!(kind = %kind, %error, "failed to record telemetry event");
            }
        });
    }

    /// Record an event and wait for the write to finish. Sink errors are
    /// still swallowed; use this where ordering matters more than latency.
    pub async fn record_now(&self, event: TelemetryEvent) {
        let kind = event.kind;
        if let Err(error) = self.sink.append(event).await {
            warn!(kind = %kind, %error, "failed to record telemetry event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiError;
    use chrono::TimeZone;
    use std::time::Duration;

    struct FailingSink;

    #[async_trait]
    impl EventSink for FailingSink {
        async fn append(&self, _event: TelemetryEvent) -> Result<()> {
            Err(AiError::Storage("disk full".into()))
        }

        async fn since(&self, _cutoff: DateTime<Utc>) -> Result<Vec<TelemetryEvent>> {
            Err(AiError::Storage("disk full".into()))
        }
    }

    #[test]
    fn test_builder_sets_fields() {
        let event = TelemetryEvent::new(EventKind::Generation)
            .with_provider("openai")
            .with_model("gpt-4o")
            .with_use_case("compare")
            .with_latency_ms(1200)
            .with_usage(300, 150)
            .with_quality_score(0.92)
            .with_metadata("experiment_arm", serde_json::json!("a"));

        assert_eq!(event.kind, EventKind::Generation);
        assert_eq!(event.provider.as_deref(), Some("openai"));
        assert_eq!(event.model.as_deref(), Some("gpt-4o"));
        assert_eq!(event.use_case.as_deref(), Some("compare"));
        assert_eq!(event.latency_ms, Some(1200));
        assert_eq!(event.input_tokens, Some(300));
        assert_eq!(event.output_tokens, Some(150));
        assert_eq!(event.quality_score, Some(0.92));
        assert_eq!(
            event.metadata.get("experiment_arm"),
            Some(&serde_json::json!("a"))
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&EventKind::Generation).unwrap(),
            "\"generation\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::RateLimited).unwrap(),
            "\"rate_limited\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::FeedbackReceived).unwrap(),
            "\"feedback_received\""
        );
        assert_eq!(
            serde_json::to_string(&EventKind::CircuitOpen).unwrap(),
            "\"circuit_open\""
        );
    }

    #[test]
    fn test_kind_as_str_matches_serde_name() {
        let kinds = [
            EventKind::Generation,
            EventKind::CacheHit,
            EventKind::CacheMiss,
            EventKind::QualityFail,
            EventKind::Retry,
            EventKind::Fallback,
            EventKind::CircuitOpen,
            EventKind::RateLimited,
            EventKind::FeedbackReceived,
            EventKind::Error,
        ];
        for kind in kinds {
            let serialized = serde_json::to_string(&kind).unwrap();
            assert_eq!(serialized, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_unset_fields_omitted_from_json() {
        let event = TelemetryEvent::new(EventKind::CacheHit).with_use_case("ask");
        let json = serde_json::to_value(&event).unwrap();
        let object = json.as_object().unwrap();

        assert!(object.contains_key("kind"));
        assert!(object.contains_key("use_case"));
        assert!(object.contains_key("timestamp"));
        assert!(!object.contains_key("provider"));
        assert!(!object.contains_key("latency_ms"));
        assert!(!object.contains_key("metadata"));
    }

    #[tokio::test]
    async fn test_memory_sink_appends_and_filters_by_time() {
        let sink = MemoryEventSink::new();
        let old = Utc.timestamp_opt(1_600_000_000, 0).single().unwrap();
        let cutoff = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let recent = Utc.timestamp_opt(1_700_000_100, 0).single().unwrap();

        sink.append(TelemetryEvent::new(EventKind::Generation).with_timestamp(old))
            .await
            .unwrap();
        sink.append(TelemetryEvent::new(EventKind::Error).with_timestamp(recent))
            .await
            .unwrap();

        let events = sink.since(cutoff).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Error);
        assert_eq!(sink.all().await.len(), 2);
    }

    #[tokio::test]
    async fn test_record_is_detached_but_lands() {
        let sink = Arc::new(MemoryEventSink::new());
        let recorder = TelemetryRecorder::new(sink.clone());

        recorder.record(TelemetryEvent::new(EventKind::CacheMiss));

        let mut landed = false;
        for _ in 0..50 {
            if !sink.all().await.is_empty() {
                landed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(landed, "detached write never reached the sink");
    }

    #[tokio::test]
    async fn test_record_now_awaits_write() {
        let sink = Arc::new(MemoryEventSink::new());
        let recorder = TelemetryRecorder::new(sink.clone());

        recorder
            .record_now(TelemetryEvent::new(EventKind::RateLimited).with_use_case("ask"))
            .await;

        let events = sink.all().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::RateLimited);
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let recorder = TelemetryRecorder::new(Arc::new(FailingSink));

        // Neither path may panic or surface the storage error.
        recorder.record_now(TelemetryEvent::new(EventKind::Error)).await;
        recorder.record(TelemetryEvent::new(EventKind::Generation));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[test]
    fn test_event_round_trips_through_json() {
        let event = TelemetryEvent::new(EventKind::Retry)
            .with_provider("gemini")
            .with_error("status 503")
            .with_metadata("attempt", serde_json::json!(2));

        let json = serde_json::to_string(&event).unwrap();
        let back: TelemetryEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, EventKind::Retry);
        assert_eq!(back.provider.as_deref(), Some("gemini"));
        assert_eq!(back.error.as_deref(), Some("status 503"));
        assert_eq!(back.metadata.get("attempt"), Some(&serde_json::json!(2)));
    }
}
