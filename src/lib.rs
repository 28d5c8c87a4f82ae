//! TrendScope AI - Generation Orchestration for the Trend Dashboard
//!
//! This crate is the layer between the dashboard's HTTP handlers and the
//! LLM backends. It owns everything between "a user asked a question" and
//! "a model produced an answer we can bill, cache and learn from":
//!
//! - Provider abstraction (text, schema-constrained JSON, token streams)
//! - Per-endpoint rate limiting with shared counter stores
//! - Retries with exponential backoff and `Retry-After` awareness
//! - Response caching for repeated questions
//! - Versioned prompt management with A/B experiments
//! - Telemetry events and per-model cost tracking
//! - Reader feedback capture and summaries
//!
//! # Providers
//!
//! | Provider | Text | Structured JSON | Streaming | Notes |
//! |-----------|------|------------------|-----------|-------|
//! | OpenAI | ✓ | ✓ (JSON mode) | ✓ | Default production backend |
//! | Anthropic | ✓ | ✓ (prompted) | ✓ | Messages API |
//! | Gemini | ✓ | ✓ (native schema) | ✓ | Google AI |
//! | Mock | ✓ | ✓ | ✓ | Tests, no network |
//!
//! # Architecture
//!
//! [`Orchestrator`] runs every call through the same pipeline: rate-limit
//! check, prompt resolution (experiment arm or active version), cache
//! lookup, provider call under the retry policy, telemetry. Each stage is
//! usable on its own; the orchestrator only wires them together.
//!
//! # Example
//!
//! ```ignore
//! use trendscope_ai::{
//!     GenerationOutcome, GenerationTask, Orchestrator, ProviderConfig, ProviderKind,
//! };
//!
//! let orchestrator = Orchestrator::in_memory();
//! let task = GenerationTask::new(
//!     "ask",
//!     "Why did WebGPU adoption spike this quarter?",
//!     ProviderConfig::new(ProviderKind::OpenAI),
//! )
//! .with_identifier("203.0.113.7");
//!
//! match orchestrator.generate(&task).await? {
//!     GenerationOutcome::Completed(generation) => println!("{}", generation.content),
//!     GenerationOutcome::RateLimited(decision) => {
//!         eprintln!("limited until {:?}", decision.reset_at)
//!     }
//! }
//! ```
//!
//! # See Also
//!
//! - [`crate::traits`] for the provider contract
//! - [`crate::providers`] for concrete backends
//! - [`crate::orchestrator`] for the full pipeline
//! - [`crate::cost_tracker`] for spend reporting

pub mod cache;
pub mod config;
pub mod cost_tracker;
pub mod error;
pub mod experiments;
pub mod factory;
pub mod feedback;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod rate_limiter;
pub mod retry;
pub mod telemetry;
pub mod traits;

pub use cache::{CacheConfig, CacheKey, CacheStats, GenerationCache};
pub use config::{ConfigStore, MemoryConfigStore};
pub use cost_tracker::{
    format_cost, BudgetStatus, CostBudgets, CostSummary, CostTracker, ModelPricing,
};
pub use error::{AiError, Result};
pub use experiments::{ABTest, ArmAssignment, ArmStats, ExperimentArm, ExperimentManager};
pub use factory::{ProviderConfig, ProviderKind, ProviderRegistry};
pub use feedback::{
    FeedbackAnalyzer, FeedbackRecord, FeedbackStore, FeedbackSubmission, FeedbackSummary,
    MemoryFeedbackStore,
};
pub use orchestrator::{GenerationOutcome, GenerationTask, Orchestrator};
pub use prompts::{MemoryPromptStore, PromptManager, PromptStore, PromptVersion};
pub use providers::anthropic::AnthropicProvider;
pub use providers::gemini::GeminiProvider;
pub use providers::mock::MockProvider;
pub use providers::openai::OpenAIProvider;
pub use rate_limiter::{
    client_identifier, MemoryRateLimitStore, RateLimitDecision, RateLimitPolicy, RateLimitStore,
    RateLimiter,
};
pub use retry::{RetryExecutor, RetryNotice, RetryPolicy, DEFAULT_RETRYABLE_STATUSES};
pub use telemetry::{EventKind, EventSink, MemoryEventSink, TelemetryEvent, TelemetryRecorder};
pub use traits::{
    extract_json, Generation, GenerationOptions, GenerationProvider, GenerationRequest,
    StructuredGeneration,
};
