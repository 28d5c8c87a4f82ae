//! End-to-end generation pipeline.
//!
//! The [`Orchestrator`] owns one instance of every subsystem and runs each
//! generation through the same sequence:
//!
//! ```text
//!   rate limit ──> prompt resolution ──> cache ──> provider + retry
//!        │         (A/B assignment or        │            │
//!        │          active version)          │            │
//!        └────────────────┬──────────────────┴────────────┘
//!                         ▼
//!                     telemetry
//! ```
//!
//! A denied rate-limit check is an outcome, not an error: callers get
//! [`GenerationOutcome::RateLimited`] with the window metadata they need for
//! response headers. Every call that reaches a provider ends in exactly one
//! outcome event (`generation` or `error`), plus one `retry` event per
//! failed attempt that was retried.

use futures::stream::BoxStream;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheConfig, CacheKey, GenerationCache};
use crate::config::MemoryConfigStore;
use crate::error::{AiError, Result};
use crate::experiments::{ExperimentArm, ExperimentManager};
use crate::factory::{ProviderConfig, ProviderRegistry};
use crate::feedback::{FeedbackAnalyzer, FeedbackRecord, FeedbackSubmission, MemoryFeedbackStore};
use crate::prompts::{MemoryPromptStore, PromptManager};
use crate::rate_limiter::{MemoryRateLimitStore, RateLimitDecision, RateLimiter};
use crate::retry::{RetryExecutor, RetryNotice, RetryPolicy};
use crate::telemetry::{EventKind, MemoryEventSink, TelemetryEvent, TelemetryRecorder};
use crate::traits::{
    Generation, GenerationOptions, GenerationProvider, GenerationRequest, StructuredGeneration,
};

// ============================================================================
// Task and Outcome
// ============================================================================

/// One generation to run: what to generate, for whom, and on which backend.
#[derive(Debug, Clone)]
pub struct GenerationTask {
    /// Logical endpoint, used for rate limiting, caching and telemetry
    /// (`ask`, `compare`, `insights`, ...).
    pub use_case: String,

    /// Rate-limit identity of the caller, usually derived from request
    /// headers via [`client_identifier`](crate::rate_limiter::client_identifier).
    pub identifier: String,

    /// Session used for experiment bucketing. Falls back to `identifier`.
    pub session_id: Option<String>,

    /// Managed prompt to resolve into the system prompt. When unset, the
    /// system prompt in `options` is used as-is.
    pub prompt_key: Option<String>,

    /// The user-facing input text.
    pub input: String,

    /// Which provider to construct for this call.
    pub provider: ProviderConfig,

    /// Sampling and model overrides.
    pub options: GenerationOptions,

    /// Response schema for structured generation.
    pub schema: Option<serde_json::Value>,

    /// Whether this call may consult and populate the cache.
    pub use_cache: bool,
}

impl GenerationTask {
    /// Create a task with default options and an `unknown` identifier.
    pub fn new(
        use_case: impl Into<String>,
        input: impl Into<String>,
        provider: ProviderConfig,
    ) -> Self {
        Self {
            use_case: use_case.into(),
            identifier: "unknown".to_string(),
            session_id: None,
            prompt_key: None,
            input: input.into(),
            provider,
            options: GenerationOptions::default(),
            schema: None,
            use_cache: true,
        }
    }

    /// Set the rate-limit identity.
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// Set the session used for experiment bucketing.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Resolve the system prompt from a managed prompt key.
    pub fn with_prompt_key(mut self, prompt_key: impl Into<String>) -> Self {
        self.prompt_key = Some(prompt_key.into());
        self
    }

    /// Replace the options wholesale.
    pub fn with_options(mut self, options: GenerationOptions) -> Self {
        self.options = options;
        self
    }

    /// Attach a response schema for structured generation.
    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Enable or disable cache participation for this call.
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }
}

/// How a generation call ended.
#[derive(Debug)]
pub enum GenerationOutcome<T> {
    /// The call ran and produced a value.
    Completed(T),
    /// A rate-limit window rejected the call before it reached a provider.
    RateLimited(RateLimitDecision),
}

impl<T> GenerationOutcome<T> {
    /// The produced value, if the call completed.
    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::RateLimited(_) => None,
        }
    }

    /// Whether the call was rejected by a rate limit.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// The denial metadata, if the call was rate limited.
    pub fn rate_limit(&self) -> Option<&RateLimitDecision> {
        match self {
            Self::Completed(_) => None,
            Self::RateLimited(decision) => Some(decision),
        }
    }
}

/// A task after prompt resolution and provider construction.
struct Prepared {
    request: GenerationRequest,
    provider: Arc<dyn GenerationProvider>,
    arm: Option<ExperimentArm>,
    prompt_version: Option<u32>,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Coordinates rate limiting, prompt management, caching, retries and
/// telemetry around provider calls.
pub struct Orchestrator {
    registry: ProviderRegistry,
    limiter: RateLimiter,
    telemetry: TelemetryRecorder,
    prompts: PromptManager,
    experiments: ExperimentManager,
    feedback: FeedbackAnalyzer,
    cache: Option<Arc<GenerationCache>>,
    retry_policy: RetryPolicy,
    executor: RetryExecutor,
}

impl Orchestrator {
    /// Assemble an orchestrator from explicit subsystems. Caching is off
    /// until [`with_generation_cache`](Self::with_generation_cache) adds it.
    pub fn new(
        registry: ProviderRegistry,
        limiter: RateLimiter,
        telemetry: TelemetryRecorder,
        prompts: PromptManager,
        experiments: ExperimentManager,
        feedback: FeedbackAnalyzer,
    ) -> Self {
        Self {
            registry,
            limiter,
            telemetry,
            prompts,
            experiments,
            feedback,
            cache: None,
            retry_policy: RetryPolicy::default(),
            executor: RetryExecutor::new(),
        }
    }

    /// Orchestrator over in-process stores, with the default provider
    /// registry and rate-limit budgets. Suitable for tests and single-node
    /// deployments; nothing survives a restart.
    pub fn in_memory() -> Self {
        let prompts = PromptManager::new(Arc::new(MemoryPromptStore::new()));
        Self::new(
            ProviderRegistry::with_defaults(),
            RateLimiter::with_defaults(Arc::new(MemoryRateLimitStore::new())),
            TelemetryRecorder::new(Arc::new(MemoryEventSink::new())),
            prompts.clone(),
            ExperimentManager::new(Arc::new(MemoryConfigStore::new()), prompts),
            FeedbackAnalyzer::new(Arc::new(MemoryFeedbackStore::new())),
        )
    }

    /// Replace the provider registry.
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the rate limiter.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Enable response caching for non-streaming calls.
    pub fn with_generation_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(Arc::new(GenerationCache::new(config)));
        self
    }

    /// Replace the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// The prompt manager, for version and activation operations.
    pub fn prompts(&self) -> &PromptManager {
        &self.prompts
    }

    /// The experiment manager, for creating and inspecting A/B tests.
    pub fn experiments(&self) -> &ExperimentManager {
        &self.experiments
    }

    /// The feedback analyzer, for summaries.
    pub fn feedback(&self) -> &FeedbackAnalyzer {
        &self.feedback
    }

    /// The telemetry recorder. Its sink also feeds
    /// [`CostTracker`](crate::cost_tracker::CostTracker).
    pub fn telemetry(&self) -> &TelemetryRecorder {
        &self.telemetry
    }

    /// The cache, when enabled.
    pub fn cache(&self) -> Option<&GenerationCache> {
        self.cache.as_deref()
    }

    // ========================================================================
    // Generation operations
    // ========================================================================

    /// Run a plain-text generation.
    pub async fn generate(&self, task: &GenerationTask) -> Result<GenerationOutcome<Generation>> {
        let decision = self.limiter.check(&task.use_case, &task.identifier).await;
        if !decision.allowed {
            self.record_rate_limited(task, &decision);
            return Ok(GenerationOutcome::RateLimited(decision));
        }

        let prepared = self.prepare(task).await?;
        let model = prepared
            .request
            .model_or(prepared.provider.model())
            .to_string();

        let cache_key = self.cache_key_for(task, &prepared, false);
        if let (Some(cache), Some(key)) = (self.cache.as_deref(), cache_key) {
            if let Some(hit) = cache.get(&key).await {
                self.record_cache(EventKind::CacheHit, task, &model);
                return Ok(GenerationOutcome::Completed(hit));
            }
            self.record_cache(EventKind::CacheMiss, task, &model);
        }

        let started = Instant::now();
        let provider = prepared.provider.as_ref();
        let request = &prepared.request;
        let result = self
            .executor
            .execute_observed(
                &self.retry_policy,
                || provider.generate(request),
                |notice| self.record_retry(task, provider.name(), &model, notice),
            )
            .await;

        match result {
            Ok(generation) => {
                self.record_generation(task, &prepared, &generation, started.elapsed());
                if let (Some(cache), Some(key)) = (self.cache.as_deref(), cache_key) {
                    cache.put(key, generation.clone()).await;
                }
                Ok(GenerationOutcome::Completed(generation))
            }
            Err(error) => {
                self.record_error(task, provider.name(), &model, &error, started.elapsed());
                Err(error)
            }
        }
    }

    /// Run a generation that must return schema-conforming JSON.
    pub async fn generate_structured(
        &self,
        task: &GenerationTask,
    ) -> Result<GenerationOutcome<StructuredGeneration>> {
        let decision = self.limiter.check(&task.use_case, &task.identifier).await;
        if !decision.allowed {
            self.record_rate_limited(task, &decision);
            return Ok(GenerationOutcome::RateLimited(decision));
        }

        let prepared = self.prepare(task).await?;
        let model = prepared
            .request
            .model_or(prepared.provider.model())
            .to_string();

        let cache_key = self.cache_key_for(task, &prepared, true);
        if let (Some(cache), Some(key)) = (self.cache.as_deref(), cache_key) {
            if let Some(hit) = cache.get(&key).await {
                self.record_cache(EventKind::CacheHit, task, &model);
                return Ok(GenerationOutcome::Completed(
                    StructuredGeneration::from_generation(hit)?,
                ));
            }
            self.record_cache(EventKind::CacheMiss, task, &model);
        }

        let started = Instant::now();
        let provider = prepared.provider.as_ref();
        let request = &prepared.request;
        let result = self
            .executor
            .execute_observed(
                &self.retry_policy,
                || provider.generate_structured(request),
                |notice| self.record_retry(task, provider.name(), &model, notice),
            )
            .await;

        match result {
            Ok(structured) => {
                self.record_generation(task, &prepared, &structured.raw, started.elapsed());
                if let (Some(cache), Some(key)) = (self.cache.as_deref(), cache_key) {
                    cache.put(key, structured.raw.clone()).await;
                }
                Ok(GenerationOutcome::Completed(structured))
            }
            Err(error) => {
                self.record_error(task, provider.name(), &model, &error, started.elapsed());
                Err(error)
            }
        }
    }

    /// Open a token stream. Streams bypass the cache, and the outcome event
    /// is recorded when the stream opens, not when it drains.
    pub async fn generate_stream(
        &self,
        task: &GenerationTask,
    ) -> Result<GenerationOutcome<BoxStream<'static, Result<String>>>> {
        let decision = self.limiter.check(&task.use_case, &task.identifier).await;
        if !decision.allowed {
            self.record_rate_limited(task, &decision);
            return Ok(GenerationOutcome::RateLimited(decision));
        }

        let prepared = self.prepare(task).await?;
        let model = prepared
            .request
            .model_or(prepared.provider.model())
            .to_string();

        let started = Instant::now();
        let provider = prepared.provider.as_ref();
        let request = &prepared.request;
        let result = self
            .executor
            .execute_observed(
                &self.retry_policy,
                || provider.generate_stream(request),
                |notice| self.record_retry(task, provider.name(), &model, notice),
            )
            .await;

        match result {
            Ok(stream) => {
                let mut event = TelemetryEvent::new(EventKind::Generation)
                    .with_provider(provider.name())
                    .with_model(model.as_str())
                    .with_use_case(task.use_case.as_str())
                    .with_latency_ms(started.elapsed().as_millis() as u64)
                    .with_metadata("streamed", json!(true));
                event = annotate_experiment(event, &prepared);
                self.telemetry.record(event);
                Ok(GenerationOutcome::Completed(stream))
            }
            Err(error) => {
                self.record_error(task, provider.name(), &model, &error, started.elapsed());
                Err(error)
            }
        }
    }

    // ========================================================================
    // Feedback operations
    // ========================================================================

    /// Store one feedback record and emit a `feedback_received` event.
    pub async fn submit_feedback(
        &self,
        submission: FeedbackSubmission,
    ) -> Result<FeedbackRecord> {
        let record = self.feedback.submit(submission).await?;
        self.telemetry.record(
            TelemetryEvent::new(EventKind::FeedbackReceived)
                .with_metadata("insight_id", json!(record.insight_id))
                .with_metadata("helpful", json!(record.helpful)),
        );
        Ok(record)
    }

    /// Store feedback and credit it to the caller's experiment arm, when the
    /// prompt is under an active A/B test.
    pub async fn submit_experiment_feedback(
        &self,
        submission: FeedbackSubmission,
        prompt_key: &str,
        session_id: &str,
    ) -> Result<FeedbackRecord> {
        let record = self.submit_feedback(submission).await?;
        if let Some(assignment) = self.experiments.assignment(prompt_key, session_id).await? {
            self.experiments
                .record_outcome(prompt_key, assignment.arm, record.helpful)
                .await?;
        }
        Ok(record)
    }

    // ========================================================================
    // Pipeline internals
    // ========================================================================

    /// Resolve the system prompt (experiment arm, then active version) and
    /// construct the provider.
    async fn prepare(&self, task: &GenerationTask) -> Result<Prepared> {
        let mut options = task.options.clone();
        let mut arm = None;
        let mut prompt_version = None;

        if let Some(key) = &task.prompt_key {
            let session = task.session_id.as_deref().unwrap_or(&task.identifier);
            if let Some(assignment) = self.experiments.assignment(key, session).await? {
                prompt_version = Some(assignment.version.version);
                options.system_prompt = Some(assignment.version.content);
                arm = Some(assignment.arm);
            } else if let Some(version) = self.prompts.active_version(key).await? {
                prompt_version = Some(version.version);
                options.system_prompt = Some(version.content);
            } else {
                return Err(AiError::NotFound(format!("no active prompt for '{key}'")));
            }
        }

        let mut request = GenerationRequest::new(task.input.clone()).with_options(options);
        if let Some(schema) = &task.schema {
            request = request.with_schema(schema.clone());
        }

        let provider = self.registry.create(&task.provider)?;
        Ok(Prepared {
            request,
            provider,
            arm,
            prompt_version,
        })
    }

    /// Cache key for the call, or `None` when caching does not apply.
    /// Structured calls live in their own key space so a plain-text entry is
    /// never served where JSON is expected.
    fn cache_key_for(
        &self,
        task: &GenerationTask,
        prepared: &Prepared,
        structured: bool,
    ) -> Option<CacheKey> {
        if self.cache.is_none() || !task.use_cache {
            return None;
        }
        let model = prepared.request.model_or(prepared.provider.model());
        let system = prepared
            .request
            .options
            .system_prompt
            .as_deref()
            .unwrap_or("");
        let input = if structured {
            match &task.schema {
                Some(schema) => format!("structured:{schema}:{}", task.input),
                None => format!("structured:{}", task.input),
            }
        } else {
            task.input.clone()
        };
        Some(GenerationCache::key(&task.use_case, model, system, &input))
    }

    fn record_rate_limited(&self, task: &GenerationTask, decision: &RateLimitDecision) {
        let mut event = TelemetryEvent::new(EventKind::RateLimited)
            .with_use_case(task.use_case.as_str())
            .with_metadata("identifier", json!(task.identifier));
        if let Some(limit) = decision.limit {
            event = event.with_metadata("limit", json!(limit));
        }
        if let Some(reset) = decision.reset_rfc3339() {
            event = event.with_metadata("reset_at", json!(reset));
        }
        self.telemetry.record(event);
    }

    fn record_cache(&self, kind: EventKind, task: &GenerationTask, model: &str) {
        self.telemetry.record(
            TelemetryEvent::new(kind)
                .with_use_case(task.use_case.as_str())
                .with_model(model),
        );
    }

    fn record_retry(
        &self,
        task: &GenerationTask,
        provider_name: &str,
        model: &str,
        notice: &RetryNotice<'_>,
    ) {
        self.telemetry.record(
            TelemetryEvent::new(EventKind::Retry)
                .with_provider(provider_name)
                .with_model(model)
                .with_use_case(task.use_case.as_str())
                .with_error(notice.error.to_string())
                .with_metadata("attempt", json!(notice.attempt))
                .with_metadata("delay_ms", json!(notice.delay.as_millis() as u64)),
        );
    }

    fn record_generation(
        &self,
        task: &GenerationTask,
        prepared: &Prepared,
        generation: &Generation,
        elapsed: Duration,
    ) {
        let mut event = TelemetryEvent::new(EventKind::Generation)
            .with_provider(prepared.provider.name())
            .with_model(generation.model.as_str())
            .with_use_case(task.use_case.as_str())
            .with_latency_ms(elapsed.as_millis() as u64);
        if let (Some(input), Some(output)) = (generation.prompt_tokens, generation.completion_tokens)
        {
            event = event.with_usage(input, output);
        }
        event = annotate_experiment(event, prepared);
        self.telemetry.record(event);
    }

    fn record_error(
        &self,
        task: &GenerationTask,
        provider_name: &str,
        model: &str,
        error: &AiError,
        elapsed: Duration,
    ) {
        self.telemetry.record(
            TelemetryEvent::new(EventKind::Error)
                .with_provider(provider_name)
                .with_model(model)
                .with_use_case(task.use_case.as_str())
                .with_latency_ms(elapsed.as_millis() as u64)
                .with_error(error.to_string()),
        );
    }
}

fn annotate_experiment(mut event: TelemetryEvent, prepared: &Prepared) -> TelemetryEvent {
    if let Some(arm) = prepared.arm {
        event = event.with_metadata("experiment_arm", json!(arm.as_str()));
    }
    if let Some(version) = prepared.prompt_version {
        event = event.with_metadata("prompt_version", json!(version));
    }
    event
}

// ============================================================================
// Tests
// ============================================================================
