//! Deterministic provider for tests.
//!
//! Outcomes are scripted into a queue and consumed one per call; an empty
//! queue yields a canned success so simple tests need no setup. The mock
//! counts calls and keeps the last request it saw, which is how retry
//! loops, prompt resolution and experiment assignment are asserted on.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{AiError, Result};
use crate::traits::{Generation, GenerationProvider, GenerationRequest, StructuredGeneration};

/// Scripted generation provider.
#[derive(Clone)]
pub struct MockProvider {
    name: String,
    model: String,
    outcomes: Arc<Mutex<VecDeque<Result<Generation>>>>,
    call_count: Arc<AtomicUsize>,
    last_request: Arc<Mutex<Option<GenerationRequest>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            model: "mock-model".to_string(),
            outcomes: Arc::new(Mutex::new(VecDeque::new())),
            call_count: Arc::new(AtomicUsize::new(0)),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Queue a full generation.
    pub async fn enqueue(&self, generation: Generation) {
        self.outcomes.lock().await.push_back(Ok(generation));
    }

    /// Queue a plain-text success.
    pub async fn enqueue_content(&self, content: impl Into<String>) {
        let generation = Generation::new(content, &self.model);
        self.enqueue(generation).await;
    }

    /// Queue a provider failure with an HTTP-like status.
    pub async fn enqueue_failure(&self, status: u16, message: impl Into<String>) {
        self.enqueue_error(AiError::provider(status, &self.name, message))
            .await;
    }

    /// Queue an arbitrary error.
    pub async fn enqueue_error(&self, error: AiError) {
        self.outcomes.lock().await.push_back(Err(error));
    }

    /// Calls made so far, across all three operations.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// The most recent request, for asserting on resolved prompts.
    pub async fn last_request(&self) -> Option<GenerationRequest> {
        self.last_request.lock().await.clone()
    }

    async fn next_outcome(&self, request: &GenerationRequest) -> Result<Generation> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().await = Some(request.clone());

        match self.outcomes.lock().await.pop_front() {
            Some(outcome) => outcome,
            None => Ok(Generation::new("mock response", &self.model)),
        }
    }
}

#[async_trait]
impl GenerationProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation> {
        self.next_outcome(request).await
    }

    async fn generate_structured(&self, request: &GenerationRequest) -> Result<StructuredGeneration> {
        let generation = self.next_outcome(request).await?;
        StructuredGeneration::from_generation(generation)
    }

    async fn generate_stream(
        &self,
        request: &GenerationRequest,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let generation = self.next_outcome(request).await?;
        let chunks: Vec<Result<String>> = generation
            .content
            .split_inclusive(' ')
            .map(|chunk| Ok(chunk.to_string()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
