//! User feedback on generated insights.
//!
//! Readers mark an insight helpful or not, optionally saying why. Records
//! are append-only; [`FeedbackAnalyzer::summary`] aggregates a lookback
//! window into counts, a helpfulness ratio and the most common reasons,
//! which feeds both the operator dashboard and prompt experiments.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{AiError, Result};

/// Longest accepted free-text reason.
const MAX_REASON_LEN: usize = 2000;

/// How many distinct reasons a summary reports.
const TOP_REASONS_LIMIT: usize = 5;

// ============================================================================
// Records and submissions
// ============================================================================

/// An incoming feedback payload, unvalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    /// Which generated insight this refers to.
    pub insight_id: String,
    pub helpful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl FeedbackSubmission {
    /// Validate and stamp the submission.
    ///
    /// The insight id must be non-blank and the reason, when given, is
    /// trimmed (blank becomes `None`) and capped at [`MAX_REASON_LEN`].
    pub fn into_record(self) -> Result<FeedbackRecord> {
        if self.insight_id.trim().is_empty() {
            return Err(AiError::InvalidInput("insight_id must not be empty".into()));
        }
        let reason = match self.reason {
            Some(reason) => {
                let reason = reason.trim();
                if reason.chars().count() > MAX_REASON_LEN {
                    return Err(AiError::InvalidInput(format!(
                        "reason exceeds {MAX_REASON_LEN} characters"
                    )));
                }
                if reason.is_empty() {
                    None
                } else {
                    Some(reason.to_string())
                }
            }
            None => None,
        };

        Ok(FeedbackRecord {
            insight_id: self.insight_id,
            helpful: self.helpful,
            reason,
            timestamp: Utc::now(),
        })
    }
}

/// A stored feedback entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub insight_id: String,
    pub helpful: bool,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Feedback store
// ============================================================================

/// Append-only feedback storage.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn append(&self, record: FeedbackRecord) -> Result<()>;

    /// Records with `timestamp >= cutoff`, oldest first.
    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<FeedbackRecord>>;
}

/// In-process store backed by a `Vec`.
#[derive(Default)]
pub struct MemoryFeedbackStore {
    records: RwLock<Vec<FeedbackRecord>>,
}

impl MemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FeedbackStore for MemoryFeedbackStore {
    async fn append(&self, record: FeedbackRecord) -> Result<()> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn since(&self, cutoff: DateTime<Utc>) -> Result<Vec<FeedbackRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|record| record.timestamp >= cutoff)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Analyzer
// ============================================================================

/// Aggregate view of a feedback window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackSummary {
    pub total: u32,
    pub helpful_count: u32,
    pub not_helpful_count: u32,
    /// Share of helpful votes; 0.0 when there are no records.
    pub helpful_ratio: f64,
    /// Most frequent reasons, case-folded, most common first.
    pub top_reasons: Vec<(String, u32)>,
}

/// Stores submissions and summarizes them over a lookback window.
#[derive(Clone)]
pub struct FeedbackAnalyzer {
    store: Arc<dyn FeedbackStore>,
}

impl FeedbackAnalyzer {
    pub fn new(store: Arc<dyn FeedbackStore>) -> Self {
        Self { store }
    }

    /// Validate and persist one submission.
    pub async fn submit(&self, submission: FeedbackSubmission) -> Result<FeedbackRecord> {
        let record = submission.into_record()?;
        self.store.append(record.clone()).await?;
        Ok(record)
    }

    /// Summarize the last `lookback_days` days. An empty window yields the
    /// all-zero summary.
    pub async fn summary(&self, lookback_days: u32) -> Result<FeedbackSummary> {
        self.summary_at(lookback_days, Utc::now()).await
    }

    async fn summary_at(&self, lookback_days: u32, now: DateTime<Utc>) -> Result<FeedbackSummary> {
        let cutoff = now - Duration::days(i64::from(lookback_days));
        let records = self.store.since(cutoff).await?;

        let mut summary = FeedbackSummary::default();
        let mut reasons: HashMap<String, u32> = HashMap::new();

        for record in &records {
            summary.total += 1;
            if record.helpful {
                summary.helpful_count += 1;
            } else {
                summary.not_helpful_count += 1;
            }
            if let Some(reason) = &record.reason {
                *reasons.entry(reason.to_lowercase()).or_default() += 1;
            }
        }

        if summary.total > 0 {
            summary.helpful_ratio = f64::from(summary.helpful_count) / f64::from(summary.total);
        }

        let mut ranked: Vec<(String, u32)> = reasons.into_iter().collect();
        // Ties break alphabetically so summaries are reproducible.
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(TOP_REASONS_LIMIT);
        summary.top_reasons = ranked;

        Ok(summary)
    }
}
