//! Fixed-window rate limiting for generation endpoints.
//!
//! Counts requests per `(endpoint, client)` pair inside clock-aligned
//! windows. Counters live behind the [`RateLimitStore`] trait so every
//! instance of the service shares one set of counts; the bundled
//! [`MemoryRateLimitStore`] is for tests and single-instance deployments
//! only.
//!
//! Denial is a decision, not an error: [`RateLimiter::check`] always
//! returns a [`RateLimitDecision`] the HTTP layer turns into a 429 with
//! `X-RateLimit-Remaining` / `X-RateLimit-Reset` headers. If the counter
//! store is unreachable the limiter admits the request and logs, so a
//! storage outage never blocks generation.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use trendscope_ai::rate_limiter::{MemoryRateLimitStore, RateLimiter};
//!
//! let limiter = RateLimiter::with_defaults(Arc::new(MemoryRateLimitStore::new()));
//! let decision = limiter.check("ask", "203.0.113.7").await;
//! if !decision.allowed {
//!     // respond 429, decision.reset_rfc3339() fills X-RateLimit-Reset
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

// ============================================================================
// Counter store
// ============================================================================

/// Shared counter storage.
///
/// `incr` must be atomic per key (Redis `INCR` + expiry, or an upsert with
/// `count = count + 1 RETURNING count`) and returns the count *after* the
/// increment. Keys embed the window start, so entries only need to live for
/// roughly one window length.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Increment `key`, creating it with the given time-to-live when absent,
    /// and return the post-increment count.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64>;
}

/// In-process counter store backed by a mutex-guarded map.
///
/// Counts are invisible to other instances of the service; use a shared
/// store in any multi-instance deployment.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
}

struct CounterEntry {
    count: u64,
    expires_at: std::time::Instant,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = std::time::Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.expires_at > now);

        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            count: 0,
            expires_at: now + ttl,
        });
        entry.count += 1;
        Ok(entry.count)
    }
}

// ============================================================================
// Policies and decisions
// ============================================================================

/// Request budget for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Window length; windows are aligned to multiples of this duration.
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    /// Budget of `max_requests` per clock minute.
    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

/// Outcome of a rate-limit check.
///
/// `limit`, `remaining` and `reset_at` are `None` for endpoints without a
/// configured policy.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Window budget for this endpoint.
    pub limit: Option<u32>,
    /// Requests left in the current window after this one.
    pub remaining: Option<u32>,
    /// When the current window closes and the count resets.
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitDecision {
    /// Decision for endpoints with no policy: always admitted, no budget
    /// headers.
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: None,
            reset_at: None,
        }
    }

    /// `reset_at` formatted for the `X-RateLimit-Reset` header.
    pub fn reset_rfc3339(&self) -> Option<String> {
        self.reset_at
            .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

// ============================================================================
// Rate limiter
// ============================================================================

/// Fixed-window limiter over a shared counter store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: HashMap<String, RateLimitPolicy>,
}

impl RateLimiter {
    /// Limiter with no endpoint policies; every check is admitted until
    /// policies are added.
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self {
            store,
            policies: HashMap::new(),
        }
    }

    /// Limiter seeded with the dashboard's endpoint budgets.
    pub fn with_defaults(store: Arc<dyn RateLimitStore>) -> Self {
        Self::new(store)
            .with_policy("ask", RateLimitPolicy::per_minute(5))
            .with_policy("compare", RateLimitPolicy::per_minute(10))
            .with_policy("insights", RateLimitPolicy::per_minute(30))
            .with_policy("feedback", RateLimitPolicy::per_minute(20))
    }

    /// Add or replace the policy for an endpoint.
    pub fn with_policy(mut self, endpoint: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.policies.insert(endpoint.into(), policy);
        self
    }

    /// Check whether `identifier` may call `endpoint` right now.
    ///
    /// Never fails: endpoints without a policy are admitted unconditionally,
    /// and a counter-store error admits the request (logged at `warn`).
    pub async fn check(&self, endpoint: &str, identifier: &str) -> RateLimitDecision {
        self.check_at(endpoint, identifier, Utc::now()).await
    }

    async fn check_at(
        &self,
        endpoint: &str,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let policy = match self.policies.get(endpoint) {
            Some(policy) => policy,
            None => return RateLimitDecision::unlimited(),
        };

        let window_ms = policy.window.as_millis().max(1) as i64;
        let now_ms = now.timestamp_millis();
        let window_start_ms = now_ms - now_ms.rem_euclid(window_ms);
        let reset_at = DateTime::<Utc>::from_timestamp_millis(window_start_ms + window_ms)
            .unwrap_or(now + policy.window);

        let key = format!("ratelimit:{endpoint}:{identifier}:{window_start_ms}");
        let count = match self.store.incr(&key, policy.window).await {
            Ok(count) => count,
            Err(error) => {
                // Counter outage must not take generation down with it.
                warn!(endpoint, %error, "rate limit store unavailable, admitting request");
                return RateLimitDecision {
                    allowed: true,
                    limit: Some(policy.max_requests),
                    remaining: Some(policy.max_requests),
                    reset_at: Some(reset_at),
                };
            }
        };

        let allowed = count <= policy.max_requests as u64;
        let remaining = policy.max_requests.saturating_sub(count.min(u32::MAX as u64) as u32);
        if !allowed {
            debug!(endpoint, identifier, count, "rate limit exceeded");
        }

        RateLimitDecision {
            allowed,
            limit: Some(policy.max_requests),
            remaining: Some(remaining),
            reset_at: Some(reset_at),
        }
    }
}

/// Resolve the client identity from proxy headers.
///
/// Takes the first hop of `X-Forwarded-For`, then `X-Real-IP`, then the
/// literal `"unknown"` so direct connections still share one bucket.
pub fn client_identifier(forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    if let Some(forwarded) = forwarded_for {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(ip) = real_ip {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AiError;
    use chrono::TimeZone;

    struct FailingStore;

    #[async_trait]
    impl RateLimitStore for FailingStore {
        async fn incr(&self, _key: &str, _ttl: Duration) -> Result<u64> {
            Err(AiError::Storage("connection refused".into()))
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    fn test_limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryRateLimitStore::new()))
            .with_policy("ask", RateLimitPolicy::per_minute(5))
    }

    #[tokio::test]
    async fn test_admits_until_limit_then_denies() {
        let limiter = test_limiter();
        let now = at(1_700_000_010);

        for _ in 0..5 {
            let decision = limiter.check_at("ask", "203.0.113.7", now).await;
            assert!(decision.allowed);
        }
        let denied = limiter.check_at("ask", "203.0.113.7", now).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, Some(0));
    }

    #[tokio::test]
    async fn test_remaining_counts_down() {
        let limiter = test_limiter();
        let now = at(1_700_000_010);

        let first = limiter.check_at("ask", "client", now).await;
        assert_eq!(first.limit, Some(5));
        assert_eq!(first.remaining, Some(4));

        let second = limiter.check_at("ask", "client", now).await;
        assert_eq!(second.remaining, Some(3));
    }

    #[tokio::test]
    async fn test_identifiers_have_separate_budgets() {
        let limiter = test_limiter();
        let now = at(1_700_000_010);

        for _ in 0..6 {
            limiter.check_at("ask", "first", now).await;
        }
        let other = limiter.check_at("ask", "second", now).await;
        assert!(other.allowed);
    }

    #[tokio::test]
    async fn test_endpoints_have_separate_budgets() {
        let store: Arc<dyn RateLimitStore> = Arc::new(MemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store)
            .with_policy("ask", RateLimitPolicy::per_minute(1))
            .with_policy("compare", RateLimitPolicy::per_minute(1));
        let now = at(1_700_000_010);

        assert!(limiter.check_at("ask", "c", now).await.allowed);
        assert!(!limiter.check_at("ask", "c", now).await.allowed);
        assert!(limiter.check_at("compare", "c", now).await.allowed);
    }

    #[tokio::test]
    async fn test_window_rollover_resets_budget() {
        let limiter = test_limiter();
        let in_window = at(1_700_000_010);

        for _ in 0..6 {
            limiter.check_at("ask", "c", in_window).await;
        }
        assert!(!limiter.check_at("ask", "c", in_window).await.allowed);

        // 1_700_000_010 sits in [1_699_999_980, 1_700_000_040); anything at
        // or past 1_700_000_040 lands in a fresh window.
        let next_window = at(1_700_000_070);
        assert!(limiter.check_at("ask", "c", next_window).await.allowed);
    }

    #[tokio::test]
    async fn test_windows_align_to_clock_boundaries() {
        let limiter = test_limiter();

        // 1_699_999_980 is divisible by 60: both instants share the window
        // [1_699_999_980, 1_700_000_040).
        let early = at(1_699_999_985);
        let late = at(1_700_000_039);

        let first = limiter.check_at("ask", "c", early).await;
        let second = limiter.check_at("ask", "c", late).await;
        assert_eq!(first.reset_at, second.reset_at);
        assert_eq!(first.reset_at, Some(at(1_700_000_040)));
        assert_eq!(second.remaining, Some(3));
    }

    #[tokio::test]
    async fn test_unconfigured_endpoint_is_unlimited() {
        let limiter = test_limiter();
        let now = at(1_700_000_010);

        for _ in 0..100 {
            let decision = limiter.check_at("health", "c", now).await;
            assert!(decision.allowed);
            assert_eq!(decision.limit, None);
            assert_eq!(decision.reset_at, None);
        }
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore))
            .with_policy("ask", RateLimitPolicy::per_minute(1));
        let now = at(1_700_000_010);

        for _ in 0..10 {
            let decision = limiter.check_at("ask", "c", now).await;
            assert!(decision.allowed);
        }
    }

    #[tokio::test]
    async fn test_default_budgets() {
        let limiter = RateLimiter::with_defaults(Arc::new(MemoryRateLimitStore::new()));
        let now = at(1_700_000_010);

        assert_eq!(limiter.check_at("ask", "c", now).await.limit, Some(5));
        assert_eq!(limiter.check_at("compare", "c", now).await.limit, Some(10));
        assert_eq!(limiter.check_at("insights", "c", now).await.limit, Some(30));
        assert_eq!(limiter.check_at("feedback", "c", now).await.limit, Some(20));
    }

    #[tokio::test]
    async fn test_memory_store_expires_entries() {
        let store = MemoryRateLimitStore::new();
        let ttl = Duration::from_millis(10);

        assert_eq!(store.incr("k", ttl).await.unwrap(), 1);
        assert_eq!(store.incr("k", ttl).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.incr("k", ttl).await.unwrap(), 1);
    }

    #[test]
    fn test_reset_header_is_rfc3339() {
        let decision = RateLimitDecision {
            allowed: false,
            limit: Some(5),
            remaining: Some(0),
            reset_at: Some(at(1_700_000_040)),
        };
        assert_eq!(
            decision.reset_rfc3339().unwrap(),
            "2023-11-14T22:14:00Z"
        );
    }

    #[test]
    fn test_client_identifier_prefers_forwarded_for() {
        let id = client_identifier(Some("203.0.113.7, 10.0.0.1"), Some("10.0.0.2"));
        assert_eq!(id, "203.0.113.7");
    }

    #[test]
    fn test_client_identifier_trims_whitespace() {
        let id = client_identifier(Some("  203.0.113.7 , 10.0.0.1"), None);
        assert_eq!(id, "203.0.113.7");
    }

    #[test]
    fn test_client_identifier_falls_back_to_real_ip() {
        assert_eq!(client_identifier(None, Some("10.0.0.2")), "10.0.0.2");
        assert_eq!(client_identifier(Some("   "), Some("10.0.0.2")), "10.0.0.2");
    }

    #[test]
    fn test_client_identifier_unknown_when_no_headers() {
        assert_eq!(client_identifier(None, None), "unknown");
        assert_eq!(client_identifier(Some(""), Some("")), "unknown");
    }
}
