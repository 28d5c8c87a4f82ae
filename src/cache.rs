//! Response cache for repeated generation requests.
//!
//! Popular dashboard questions repeat; serving them from memory skips the
//! provider call entirely. Entries are keyed by a fingerprint of everything
//! that shapes the output (use case, model, system prompt wording, user
//! input), expire after a TTL, and the oldest entry is evicted when the
//! cache is full. A hit never mutates the stored generation.
//!
//! Streaming responses are never cached; the orchestrator only consults the
//! cache for buffered generations.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::traits::Generation;

/// Cache sizing and expiry.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Entry count at which inserts evict the oldest entry.
    pub max_entries: usize,
    /// Lifetime measured from insertion.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

impl CacheConfig {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Fingerprint of one cacheable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    hash: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Generation,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Hit and eviction counters.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
    pub evictions: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// In-memory cache of completed generations.
pub struct GenerationCache {
    config: CacheConfig,
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    stats: RwLock<CacheStats>,
}

impl GenerationCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Fingerprint a request. Any change to the use case, model, prompt
    /// wording or input produces a distinct key, so prompt rollouts and
    /// experiments never serve stale wording.
    pub fn key(use_case: &str, model: &str, system_prompt: &str, input: &str) -> CacheKey {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        use_case.hash(&mut hasher);
        model.hash(&mut hasher);
        system_prompt.hash(&mut hasher);
        input.hash(&mut hasher);
        CacheKey {
            hash: hasher.finish(),
        }
    }

    /// Look up a cached generation, evicting it when expired.
    pub async fn get(&self, key: &CacheKey) -> Option<Generation> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(self.config.ttl) {
                entries.remove(key);
                let mut stats = self.stats.write().await;
                stats.misses += 1;
                stats.evictions += 1;
                return None;
            }
            let value = entry.value.clone();
            self.stats.write().await.hits += 1;
            return Some(value);
        }

        self.stats.write().await.misses += 1;
        None
    }

    /// Store a generation, evicting the oldest entry when full.
    pub async fn put(&self, key: CacheKey, generation: Generation) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.config.max_entries && !entries.contains_key(&key) {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.created_at)
                .map(|(k, _)| *k)
            {
                entries.remove(&oldest);
                self.stats.write().await.evictions += 1;
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value: generation,
                created_at: Instant::now(),
            },
        );
    }

    pub async fn stats(&self) -> CacheStats {
        let entries = self.entries.read().await;
        let stats = self.stats.read().await;
        CacheStats {
            entries: entries.len(),
            ..stats.clone()
        }
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let evicted = entries.len();
        entries.clear();
        self.stats.write().await.evictions += evicted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation(content: &str) -> Generation {
        Generation::new(content, "gpt-4o-mini")
    }

    #[test]
    fn test_key_is_stable_for_same_parts() {
        let a = GenerationCache::key("ask", "gpt-4o", "system", "input");
        let b = GenerationCache::key("ask", "gpt-4o", "system", "input");
        assert_eq!(a, b);
    }

    #[test]
    fn test_any_part_changes_the_key() {
        let base = GenerationCache::key("ask", "gpt-4o", "system", "input");
        assert_ne!(base, GenerationCache::key("compare", "gpt-4o", "system", "input"));
        assert_ne!(base, GenerationCache::key("ask", "gpt-4o-mini", "system", "input"));
        assert_ne!(base, GenerationCache::key("ask", "gpt-4o", "system v2", "input"));
        assert_ne!(base, GenerationCache::key("ask", "gpt-4o", "system", "other input"));
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = GenerationCache::new(CacheConfig::default());
        let key = GenerationCache::key("ask", "m", "s", "what is rust");

        assert!(cache.get(&key).await.is_none());

        cache.put(key, generation("rust is a systems language")).await;
        let hit = cache.get(&key).await.unwrap();
        assert_eq!(hit.content, "rust is a systems language");

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = GenerationCache::new(CacheConfig::new(10).with_ttl(Duration::from_millis(10)));
        let key = GenerationCache::key("ask", "m", "s", "q");

        cache.put(key, generation("answer")).await;
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(cache.get(&key).await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = GenerationCache::new(CacheConfig::new(2));
        let first = GenerationCache::key("ask", "m", "s", "q1");
        let second = GenerationCache::key("ask", "m", "s", "q2");
        let third = GenerationCache::key("ask", "m", "s", "q3");

        cache.put(first, generation("a1")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.put(second, generation("a2")).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.put(third, generation("a3")).await;

        assert!(cache.get(&first).await.is_none());
        assert!(cache.get(&second).await.is_some());
        assert!(cache.get(&third).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_overwriting_existing_key_does_not_evict() {
        let cache = GenerationCache::new(CacheConfig::new(2));
        let first = GenerationCache::key("ask", "m", "s", "q1");
        let second = GenerationCache::key("ask", "m", "s", "q2");

        cache.put(first, generation("a1")).await;
        cache.put(second, generation("a2")).await;
        cache.put(second, generation("a2 revised")).await;

        assert!(cache.get(&first).await.is_some());
        assert_eq!(cache.get(&second).await.unwrap().content, "a2 revised");
        assert_eq!(cache.stats().await.evictions, 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = GenerationCache::new(CacheConfig::default());
        cache
            .put(GenerationCache::key("ask", "m", "s", "q"), generation("a"))
            .await;
        assert_eq!(cache.stats().await.entries, 1);

        cache.clear().await;
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.hits = 3;
        stats.misses = 1;
        assert_eq!(stats.hit_rate(), 0.75);
    }
}
