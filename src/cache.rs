//! Freshness-aware answer cache.
//!
//! [`AnswerCache`] sits in front of a pluggable [`CacheBackend`] and owns
//! the policy: key normalization, TTL class selection, hit/miss
//! accounting, and the rule that a failing backend is never fatal.
//!
//! A backend error on `get` is reported to the caller as a miss, so the
//! pipeline regenerates the answer. A backend error on `set` is logged and
//! dropped. Both are counted, so an unhealthy backend shows up in metrics
//! instead of only as a falling hit ratio.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use finrag_core::freshness::Freshness;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CacheConfig;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache entry codec error: {0}")]
    Codec(String),
}

/// Key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration)
        -> Result<(), CacheError>;

    /// Number of live (unexpired) entries.
    async fn len(&self) -> Result<usize, CacheError>;
}

/// Process-local [`CacheBackend`]. Expired entries are dropped lazily on
/// read and whenever the size is sampled.
#[derive(Default)]
pub struct MemoryCacheBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &str,
        value: String,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn len(&self) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(entries.len())
    }
}

/// What is stored under a cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub answer: String,
    pub freshness: Freshness,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    /// `None` when the backend could not report its size.
    pub size: Option<usize>,
}

pub struct AnswerCache {
    backend: Arc<dyn CacheBackend>,
    key_prefix: String,
    realtime_ttl: Duration,
    historical_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl AnswerCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            backend,
            key_prefix: config.key_prefix.clone(),
            realtime_ttl: Duration::from_secs(config.realtime_ttl_secs),
            historical_ttl: Duration::from_secs(config.historical_ttl_secs),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Deterministic cache key for a (company, question) pair.
    ///
    /// The question is trimmed and lower-cased; the company is kept as
    /// given, matching the exact-match tenant filter of the index. The
    /// company is length-prefixed so no two pairs share a key.
    pub fn key(&self, company: &str, question: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.key_prefix,
            company.len(),
            company,
            question.trim().to_lowercase()
        )
    }

    pub fn ttl_for(&self, freshness: Freshness) -> Duration {
        match freshness {
            Freshness::RealTime => self.realtime_ttl,
            Freshness::Historical => self.historical_ttl,
        }
    }

    /// Look up a cached answer. Backend and decode failures count as misses.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let raw = match self.backend.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "cache get failed, treating as miss");
                return None;
            }
        };

        let entry = raw.and_then(|raw| match serde_json::from_str::<CacheEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %CacheError::Codec(e.to_string()), "undecodable cache entry");
                None
            }
        });

        match entry {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an answer under the TTL class of `freshness`. Never fails the caller.
    pub async fn set(&self, key: &str, answer: &str, freshness: Freshness) {
        let entry = CacheEntry {
            answer: answer.to_string(),
            freshness,
        };
        let value = match serde_json::to_string(&entry) {
            Ok(v) => v,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "failed to encode cache entry");
                return;
            }
        };

        if let Err(e) = self
            .backend
            .set_with_ttl(key, value, self.ttl_for(freshness))
            .await
        {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "cache set failed");
        }
    }

    /// Number of live entries, or `None` if the backend cannot say.
    pub async fn size(&self) -> Option<usize> {
        match self.backend.len().await {
            Ok(n) => Some(n),
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "cache size sample failed");
                None
            }
        }
    }

    pub fn backend_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            size: self.size().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn set_with_ttl(
            &self,
            _key: &str,
            _value: String,
            _ttl: Duration,
        ) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
        async fn len(&self) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    fn memory_cache() -> AnswerCache {
        AnswerCache::new(Arc::new(MemoryCacheBackend::new()), &CacheConfig::default())
    }

    #[test]
    fn test_key_normalizes_question() {
        let cache = memory_cache();
        assert_eq!(
            cache.key("Apple", "What is Revenue?"),
            cache.key("Apple", " what is revenue? ")
        );
        assert_eq!(
            cache.key("Apple", "What is Revenue?"),
            "financial_rag:5:Apple:what is revenue?"
        );
    }

    #[test]
    fn test_key_distinguishes_company() {
        let cache = memory_cache();
        assert_ne!(
            cache.key("Apple", "What is revenue?"),
            cache.key("Tesla", "What is revenue?")
        );
    }

    #[test]
    fn test_key_separator_in_company_does_not_collide() {
        let cache = memory_cache();
        assert_ne!(
            cache.key("Acme:secret", "revenue?"),
            cache.key("Acme", "secret:revenue?")
        );
    }

    #[test]
    fn test_ttl_classes() {
        let cache = memory_cache();
        assert_eq!(cache.ttl_for(Freshness::RealTime), Duration::from_secs(3600));
        assert_eq!(cache.ttl_for(Freshness::Historical), Duration::from_secs(86400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_then_get_hits() {
        let cache = memory_cache();
        let key = cache.key("Apple", "q");
        assert!(cache.get(&key).await.is_none());

        cache.set(&key, "answer", Freshness::Historical).await;
        let entry = cache.get(&key).await.unwrap();
        assert_eq!(entry.answer, "answer");
        assert_eq!(entry.freshness, Freshness::Historical);

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio, 0.5);
        assert_eq!(stats.size, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realtime_entry_expires_before_historical() {
        let cache = memory_cache();
        cache.set("rt", "a", Freshness::RealTime).await;
        cache.set("hist", "b", Freshness::Historical).await;

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert!(cache.get("rt").await.is_none());
        assert!(cache.get("hist").await.is_some());
        assert_eq!(cache.size().await, Some(1));
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_a_miss() {
        let cache = AnswerCache::new(Arc::new(DownBackend), &CacheConfig::default());
        assert!(cache.get("k").await.is_none());
        cache.set("k", "v", Freshness::RealTime).await;

        let stats = cache.stats().await;
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.size, None);
        // get + set + size sample
        assert_eq!(stats.errors, 3);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let backend = Arc::new(MemoryCacheBackend::new());
        backend
            .set_with_ttl("k", "not json".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = AnswerCache::new(backend, &CacheConfig::default());
        assert!(cache.get("k").await.is_none());
        assert_eq!(cache.backend_errors(), 1);
    }
}
