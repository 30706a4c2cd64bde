//! Service construction.
//!
//! Every shared component (limiter, cache, index, metrics, providers,
//! audit) is built once here and handed to the orchestrator and ingestor
//! by `Arc`. Nothing is global, so tests assemble their own
//! [`AppServices`] from fakes via [`AppServices::with_parts`].

use std::sync::Arc;

use anyhow::Result;
use finrag_core::index::memory::InMemoryVectorIndex;
use finrag_core::index::VectorIndex;

use crate::audit::{AuditLog, NoopAuditLog, SqliteAuditLog};
use crate::cache::{AnswerCache, CacheBackend, MemoryCacheBackend};
use crate::config::Config;
use crate::ingest::DocumentIngestor;
use crate::metrics::MetricsCollector;
use crate::orchestrator::{QueryOrchestrator, QuerySettings};
use crate::provider::{create_provider, Providers};
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct AppServices {
    pub config: Arc<Config>,
    pub limiter: Arc<RateLimiter>,
    pub index: Arc<dyn VectorIndex>,
    pub orchestrator: Arc<QueryOrchestrator>,
    pub ingestor: Arc<DocumentIngestor>,
}

impl AppServices {
    /// Build the production service graph: configured provider, in-memory
    /// index and cache, SQLite audit when `[audit].db_path` is set.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let providers = create_provider(&config.provider)?;
        let audit: Arc<dyn AuditLog> = match &config.audit.db_path {
            Some(path) => {
                tracing::info!(path = %path.display(), "audit log enabled");
                Arc::new(SqliteAuditLog::open(path).await?)
            }
            None => Arc::new(NoopAuditLog),
        };

        Ok(Self::with_parts(
            config,
            Arc::new(InMemoryVectorIndex::new()),
            Arc::new(MemoryCacheBackend::new()),
            providers,
            audit,
        ))
    }

    pub fn with_parts(
        config: &Config,
        index: Arc<dyn VectorIndex>,
        cache_backend: Arc<dyn CacheBackend>,
        providers: Providers,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::from_config(&config.rate_limit));
        let cache = Arc::new(AnswerCache::new(cache_backend, &config.cache));
        let metrics = Arc::new(MetricsCollector::new());
        let settings = QuerySettings {
            top_k: config.retrieval.top_k,
            provider_timeout: config.provider.timeout(),
        };

        let ingestor = Arc::new(DocumentIngestor::new(
            index.clone(),
            providers.embedder.clone(),
            audit.clone(),
            settings.provider_timeout,
        ));
        let orchestrator = Arc::new(QueryOrchestrator::new(
            limiter.clone(),
            cache,
            index.clone(),
            providers,
            metrics,
            audit,
            settings,
        ));

        Self {
            config: Arc::new(config.clone()),
            limiter,
            index,
            orchestrator,
            ingestor,
        }
    }
}
