//! Query pipeline.
//!
//! [`QueryOrchestrator::query`] runs one request through:
//!
//! ```text
//! rate check ─┬─ denied ──────────────────────────────────────────► Denied
//!             └─ cache lookup ─┬─ hit ────────────────────────────► cache
//!                              └─ miss ─ embed ─ retrieve ─ build context
//!                                   ├─ empty ─────────────────────► insufficient_info
//!                                   └─ generate ─ classify ─ cache write ─► generated
//! ```
//!
//! Any provider or index failure ends the request as `error`. Only
//! generated answers are written to the cache. Every collaborator is
//! injected at construction, so tests can substitute fakes.

use std::sync::Arc;
use std::time::Duration;

use finrag_core::context::{BuiltContext, ContextBuilder};
use finrag_core::embedding::{AnswerGenerator, EmbeddingClient, ProviderError};
use finrag_core::freshness::{self, Freshness};
use finrag_core::index::VectorIndex;
use finrag_core::models::{AnswerSource, QueryResult};
use thiserror::Error;
use tokio::time::Instant;

use crate::audit::{AuditLog, QueryAudit};
use crate::cache::AnswerCache;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::provider::{with_deadline, Providers};
use crate::rate_limit::{RateLimitStatus, RateLimiter};

pub const ERROR_ANSWER: &str = "Sorry, I encountered an error while processing your question.";

pub fn insufficient_info_answer(company: &str) -> String {
    format!(
        "I don't have enough information about {} to answer this question.",
        company
    )
}

/// Failure of a stage between the cache miss and the answer.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("vector index query failed: {0:#}")]
    Index(anyhow::Error),
}

/// Result of [`QueryOrchestrator::query`].
#[derive(Debug, Clone)]
pub enum QueryOutcome {
    /// The tenant is over its rate limit. Nothing else ran.
    Denied(RateLimitStatus),
    Answered(QueryResult),
}

#[derive(Debug, Clone, Copy)]
pub struct QuerySettings {
    pub top_k: usize,
    /// Deadline applied to each embedding and generation call.
    pub provider_timeout: Duration,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            top_k: 10,
            provider_timeout: Duration::from_secs(30),
        }
    }
}

enum Fresh {
    Generated { answer: String, freshness: Freshness },
    NoContext,
}

pub struct QueryOrchestrator {
    limiter: Arc<RateLimiter>,
    cache: Arc<AnswerCache>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    generator: Arc<dyn AnswerGenerator>,
    context: ContextBuilder,
    metrics: Arc<MetricsCollector>,
    audit: Arc<dyn AuditLog>,
    settings: QuerySettings,
}

impl QueryOrchestrator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        cache: Arc<AnswerCache>,
        index: Arc<dyn VectorIndex>,
        providers: Providers,
        metrics: Arc<MetricsCollector>,
        audit: Arc<dyn AuditLog>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            limiter,
            cache,
            index,
            embedder: providers.embedder,
            generator: providers.generator,
            context: ContextBuilder::new(),
            metrics,
            audit,
            settings,
        }
    }

    /// Answer `question` about `company` on behalf of `tenant_key`.
    ///
    /// Never fails: provider errors come back as a `source = error` result.
    pub async fn query(&self, company: &str, question: &str, tenant_key: &str) -> QueryOutcome {
        let _in_flight = self.metrics.in_flight();
        let started = Instant::now();

        if !self.limiter.admit(tenant_key) {
            self.metrics.record_rate_limited();
            return QueryOutcome::Denied(self.limiter.remaining(tenant_key));
        }

        let key = self.cache.key(company, question);
        if let Some(entry) = self.cache.get(&key).await {
            let latency = started.elapsed();
            tracing::debug!(company, "cache hit");
            self.metrics.record_query(company, latency, true);
            let result = self.finish(AnswerSource::Cache, entry.answer, None, latency);
            self.audit(company, question, tenant_key, &result, latency).await;
            return QueryOutcome::Answered(result);
        }
        tracing::debug!(company, "cache miss");

        let (source, answer, error) = match self.answer_fresh(company, question).await {
            Ok(Fresh::Generated { answer, freshness }) => {
                self.cache.set(&key, &answer, freshness).await;
                (AnswerSource::Generated, answer, None)
            }
            Ok(Fresh::NoContext) => {
                tracing::warn!(company, "no relevant documents above relevance floor");
                (
                    AnswerSource::InsufficientInfo,
                    insufficient_info_answer(company),
                    None,
                )
            }
            Err(e) => {
                tracing::error!(company, error = %e, "query pipeline failed");
                (AnswerSource::Error, ERROR_ANSWER.to_string(), Some(e.to_string()))
            }
        };

        let latency = started.elapsed();
        if source == AnswerSource::Generated {
            self.metrics.record_query(company, latency, false);
        }
        let result = self.finish(source, answer, error, latency);
        self.audit(company, question, tenant_key, &result, latency).await;
        QueryOutcome::Answered(result)
    }

    pub fn rate_limit_status(&self, tenant_key: &str) -> RateLimitStatus {
        self.limiter.remaining(tenant_key)
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics
            .set_cache_backend_errors(self.cache.backend_errors());
        self.metrics.snapshot()
    }

    pub fn render_prometheus(&self) -> String {
        self.metrics
            .set_cache_backend_errors(self.cache.backend_errors());
        self.metrics.render_prometheus()
    }

    /// Refresh the cache-size gauge. Off the request path; failures are
    /// already counted by the cache.
    pub async fn sample_cache_size(&self) {
        if let Some(size) = self.cache.size().await {
            self.metrics.set_cache_size(size);
        }
        self.metrics
            .set_cache_backend_errors(self.cache.backend_errors());
    }

    async fn answer_fresh(&self, company: &str, question: &str) -> Result<Fresh, PipelineError> {
        let timeout = self.settings.provider_timeout;

        let embedding = with_deadline("embedding", timeout, self.embedder.embed(question)).await?;

        let matches = self
            .index
            .query(&embedding, company, self.settings.top_k)
            .await
            .map_err(PipelineError::Index)?;

        let context = match self.context.build(&matches) {
            BuiltContext::Empty => return Ok(Fresh::NoContext),
            BuiltContext::Ready { text, document_ids } => {
                tracing::debug!(company, documents = document_ids.len(), "context built");
                text
            }
        };

        let answer = with_deadline(
            "generation",
            timeout,
            self.generator.generate(&context, question),
        )
        .await?;

        Ok(Fresh::Generated {
            answer,
            freshness: freshness::classify(question),
        })
    }

    fn finish(
        &self,
        source: AnswerSource,
        answer: String,
        error: Option<String>,
        latency: Duration,
    ) -> QueryResult {
        self.metrics.record_outcome(source);
        QueryResult {
            answer,
            source,
            latency_seconds: latency.as_secs_f64(),
            error,
        }
    }

    async fn audit(
        &self,
        company: &str,
        question: &str,
        tenant_key: &str,
        result: &QueryResult,
        latency: Duration,
    ) {
        let entry = QueryAudit {
            company: company.to_string(),
            question: question.to_string(),
            latency,
            cache_hit: result.source == AnswerSource::Cache,
            source: result.source,
            api_key: tenant_key.to_string(),
        };
        if let Err(e) = self.audit.record_query(&entry).await {
            tracing::warn!(error = %e, "failed to record query audit");
        }
    }
}
