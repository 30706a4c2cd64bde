//! Audit trail for ingested documents and answered queries.
//!
//! Audit is an external side effect: callers log failures and carry on,
//! so a broken audit database never changes a response.

use anyhow::Result;
use async_trait::async_trait;
use finrag_core::models::{AnswerSource, DocumentMetadata};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;

use crate::rate_limit::redact_key;

/// One answered query, as written to the audit trail.
#[derive(Debug, Clone)]
pub struct QueryAudit {
    pub company: String,
    pub question: String,
    pub latency: Duration,
    pub cache_hit: bool,
    pub source: AnswerSource,
    pub api_key: String,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record_document(&self, document_id: &str, metadata: &DocumentMetadata) -> Result<()>;

    async fn record_query(&self, entry: &QueryAudit) -> Result<()>;
}

/// Discards every record. Used when no audit database is configured.
pub struct NoopAuditLog;

#[async_trait]
impl AuditLog for NoopAuditLog {
    async fn record_document(&self, _document_id: &str, _metadata: &DocumentMetadata) -> Result<()> {
        Ok(())
    }

    async fn record_query(&self, _entry: &QueryAudit) -> Result<()> {
        Ok(())
    }
}

/// SQLite-backed audit trail (`financial_reports`, `query_metrics`).
pub struct SqliteAuditLog {
    pool: SqlitePool,
}

impl SqliteAuditLog {
    /// Open the database at `path` and ensure its tables exist.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = crate::db::connect(path).await?;
        crate::migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl AuditLog for SqliteAuditLog {
    async fn record_document(&self, document_id: &str, metadata: &DocumentMetadata) -> Result<()> {
        sqlx::query(
            "INSERT INTO financial_reports \
             (company, report_type, report_date, section, content, embedding_id, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&metadata.company)
        .bind(&metadata.report_type)
        .bind(&metadata.report_date)
        .bind(&metadata.section)
        .bind(&metadata.content)
        .bind(document_id)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_query(&self, entry: &QueryAudit) -> Result<()> {
        sqlx::query(
            "INSERT INTO query_metrics \
             (query_text, company, latency_seconds, cache_hit, source, api_key, timestamp) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.question)
        .bind(&entry.company)
        .bind(entry.latency.as_secs_f64())
        .bind(entry.cache_hit as i64)
        .bind(entry.source.as_str())
        .bind(redact_key(&entry.api_key))
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
