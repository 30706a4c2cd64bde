//! Document ingestion.
//!
//! Flow per document: validate → embed → upsert into the vector index →
//! audit. Validation happens before any external call, so a rejected
//! document never reaches the index. Batches are repeated single-document
//! ingestion with no rollback; the report says which documents made it.

use std::sync::Arc;
use std::time::Duration;

use finrag_core::embedding::EmbeddingClient;
use finrag_core::index::VectorIndex;
use finrag_core::models::{DocumentMetadata, NewDocument};
use serde::Serialize;
use tokio::time::Instant;

use crate::audit::AuditLog;
use crate::provider::with_deadline;

pub const DEFAULT_SECTION: &str = "General";

/// Structured validation failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rejection {
    pub reason: String,
    pub missing_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestOutcome {
    Accepted { document_id: String },
    /// The document was invalid. Retrying it unchanged will fail again.
    Rejected(Rejection),
    /// The document was valid but embedding or storage failed.
    Failed { reason: String },
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total_documents: usize,
    pub successful: usize,
    pub failed: usize,
    pub processing_time_seconds: f64,
    /// One entry per input document, in input order.
    pub outcomes: Vec<IngestOutcome>,
}

/// Check required fields and normalize into stored metadata.
pub fn validate(doc: &NewDocument) -> Result<DocumentMetadata, Rejection> {
    fn present(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    let company = present(&doc.company);
    let report_type = present(&doc.report_type);
    let report_date = present(&doc.report_date);
    let content = present(&doc.content);

    let missing: Vec<String> = [
        ("company", company.is_none()),
        ("report_type", report_type.is_none()),
        ("report_date", report_date.is_none()),
        ("content", content.is_none()),
    ]
    .iter()
    .filter(|(_, absent)| *absent)
    .map(|(name, _)| name.to_string())
    .collect();

    match (company, report_type, report_date, content) {
        (Some(company), Some(report_type), Some(report_date), Some(content)) => {
            Ok(DocumentMetadata {
                company,
                report_type,
                report_date,
                section: present(&doc.section).unwrap_or_else(|| DEFAULT_SECTION.to_string()),
                content,
            })
        }
        _ => Err(Rejection {
            reason: format!("missing required fields: {}", missing.join(", ")),
            missing_fields: missing,
        }),
    }
}

pub struct DocumentIngestor {
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingClient>,
    audit: Arc<dyn AuditLog>,
    provider_timeout: Duration,
}

impl DocumentIngestor {
    pub fn new(
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingClient>,
        audit: Arc<dyn AuditLog>,
        provider_timeout: Duration,
    ) -> Self {
        Self {
            index,
            embedder,
            audit,
            provider_timeout,
        }
    }

    pub async fn ingest(&self, doc: NewDocument) -> IngestOutcome {
        let metadata = match validate(&doc) {
            Ok(metadata) => metadata,
            Err(rejection) => {
                tracing::info!(reason = %rejection.reason, "document rejected");
                return IngestOutcome::Rejected(rejection);
            }
        };

        let embedding = match with_deadline(
            "embedding",
            self.provider_timeout,
            self.embedder.embed(&metadata.content),
        )
        .await
        {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::error!(company = %metadata.company, error = %e, "document embedding failed");
                return IngestOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let document_id = metadata.generate_id();
        if let Err(e) = self.index.upsert(&document_id, &embedding, &metadata).await {
            tracing::error!(document_id = %document_id, error = %e, "vector index upsert failed");
            return IngestOutcome::Failed {
                reason: format!("{:#}", e),
            };
        }

        if let Err(e) = self.audit.record_document(&document_id, &metadata).await {
            tracing::warn!(document_id = %document_id, error = %e, "failed to record document audit");
        }

        tracing::info!(
            document_id = %document_id,
            company = %metadata.company,
            report_type = %metadata.report_type,
            "document ingested"
        );
        IngestOutcome::Accepted { document_id }
    }

    /// Ingest each document in order. Earlier successes stand when a later
    /// document fails.
    pub async fn ingest_batch(&self, docs: Vec<NewDocument>) -> BatchReport {
        let started = Instant::now();
        let total_documents = docs.len();
        let mut outcomes = Vec::with_capacity(total_documents);

        for doc in docs {
            outcomes.push(self.ingest(doc).await);
        }

        let successful = outcomes.iter().filter(|o| o.is_accepted()).count();
        let report = BatchReport {
            total_documents,
            successful,
            failed: total_documents - successful,
            processing_time_seconds: started.elapsed().as_secs_f64(),
            outcomes,
        };
        tracing::info!(
            total = report.total_documents,
            successful = report.successful,
            failed = report.failed,
            "batch ingestion finished"
        );
        report
    }
}
