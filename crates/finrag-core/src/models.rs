//! Core data models shared by the ingestion and query paths.
//!
//! Documents are validated into fixed-shape structs at the ingestion
//! boundary; retrieval results carry the same metadata back out so the
//! context builder never has to look anything up.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inbound ingestion request, before validation.
///
/// Every field is optional at this stage so that a missing value can be
/// reported as a structured rejection instead of a decode failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub report_type: Option<String>,
    #[serde(default)]
    pub report_date: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Metadata stored next to every embedding in the vector index.
///
/// `company` is the tenant-isolation field for retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub company: String,
    pub report_type: String,
    pub report_date: String,
    pub section: String,
    pub content: String,
}

/// A validated, embedded document. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub metadata: DocumentMetadata,
    pub embedding: Vec<f32>,
}

impl DocumentMetadata {
    /// Generate a document id of the form
    /// `{company}_{report_type}_{report_date}_{8 hex chars}`.
    pub fn generate_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!(
            "{}_{}_{}_{}",
            self.company,
            self.report_type,
            self.report_date,
            &suffix[..8]
        )
    }
}

/// A single ranked hit returned by a [`VectorIndex`](crate::index::VectorIndex).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievalMatch {
    pub id: String,
    pub metadata: DocumentMetadata,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f32,
}

/// Where a query answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Cache,
    Generated,
    InsufficientInfo,
    Error,
}

impl AnswerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerSource::Cache => "cache",
            AnswerSource::Generated => "generated",
            AnswerSource::InsufficientInfo => "insufficient_info",
            AnswerSource::Error => "error",
        }
    }
}

/// Result of one query. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub answer: String,
    pub source: AnswerSource,
    pub latency_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
