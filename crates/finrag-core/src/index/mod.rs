//! Vector index abstraction for FinRAG.
//!
//! The [`VectorIndex`] trait is the seam between the query/ingestion
//! pipeline and whatever stores the document embeddings (in-memory,
//! hosted vector database, ...).
//!
//! Tenant filtering is part of the contract: [`VectorIndex::query`] must
//! only ever consider documents whose `company` equals the requested
//! tenant. Implementations enforce this inside the index, never by
//! filtering a mixed result list afterwards.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{DocumentMetadata, RetrievalMatch};

/// Abstract similarity index over ingested document embeddings.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorIndex::upsert) | Insert or replace an embedding by id |
/// | [`query`](VectorIndex::query) | Tenant-scoped top-k cosine search |
/// | [`len`](VectorIndex::len) | Number of stored embeddings |
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the embedding stored under `id`.
    ///
    /// Upserting the same id twice leaves exactly one entry.
    async fn upsert(&self, id: &str, embedding: &[f32], metadata: &DocumentMetadata)
        -> Result<()>;

    /// Return up to `top_k` matches for `tenant`, ordered by descending score.
    async fn query(&self, embedding: &[f32], tenant: &str, top_k: usize)
        -> Result<Vec<RetrievalMatch>>;

    /// Number of embeddings currently stored, across all tenants.
    async fn len(&self) -> Result<usize>;
}
