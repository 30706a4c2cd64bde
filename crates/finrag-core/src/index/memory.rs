//! In-memory [`VectorIndex`] implementation.
//!
//! Embeddings are partitioned by company behind a single `RwLock`, so a
//! query only ever scans the requesting tenant's partition. Search is
//! brute-force cosine similarity, which is fast enough for tens of
//! thousands of report sections.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::{DocumentMetadata, RetrievalMatch};

use super::VectorIndex;

struct StoredVector {
    vector: Vec<f32>,
    metadata: DocumentMetadata,
}

#[derive(Default)]
struct Partitions {
    /// company -> (id -> vector)
    by_company: HashMap<String, HashMap<String, StoredVector>>,
    /// id -> company, so a re-upsert under a new company leaves no stale copy.
    owners: HashMap<String, String>,
}

/// In-memory, tenant-partitioned vector index.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    inner: RwLock<Partitions>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Partitions>> {
        self.inner
            .read()
            .map_err(|_| anyhow!("vector index lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Partitions>> {
        self.inner
            .write()
            .map_err(|_| anyhow!("vector index lock poisoned"))
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: &str,
        embedding: &[f32],
        metadata: &DocumentMetadata,
    ) -> Result<()> {
        let mut parts = self.write()?;

        if let Some(previous) = parts.owners.get(id).cloned() {
            if previous != metadata.company {
                if let Some(partition) = parts.by_company.get_mut(&previous) {
                    partition.remove(id);
                }
            }
        }

        parts
            .owners
            .insert(id.to_string(), metadata.company.clone());
        parts
            .by_company
            .entry(metadata.company.clone())
            .or_default()
            .insert(
                id.to_string(),
                StoredVector {
                    vector: embedding.to_vec(),
                    metadata: metadata.clone(),
                },
            );
        Ok(())
    }

    async fn query(
        &self,
        embedding: &[f32],
        tenant: &str,
        top_k: usize,
    ) -> Result<Vec<RetrievalMatch>> {
        let parts = self.read()?;
        let partition = match parts.by_company.get(tenant) {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };

        let mut matches: Vec<RetrievalMatch> = partition
            .iter()
            .map(|(id, sv)| RetrievalMatch {
                id: id.clone(),
                metadata: sv.metadata.clone(),
                score: cosine_similarity(embedding, &sv.vector),
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.read()?.owners.len())
    }
}
