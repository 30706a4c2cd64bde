//! # FinRAG Core
//!
//! Shared, runtime-agnostic logic for FinRAG: data models, the
//! tenant-partitioned vector index, prompt context assembly, freshness
//! classification, and the provider traits.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! The `finrag` app crate wires these pieces into the query and ingestion
//! pipelines.

pub mod context;
pub mod embedding;
pub mod freshness;
pub mod index;
pub mod models;
