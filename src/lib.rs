//! # FinRAG
//!
//! Retrieval-augmented question answering over financial reports, with
//! per-company retrieval isolation, a freshness-aware answer cache, and
//! per-key rate limiting.
//!
//! ## Architecture
//!
//! ```text
//!              ┌─────────────┐
//!  POST /query │ RateLimiter │
//! ────────────▶│ AnswerCache │──miss──▶ embed ─▶ VectorIndex ─▶ ContextBuilder ─▶ generate
//!              └─────────────┘                      ▲
//!                                                   │ upsert
//!  POST /ingest ───────▶ DocumentIngestor ─▶ embed ─┘
//! ```
//!
//! Data types, the index, the provider traits, context assembly, and the
//! freshness classifier live in the `finrag-core` crate. This crate wires
//! them into a service.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`rate_limit`] | Per-key sliding-window admission |
//! | [`cache`] | Answer cache with freshness-based TTLs |
//! | [`metrics`] | Query counters, latency histogram, gauges |
//! | [`provider`] | OpenAI / Ollama providers and request pacing |
//! | [`orchestrator`] | The query pipeline |
//! | [`ingest`] | Document validation and ingestion |
//! | [`audit`] | SQLite audit trail |
//! | [`service`] | Service construction |
//! | [`server`] | HTTP API |
//! | [`client`] | HTTP client for the CLI |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod audit;
pub mod cache;
pub mod client;
pub mod config;
pub mod db;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod orchestrator;
pub mod provider;
pub mod rate_limit;
pub mod server;
pub mod service;
pub mod telemetry;
