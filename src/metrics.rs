//! Process-wide query metrics.
//!
//! Every metric is its own atomic (or its own [`DashMap`] shard), so
//! concurrent requests update independent metrics without contending on a
//! collector-wide lock. Values accumulate for the life of the process.
//!
//! | Metric | Kind | Labels |
//! |--------|------|--------|
//! | `financial_rag_queries_total` | counter | company, cache_hit |
//! | `financial_rag_query_latency_seconds` | histogram | company, cache_hit |
//! | `financial_rag_concurrent_requests` | gauge | |
//! | `financial_rag_cache_size` | gauge | |
//! | `financial_rag_query_outcomes_total` | counter | source |
//! | `financial_rag_rate_limited_total` | counter | |
//! | `financial_rag_cache_backend_errors_total` | counter | |

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use finrag_core::models::AnswerSource;
use serde::Serialize;
use tokio::time::Instant;

/// Upper bounds (seconds) of the latency histogram buckets.
pub const LATENCY_BUCKETS: [f64; 8] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0];

const OUTCOME_SOURCES: [AnswerSource; 4] = [
    AnswerSource::Cache,
    AnswerSource::Generated,
    AnswerSource::InsufficientInfo,
    AnswerSource::Error,
];

#[derive(Default)]
struct QuerySeries {
    count: AtomicU64,
    latency_micros: AtomicU64,
    /// Observations per bucket (not cumulative); the last slot is `+Inf`.
    buckets: [AtomicU64; LATENCY_BUCKETS.len() + 1],
}

impl QuerySeries {
    fn observe(&self, latency: Duration) {
        let secs = latency.as_secs_f64();
        let slot = LATENCY_BUCKETS
            .iter()
            .position(|&bound| secs <= bound)
            .unwrap_or(LATENCY_BUCKETS.len());
        self.buckets[slot].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }
}

/// Pull-based summary returned by `GET /metrics`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub query_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_ratio: f64,
    pub concurrent_requests: i64,
    pub cache_size: u64,
    /// Mean latency in seconds over all recorded queries.
    pub average_latency: f64,
    pub uptime_seconds: f64,
    pub queries_per_second: f64,
    pub rate_limited: u64,
    pub cache_backend_errors: u64,
    /// Terminal outcomes keyed by answer source.
    pub outcomes: BTreeMap<String, u64>,
}

pub struct MetricsCollector {
    series: DashMap<(String, bool), QuerySeries>,
    total_queries: AtomicU64,
    cache_hits: AtomicU64,
    latency_micros: AtomicU64,
    concurrent: AtomicI64,
    cache_size: AtomicU64,
    cache_backend_errors: AtomicU64,
    rate_limited: AtomicU64,
    outcomes: [AtomicU64; 4],
    started_at: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            total_queries: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            latency_micros: AtomicU64::new(0),
            concurrent: AtomicI64::new(0),
            cache_size: AtomicU64::new(0),
            cache_backend_errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            outcomes: Default::default(),
            started_at: Instant::now(),
        }
    }

    pub fn record_query(&self, company: &str, latency: Duration, cache_hit: bool) {
        self.series
            .entry((company.to_string(), cache_hit))
            .or_default()
            .observe(latency);

        self.total_queries.fetch_add(1, Ordering::Relaxed);
        if cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    /// Count a terminal pipeline outcome.
    pub fn record_outcome(&self, source: AnswerSource) {
        self.outcomes[outcome_slot(source)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_concurrent(&self) {
        self.concurrent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_concurrent(&self) {
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn concurrent(&self) -> i64 {
        self.concurrent.load(Ordering::SeqCst)
    }

    /// Increment the concurrency gauge until the returned guard is dropped.
    pub fn in_flight(&self) -> InFlight<'_> {
        self.inc_concurrent();
        InFlight { metrics: self }
    }

    pub fn set_cache_size(&self, n: usize) {
        self.cache_size.store(n as u64, Ordering::Relaxed);
    }

    pub fn set_cache_backend_errors(&self, n: u64) {
        self.cache_backend_errors.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let query_count = self.total_queries.load(Ordering::Relaxed);
        // Concurrent writers may land between the two loads.
        let cache_hits = self.cache_hits.load(Ordering::Relaxed).min(query_count);
        let latency_secs = self.latency_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        let uptime = self.started_at.elapsed().as_secs_f64();

        MetricsSnapshot {
            query_count,
            cache_hits,
            cache_misses: query_count.saturating_sub(cache_hits),
            cache_hit_ratio: cache_hits as f64 / query_count.max(1) as f64,
            concurrent_requests: self.concurrent(),
            cache_size: self.cache_size.load(Ordering::Relaxed),
            average_latency: if query_count > 0 {
                latency_secs / query_count as f64
            } else {
                0.0
            },
            uptime_seconds: uptime,
            queries_per_second: query_count as f64 / uptime.max(1.0),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            cache_backend_errors: self.cache_backend_errors.load(Ordering::Relaxed),
            outcomes: OUTCOME_SOURCES
                .iter()
                .map(|&s| {
                    (
                        s.as_str().to_string(),
                        self.outcomes[outcome_slot(s)].load(Ordering::Relaxed),
                    )
                })
                .collect(),
        }
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let mut rows: Vec<(String, bool, u64, u64, Vec<u64>)> = self
            .series
            .iter()
            .map(|entry| {
                let (company, hit) = entry.key();
                let s = entry.value();
                (
                    company.clone(),
                    *hit,
                    s.count.load(Ordering::Relaxed),
                    s.latency_micros.load(Ordering::Relaxed),
                    s.buckets
                        .iter()
                        .map(|b| b.load(Ordering::Relaxed))
                        .collect(),
                )
            })
            .collect();
        rows.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));

        out.push_str("# HELP financial_rag_queries_total Total number of financial queries\n");
        out.push_str("# TYPE financial_rag_queries_total counter\n");
        for (company, hit, count, _, _) in &rows {
            let _ = writeln!(
                out,
                "financial_rag_queries_total{{company=\"{}\",cache_hit=\"{}\"}} {}",
                escape_label(company),
                capitalized(*hit),
                count
            );
        }

        out.push_str("# HELP financial_rag_query_latency_seconds Query latency in seconds\n");
        out.push_str("# TYPE financial_rag_query_latency_seconds histogram\n");
        for (company, hit, count, micros, buckets) in &rows {
            let labels = format!(
                "company=\"{}\",cache_hit=\"{}\"",
                escape_label(company),
                capitalized(*hit)
            );
            let mut cumulative = 0u64;
            for (bound, n) in LATENCY_BUCKETS.iter().zip(buckets.iter()) {
                cumulative += n;
                let _ = writeln!(
                    out,
                    "financial_rag_query_latency_seconds_bucket{{{},le=\"{}\"}} {}",
                    labels, bound, cumulative
                );
            }
            let _ = writeln!(
                out,
                "financial_rag_query_latency_seconds_bucket{{{},le=\"+Inf\"}} {}",
                labels, count
            );
            let _ = writeln!(
                out,
                "financial_rag_query_latency_seconds_sum{{{}}} {}",
                labels,
                *micros as f64 / 1_000_000.0
            );
            let _ = writeln!(
                out,
                "financial_rag_query_latency_seconds_count{{{}}} {}",
                labels, count
            );
        }

        out.push_str("# HELP financial_rag_concurrent_requests Number of concurrent requests\n");
        out.push_str("# TYPE financial_rag_concurrent_requests gauge\n");
        let _ = writeln!(out, "financial_rag_concurrent_requests {}", self.concurrent());

        out.push_str("# HELP financial_rag_cache_size Number of items in cache\n");
        out.push_str("# TYPE financial_rag_cache_size gauge\n");
        let _ = writeln!(
            out,
            "financial_rag_cache_size {}",
            self.cache_size.load(Ordering::Relaxed)
        );

        out.push_str("# HELP financial_rag_query_outcomes_total Terminal query outcomes by answer source\n");
        out.push_str("# TYPE financial_rag_query_outcomes_total counter\n");
        for source in OUTCOME_SOURCES {
            let _ = writeln!(
                out,
                "financial_rag_query_outcomes_total{{source=\"{}\"}} {}",
                source.as_str(),
                self.outcomes[outcome_slot(source)].load(Ordering::Relaxed)
            );
        }

        out.push_str("# HELP financial_rag_rate_limited_total Requests denied by the rate limiter\n");
        out.push_str("# TYPE financial_rag_rate_limited_total counter\n");
        let _ = writeln!(
            out,
            "financial_rag_rate_limited_total {}",
            self.rate_limited.load(Ordering::Relaxed)
        );

        out.push_str("# HELP financial_rag_cache_backend_errors_total Cache backend failures treated as misses\n");
        out.push_str("# TYPE financial_rag_cache_backend_errors_total counter\n");
        let _ = writeln!(
            out,
            "financial_rag_cache_backend_errors_total {}",
            self.cache_backend_errors.load(Ordering::Relaxed)
        );

        out
    }
}

/// Scoped concurrency-gauge acquisition; decrements on drop, including
/// when the owning future is dropped mid-request.
pub struct InFlight<'a> {
    metrics: &'a MetricsCollector,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.metrics.dec_concurrent();
    }
}

fn outcome_slot(source: AnswerSource) -> usize {
    match source {
        AnswerSource::Cache => 0,
        AnswerSource::Generated => 1,
        AnswerSource::InsufficientInfo => 2,
        AnswerSource::Error => 3,
    }
}

fn capitalized(flag: bool) -> &'static str {
    if flag {
        "True"
    } else {
        "False"
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
