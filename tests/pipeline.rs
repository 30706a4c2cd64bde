use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use finrag::audit::{AuditLog, NoopAuditLog, QueryAudit};
use finrag::cache::{CacheBackend, CacheError, MemoryCacheBackend};
use finrag::config::Config;
use finrag::ingest::IngestOutcome;
use finrag::orchestrator::{insufficient_info_answer, QueryOutcome, ERROR_ANSWER};
use finrag::provider::Providers;
use finrag::service::AppServices;
use finrag_core::embedding::{AnswerGenerator, EmbeddingClient, ProviderError};
use finrag_core::index::memory::InMemoryVectorIndex;
use finrag_core::models::{AnswerSource, DocumentMetadata, NewDocument, QueryResult};

// ============ Fakes ============

/// Returns a fixed vector per (lower-cased, trimmed) text and counts calls.
struct FakeEmbedder {
    vectors: HashMap<String, Vec<f32>>,
    default: Vec<f32>,
    calls: AtomicUsize,
}

impl FakeEmbedder {
    fn new() -> Self {
        Self {
            vectors: HashMap::new(),
            default: vec![1.0, 0.0],
            calls: AtomicUsize::new(0),
        }
    }

    fn with(mut self, text: &str, vector: Vec<f32>) -> Self {
        self.vectors.insert(text.trim().to_lowercase(), vector);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingClient for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedder"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.contains("FAIL") {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        Ok(self
            .vectors
            .get(&text.trim().to_lowercase())
            .cloned()
            .unwrap_or_else(|| self.default.clone()))
    }
}

#[derive(Clone, Copy)]
enum GenMode {
    Answer,
    Fail,
    Hang,
    Slow,
}

struct FakeGenerator {
    mode: GenMode,
    calls: AtomicUsize,
}

impl FakeGenerator {
    fn new(mode: GenMode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnswerGenerator for FakeGenerator {
    fn model_name(&self) -> &str {
        "fake-generator"
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            GenMode::Answer => Ok(format!("answer to '{}' from {} chars", question, context.len())),
            GenMode::Fail => Err(ProviderError::Http {
                status: 500,
                body: "upstream exploded".into(),
            }),
            GenMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("too late".into())
            }
            GenMode::Slow => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok("slow answer".into())
            }
        }
    }
}

/// Memory backend that records every write and its TTL.
struct RecordingBackend {
    inner: MemoryCacheBackend,
    writes: Mutex<Vec<(String, Duration)>>,
}

impl RecordingBackend {
    fn new() -> Self {
        Self {
            inner: MemoryCacheBackend::new(),
            writes: Mutex::new(Vec::new()),
        }
    }

    fn writes(&self) -> Vec<(String, Duration)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheBackend for RecordingBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.writes.lock().unwrap().push((key.to_string(), ttl));
        self.inner.set_with_ttl(key, value, ttl).await
    }

    async fn len(&self) -> Result<usize, CacheError> {
        self.inner.len().await
    }
}

struct DownBackend;

#[async_trait]
impl CacheBackend for DownBackend {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn set_with_ttl(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }

    async fn len(&self) -> Result<usize, CacheError> {
        Err(CacheError::Unavailable("connection refused".into()))
    }
}

struct FailingAudit;

#[async_trait]
impl AuditLog for FailingAudit {
    async fn record_document(&self, _id: &str, _metadata: &DocumentMetadata) -> anyhow::Result<()> {
        anyhow::bail!("database is locked")
    }

    async fn record_query(&self, _entry: &QueryAudit) -> anyhow::Result<()> {
        anyhow::bail!("database is locked")
    }
}

// ============ Harness ============

struct Harness {
    services: AppServices,
    embedder: Arc<FakeEmbedder>,
    generator: Arc<FakeGenerator>,
    backend: Arc<RecordingBackend>,
}

fn harness(config: Config, embedder: FakeEmbedder, mode: GenMode) -> Harness {
    harness_with(config, embedder, mode, Arc::new(NoopAuditLog))
}

fn harness_with(
    config: Config,
    embedder: FakeEmbedder,
    mode: GenMode,
    audit: Arc<dyn AuditLog>,
) -> Harness {
    let embedder = Arc::new(embedder);
    let generator = Arc::new(FakeGenerator::new(mode));
    let backend = Arc::new(RecordingBackend::new());
    let services = AppServices::with_parts(
        &config,
        Arc::new(InMemoryVectorIndex::new()),
        backend.clone(),
        Providers {
            embedder: embedder.clone(),
            generator: generator.clone(),
        },
        audit,
    );
    Harness {
        services,
        embedder,
        generator,
        backend,
    }
}

fn report(company: &str, content: &str) -> NewDocument {
    NewDocument {
        company: Some(company.to_string()),
        report_type: Some("Annual Report".to_string()),
        report_date: Some("2023-12-31".to_string()),
        section: Some("Revenue".to_string()),
        content: Some(content.to_string()),
    }
}

async fn ask(h: &Harness, company: &str, question: &str) -> QueryResult {
    match h
        .services
        .orchestrator
        .query(company, question, "tenant-key-0001")
        .await
    {
        QueryOutcome::Answered(result) => result,
        QueryOutcome::Denied(status) => panic!("unexpected denial: {:?}", status),
    }
}

// ============ Tests ============

#[tokio::test]
async fn test_repeat_query_is_served_from_cache_without_provider_calls() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    let outcome = h.services.ingestor.ingest(report("Apple", "Revenue grew 8%.")).await;
    assert!(outcome.is_accepted());
    assert_eq!(h.embedder.calls(), 1);

    let first = ask(&h, "Apple", "What is Revenue?").await;
    assert_eq!(first.source, AnswerSource::Generated);
    assert_eq!(h.embedder.calls(), 2);
    assert_eq!(h.generator.calls(), 1);

    let second = ask(&h, "Apple", " what is revenue? ").await;
    assert_eq!(second.source, AnswerSource::Cache);
    assert_eq!(second.answer, first.answer);
    assert_eq!(h.embedder.calls(), 2);
    assert_eq!(h.generator.calls(), 1);

    let snap = h.services.orchestrator.metrics_snapshot();
    assert_eq!(snap.query_count, 2);
    assert_eq!(snap.cache_hits, 1);
    assert_eq!(snap.cache_hit_ratio, 0.5);
}

#[tokio::test]
async fn test_score_below_floor_short_circuits_without_cache_write() {
    // cos([1, 0], [0.65, 0.7599...]) = 0.65
    let weak = vec![0.65, (1.0f32 - 0.65 * 0.65).sqrt()];
    let embedder = FakeEmbedder::new().with("how many employees?", weak);
    let h = harness(Config::default(), embedder, GenMode::Answer);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    let result = ask(&h, "Apple", "How many employees?").await;
    assert_eq!(result.source, AnswerSource::InsufficientInfo);
    assert_eq!(result.answer, insufficient_info_answer("Apple"));
    assert_eq!(h.generator.calls(), 0);
    assert!(h.backend.writes().is_empty());

    let snap = h.services.orchestrator.metrics_snapshot();
    assert_eq!(snap.query_count, 0);
    assert_eq!(snap.outcomes["insufficient_info"], 1);
}

#[tokio::test]
async fn test_temporal_marker_selects_short_ttl() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    ask(&h, "Apple", "What is the current revenue?").await;
    ask(&h, "Apple", "What is the revenue?").await;

    let writes = h.backend.writes();
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].1, Duration::from_secs(3600));
    assert_eq!(writes[1].1, Duration::from_secs(86400));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_gauge_returns_to_zero_after_burst() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Slow);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let orchestrator = h.services.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .query("Apple", &format!("question {}", i), &format!("tenant-key-{:04}", i))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let snap = h.services.orchestrator.metrics_snapshot();
    assert_eq!(snap.concurrent_requests, 0);
    assert_eq!(snap.query_count, 32);
}

#[tokio::test]
async fn test_gauge_released_when_request_is_cancelled() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Hang);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    let orchestrator = h.services.orchestrator.clone();
    let task = tokio::spawn(async move {
        orchestrator.query("Apple", "anything", "tenant-key-0001").await
    });
    while h.generator.calls() == 0 {
        tokio::task::yield_now().await;
    }
    assert_eq!(h.services.orchestrator.metrics_snapshot().concurrent_requests, 1);

    task.abort();
    let _ = task.await;
    assert_eq!(h.services.orchestrator.metrics_snapshot().concurrent_requests, 0);
}

#[tokio::test]
async fn test_other_tenant_documents_are_never_retrieved() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    h.services
        .ingestor
        .ingest(report("Tesla", "Tesla delivered 1.8M vehicles."))
        .await;

    let hits = h
        .services
        .index
        .query(&[1.0, 0.0], "Apple", 10)
        .await
        .unwrap();
    assert!(hits.is_empty());

    let result = ask(&h, "Apple", "How many vehicles were delivered?").await;
    assert_eq!(result.source, AnswerSource::InsufficientInfo);
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test]
async fn test_separator_in_company_name_does_not_share_cached_answers() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    h.services
        .ingestor
        .ingest(report("Acme:secret", "Revenue was $12M."))
        .await;

    let first = ask(&h, "Acme:secret", "revenue?").await;
    assert_eq!(first.source, AnswerSource::Generated);

    let second = ask(&h, "Acme", "secret:revenue?").await;
    assert_eq!(second.source, AnswerSource::InsufficientInfo);
    assert_eq!(second.answer, insufficient_info_answer("Acme"));
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn test_provider_error_becomes_error_result_and_is_not_cached() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Fail);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    let result = ask(&h, "Apple", "What is revenue?").await;
    assert_eq!(result.source, AnswerSource::Error);
    assert_eq!(result.answer, ERROR_ANSWER);
    assert!(result.error.as_deref().unwrap_or_default().contains("500"));
    assert!(h.backend.writes().is_empty());

    ask(&h, "Apple", "What is revenue?").await;
    assert_eq!(h.generator.calls(), 2);
    assert_eq!(h.services.orchestrator.metrics_snapshot().outcomes["error"], 2);
}

#[tokio::test]
async fn test_embedding_failure_becomes_error_result() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    let result = ask(&h, "Apple", "FAIL please").await;
    assert_eq!(result.source, AnswerSource::Error);
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_hung_provider_hits_deadline() {
    let mut config = Config::default();
    config.provider.timeout_secs = 2;
    let h = harness(config, FakeEmbedder::new(), GenMode::Hang);
    h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    let result = ask(&h, "Apple", "What is revenue?").await;
    assert_eq!(result.source, AnswerSource::Error);
    assert!(result.error.unwrap().contains("generation timed out"));
    assert!(result.latency_seconds >= 2.0);
    assert!(result.latency_seconds < 3.0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_denies_without_running_pipeline() {
    let mut config = Config::default();
    config.rate_limit.max_requests = 2;
    config.rate_limit.window_seconds = 30;
    let h = harness(config, FakeEmbedder::new(), GenMode::Answer);

    for q in ["q1", "q2"] {
        let outcome = h
            .services
            .orchestrator
            .query("Apple", q, "tenant-key-0001")
            .await;
        assert!(matches!(outcome, QueryOutcome::Answered(_)));
    }
    let calls_before = h.embedder.calls();

    match h
        .services
        .orchestrator
        .query("Apple", "q3", "tenant-key-0001")
        .await
    {
        QueryOutcome::Denied(status) => {
            assert_eq!(status.remaining, 0);
            assert_eq!(status.reset_seconds, 30);
        }
        QueryOutcome::Answered(r) => panic!("expected denial, got {:?}", r),
    }
    assert_eq!(h.embedder.calls(), calls_before);
    assert_eq!(h.services.orchestrator.metrics_snapshot().rate_limited, 1);

    // Other keys are unaffected.
    let other = h
        .services
        .orchestrator
        .query("Apple", "q3", "tenant-key-0002")
        .await;
    assert!(matches!(other, QueryOutcome::Answered(_)));

    tokio::time::advance(Duration::from_secs(30)).await;
    let again = h
        .services
        .orchestrator
        .query("Apple", "q4", "tenant-key-0001")
        .await;
    assert!(matches!(again, QueryOutcome::Answered(_)));
}

#[tokio::test]
async fn test_cache_outage_degrades_to_regeneration() {
    let config = Config::default();
    let embedder = Arc::new(FakeEmbedder::new());
    let generator = Arc::new(FakeGenerator::new(GenMode::Answer));
    let services = AppServices::with_parts(
        &config,
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(DownBackend),
        Providers {
            embedder: embedder.clone(),
            generator: generator.clone(),
        },
        Arc::new(NoopAuditLog),
    );
    services.ingestor.ingest(report("Apple", "Revenue grew.")).await;

    for _ in 0..2 {
        match services
            .orchestrator
            .query("Apple", "What is revenue?", "tenant-key-0001")
            .await
        {
            QueryOutcome::Answered(r) => assert_eq!(r.source, AnswerSource::Generated),
            QueryOutcome::Denied(_) => panic!("unexpected denial"),
        }
    }
    assert_eq!(generator.calls(), 2);

    services.orchestrator.sample_cache_size().await;
    let snap = services.orchestrator.metrics_snapshot();
    // two gets, two sets, one size sample
    assert_eq!(snap.cache_backend_errors, 5);
    assert_eq!(snap.cache_size, 0);
}

#[tokio::test]
async fn test_audit_failures_do_not_change_results() {
    let h = harness_with(
        Config::default(),
        FakeEmbedder::new(),
        GenMode::Answer,
        Arc::new(FailingAudit),
    );
    let outcome = h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await;
    assert!(outcome.is_accepted());

    let result = ask(&h, "Apple", "What is revenue?").await;
    assert_eq!(result.source, AnswerSource::Generated);
}

#[tokio::test]
async fn test_invalid_document_is_rejected_before_any_work() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    let outcome = h
        .services
        .ingestor
        .ingest(NewDocument {
            company: Some("Apple".to_string()),
            ..NewDocument::default()
        })
        .await;

    match outcome {
        IngestOutcome::Rejected(rejection) => {
            assert_eq!(
                rejection.missing_fields,
                vec!["report_type", "report_date", "content"]
            );
        }
        other => panic!("expected rejection, got {:?}", other),
    }
    assert_eq!(h.embedder.calls(), 0);
    assert_eq!(h.services.index.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_batch_reports_partial_failure_without_rollback() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    let batch = vec![
        report("Apple", "Revenue grew."),
        report("Apple", "FAIL to embed this one"),
        NewDocument::default(),
        report("Tesla", "Deliveries rose."),
    ];

    let report = h.services.ingestor.ingest_batch(batch).await;
    assert_eq!(report.total_documents, 4);
    assert_eq!(report.successful, 2);
    assert_eq!(report.failed, 2);
    assert!(report.outcomes[0].is_accepted());
    assert!(matches!(report.outcomes[1], IngestOutcome::Failed { .. }));
    assert!(matches!(report.outcomes[2], IngestOutcome::Rejected(_)));
    assert!(report.outcomes[3].is_accepted());
    assert_eq!(h.services.index.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_document_id_format() {
    let h = harness(Config::default(), FakeEmbedder::new(), GenMode::Answer);
    match h.services.ingestor.ingest(report("Apple", "Revenue grew.")).await {
        IngestOutcome::Accepted { document_id } => {
            let prefix = "Apple_Annual Report_2023-12-31_";
            assert!(document_id.starts_with(prefix));
            let suffix = &document_id[prefix.len()..];
            assert_eq!(suffix.len(), 8);
            assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        }
        other => panic!("expected acceptance, got {:?}", other),
    }
}
