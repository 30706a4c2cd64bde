//! HTTP API server.
//!
//! Exposes the query pipeline, ingestion, rate-limit status, and metrics
//! as a JSON HTTP API.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/query` | Answer a question about one company |
//! | `POST` | `/ingest` | Ingest one report section |
//! | `POST` | `/ingest/batch` | Ingest a list of report sections |
//! | `GET`  | `/rate-limit?api_key=…` | Remaining quota for a key |
//! | `GET`  | `/metrics` | JSON metrics snapshot |
//! | `GET`  | `/metrics/prometheus` | Prometheus text exposition |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "rate_limited", "message": "rate limit exceeded, retry in 12s" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `rate_limited` (429),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use finrag_core::models::{NewDocument, QueryResult};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::ingest::{BatchReport, IngestOutcome};
use crate::metrics::MetricsSnapshot;
use crate::orchestrator::QueryOutcome;
use crate::rate_limit::{redact_key, RateLimitStatus};
use crate::service::AppServices;

/// Build services from `config` and serve until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = AppServices::from_config(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        bind = %config.server.bind,
        provider = %config.provider.kind,
        "finrag server listening"
    );

    spawn_idle_sweep(&services);

    axum::serve(listener, router(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Serve prebuilt services on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, services: AppServices) -> anyhow::Result<()> {
    spawn_idle_sweep(&services);
    axum::serve(listener, router(services)).await?;
    Ok(())
}

pub fn router(services: AppServices) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/query", post(handle_query))
        .route("/ingest", post(handle_ingest))
        .route("/ingest/batch", post(handle_ingest_batch))
        .route("/rate-limit", get(handle_rate_limit))
        .route("/metrics", get(handle_metrics))
        .route("/metrics/prometheus", get(handle_prometheus))
        .layer(cors)
        .with_state(services)
}

/// Periodically drop rate-limit logs of keys that have gone quiet.
fn spawn_idle_sweep(services: &AppServices) {
    let limiter = services.limiter.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(limiter.window());
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let forgotten = limiter.forget_idle();
            if forgotten > 0 {
                tracing::debug!(forgotten, "dropped idle rate-limit windows");
            }
        }
    });
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

fn rate_limited(status: RateLimitStatus) -> AppError {
    AppError {
        status: StatusCode::TOO_MANY_REQUESTS,
        code: "rate_limited".to_string(),
        message: format!(
            "rate limit exceeded, retry in {}s",
            status.reset_seconds
        ),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

fn check_api_key(services: &AppServices, api_key: &str) -> Result<(), AppError> {
    if api_key.chars().count() < services.config.server.min_api_key_len {
        return Err(unauthorized("Invalid API key"));
    }
    Ok(())
}

fn admit(services: &AppServices, api_key: &str) -> Result<(), AppError> {
    if services.limiter.admit(api_key) {
        Ok(())
    } else {
        Err(rate_limited(services.limiter.remaining(api_key)))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    #[serde(default)]
    company: String,
    #[serde(default)]
    question: String,
    #[serde(default)]
    api_key: String,
}

async fn handle_query(
    State(services): State<AppServices>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResult>, AppError> {
    check_api_key(&services, &req.api_key)?;
    if req.company.trim().is_empty() {
        return Err(bad_request("company must not be empty"));
    }
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    match services
        .orchestrator
        .query(&req.company, &req.question, &req.api_key)
        .await
    {
        QueryOutcome::Denied(status) => Err(rate_limited(status)),
        QueryOutcome::Answered(result) => {
            let orchestrator = services.orchestrator.clone();
            tokio::spawn(async move {
                orchestrator.sample_cache_size().await;
            });
            Ok(Json(result))
        }
    }
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    #[serde(default)]
    api_key: String,
    #[serde(flatten)]
    document: NewDocument,
}

async fn handle_ingest(
    State(services): State<AppServices>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestOutcome>, AppError> {
    check_api_key(&services, &req.api_key)?;
    admit(&services, &req.api_key)?;

    match services.ingestor.ingest(req.document).await {
        outcome @ IngestOutcome::Accepted { .. } => Ok(Json(outcome)),
        IngestOutcome::Rejected(rejection) => Err(bad_request(rejection.reason)),
        IngestOutcome::Failed { reason } => Err(internal(reason)),
    }
}

// ============ POST /ingest/batch ============

/// The first document's key authenticates and is charged for the batch.
async fn handle_ingest_batch(
    State(services): State<AppServices>,
    Json(reqs): Json<Vec<IngestRequest>>,
) -> Result<Json<BatchReport>, AppError> {
    let api_key = match reqs.first() {
        Some(first) => first.api_key.clone(),
        None => return Err(bad_request("No documents provided")),
    };
    check_api_key(&services, &api_key)?;
    admit(&services, &api_key)?;

    let docs = reqs.into_iter().map(|r| r.document).collect();
    Ok(Json(services.ingestor.ingest_batch(docs).await))
}

// ============ GET /rate-limit ============

#[derive(Deserialize)]
struct RateLimitQuery {
    #[serde(default)]
    api_key: String,
}

#[derive(Serialize)]
struct RateLimitResponse {
    api_key: String,
    remaining_requests: usize,
    reset_seconds: u64,
}

async fn handle_rate_limit(
    State(services): State<AppServices>,
    Query(params): Query<RateLimitQuery>,
) -> Result<Json<RateLimitResponse>, AppError> {
    check_api_key(&services, &params.api_key)?;
    let status = services.orchestrator.rate_limit_status(&params.api_key);
    Ok(Json(RateLimitResponse {
        api_key: redact_key(&params.api_key),
        remaining_requests: status.remaining,
        reset_seconds: status.reset_seconds,
    }))
}

// ============ GET /metrics ============

async fn handle_metrics(State(services): State<AppServices>) -> Json<MetricsSnapshot> {
    Json(services.orchestrator.metrics_snapshot())
}

async fn handle_prometheus(State(services): State<AppServices>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        services.orchestrator.render_prometheus(),
    )
}
