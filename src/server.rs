//! Collector HTTP server.
//!
//! Exposes the collector event protocol and a read-only job history over a
//! JSON HTTP API. Handlers are thin: they extract the Bearer key, call into
//! [`CollectorService`], and map [`ProtocolError`] onto status codes.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/collectors` | Register a collector; returns the one-time API key |
//! | `POST` | `/collectors/events` | Submit an ordered event batch for one session |
//! | `GET`  | `/collectors/{id}` | Collector status |
//! | `POST` | `/collectors/{id}/heartbeat` | Record liveness |
//! | `GET`  | `/collectors/sessions/{session_id}` | Resumption query: `last_sequence` |
//! | `GET`  | `/jobs` | Ingestion job history |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "sequence_gap", "message": "...", "expected": 3, "received": 4 } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401),
//! `workspace_mismatch` (403), `not_found` (404), `sequence_gap` (409),
//! `sequence_conflict` (409), `session_closed` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::collector::protocol::{
    CollectorStatus, RegisterRequest, RegisterResponse, SessionStatus, SubmitRequest,
    SubmitResponse,
};
use crate::collector::{CollectorService, ProtocolError};
use crate::config::Config;
use crate::db;
use crate::models::{Collector, IngestionJob, JobStatus};
use crate::parsers::ParserRegistry;
use crate::pipeline::IngestionPipeline;
use crate::store::{JobFilter, Store};
use crate::watch::WatchScheduler;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    collectors: CollectorService,
}

/// Build the router over an existing service. Used by [`run_server`] and by
/// tests that bind to an ephemeral port.
pub fn router(collectors: CollectorService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/collectors", post(handle_register))
        .route("/collectors/events", post(handle_submit))
        .route("/collectors/sessions/{session_id}", get(handle_session))
        .route("/collectors/{id}", get(handle_status))
        .route("/collectors/{id}/heartbeat", post(handle_heartbeat))
        .route("/jobs", get(handle_jobs))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { collectors })
}

/// Start the HTTP server and, unless `with_watch` is false, the watch
/// scheduler for every active configuration. Runs until Ctrl-C, then waits
/// for in-flight watch jobs.
pub async fn run_server(config: &Config, with_watch: bool) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = Arc::new(db::open_store(config).await?);
    let pipeline = IngestionPipeline::new(
        store,
        ParserRegistry::with_builtins(),
        config.ingest.clone(),
    );

    let scheduler = if with_watch {
        let scheduler = WatchScheduler::new(pipeline.clone(), config.watch.clone())?;
        let running = scheduler.run_all().await?;
        println!("Watching {} configuration(s)", running);
        Some(scheduler)
    } else {
        None
    };

    let app = router(CollectorService::new(pipeline, config.collector.clone()));
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("Collector server listening on http://{}", bind_addr);
    tracing::info!(bind = %bind_addr, watch = with_watch, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    tracing::info!("server stopped");
    Ok(())
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
    #[serde(skip_serializing_if = "Option::is_none")]
    expected: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received: Option<i64>,
}

/// Error type that converts into an Axum HTTP response.
struct AppError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<ProtocolError> for AppError {
    fn from(err: ProtocolError) -> Self {
        let status = match &err {
            ProtocolError::Unauthorized => StatusCode::UNAUTHORIZED,
            ProtocolError::WorkspaceMismatch(_) => StatusCode::FORBIDDEN,
            ProtocolError::SequenceGap { .. }
            | ProtocolError::SequenceConflict { .. }
            | ProtocolError::SessionClosed { .. } => StatusCode::CONFLICT,
            ProtocolError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProtocolError::NotFound(_) => StatusCode::NOT_FOUND,
            ProtocolError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let (expected, received) = match &err {
            ProtocolError::SequenceGap { expected, received } => (Some(*expected), Some(*received)),
            _ => (None, None),
        };
        AppError {
            status,
            detail: ErrorDetail {
                code: err.code().to_string(),
                message: err.to_string(),
                expected,
                received,
            },
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    ProtocolError::BadRequest(message.into()).into()
}

fn internal(err: anyhow::Error) -> AppError {
    tracing::error!(error = %format!("{:#}", err), "request failed");
    ProtocolError::Internal(err).into()
}

/// `Json` body extractor whose rejections (malformed JSON, unknown event
/// types, missing fields) use the `bad_request` envelope.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(bad_request(rejection.body_text())),
        }
    }
}

/// Resolve the `Authorization: Bearer <key>` header to a collector.
async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Collector, AppError> {
    let key = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .ok_or(ProtocolError::Unauthorized)?;
    Ok(state.collectors.authenticate(key).await?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Collectors ============

async fn handle_register(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), AppError> {
    let resp = state.collectors.register(req).await?;
    Ok((StatusCode::CREATED, Json(resp)))
}

/// Handler for `POST /collectors/events`.
///
/// `200` when the batch is applied or is a pure retransmission; `409` with
/// `expected`/`received` on a sequence gap.
async fn handle_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(req): ApiJson<SubmitRequest>,
) -> Result<Json<SubmitResponse>, AppError> {
    let collector = authenticate(&state, &headers).await?;
    Ok(Json(state.collectors.submit(&collector, req).await?))
}

async fn handle_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Result<Json<SessionStatus>, AppError> {
    let collector = authenticate(&state, &headers).await?;
    Ok(Json(
        state
            .collectors
            .session_status(&collector, &session_id)
            .await?,
    ))
}

async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CollectorStatus>, AppError> {
    let collector = authenticate(&state, &headers).await?;
    Ok(Json(state.collectors.status(&collector, &id).await?))
}

async fn handle_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<CollectorStatus>, AppError> {
    let collector = authenticate(&state, &headers).await?;
    Ok(Json(state.collectors.heartbeat(&collector, &id).await?))
}

// ============ GET /jobs ============

#[derive(Deserialize)]
struct JobsQuery {
    status: Option<String>,
    watch_config_id: Option<String>,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct JobsResponse {
    jobs: Vec<IngestionJob>,
}

async fn handle_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobsResponse>, AppError> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            s.parse::<JobStatus>()
                .map_err(|_| bad_request(format!("unknown job status: {}", s)))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        status,
        watch_config_id: query.watch_config_id,
        limit: Some(query.limit.unwrap_or(50).clamp(1, 1000)),
    };
    let jobs = state
        .collectors
        .pipeline()
        .store()
        .list_jobs(&filter)
        .await
        .map_err(internal)?;
    Ok(Json(JobsResponse { jobs }))
}
