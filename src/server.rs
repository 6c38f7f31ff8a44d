use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    engine::{ScanEngine, ScanRequest},
    error::EngineError,
    target::Target,
    task::TaskId,
    types::{ScanTemplate, ScanType},
};

#[derive(Clone)]
pub struct AppState {
    engine: Arc<ScanEngine>,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequestBody {
    pub target: String,
    #[serde(default)]
    pub scan_type: ScanType,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub ports: Option<String>,
    /// Reject malformed targets instead of scanning them as literals.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanAccepted {
    pub task_id: TaskId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub cancelled: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

pub fn router(engine: Arc<ScanEngine>) -> Router {
    let api = Router::new()
        .route("/scans", post(post_scan))
        .route("/scans/{id}", get(get_scan))
        .route("/scans/{id}/cancel", post(cancel_scan))
        .route("/scans/{id}/discoveries", get(get_discoveries))
        .with_state(AppState { engine });

    Router::new()
        .nest("/api", api)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

pub async fn spawn_server(bind: &str, engine: Arc<ScanEngine>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving scan API");
    axum::serve(listener, router(engine)).await?;
    Ok(())
}

async fn post_scan(State(app): State<AppState>, Json(req): Json<ScanRequestBody>) -> Response {
    if req.strict {
        if let Err(e) = Target::parse_strict(&req.target) {
            return error_response(e);
        }
    }

    let mut template = ScanTemplate::new(req.scan_type);
    template.timeout = req.timeout_ms.map(Duration::from_millis);
    template.ports = req.ports;

    let request = ScanRequest {
        target: req.target,
        template,
        max_concurrency: req.concurrency,
    };
    match app.engine.start_scan_with(request).await {
        Ok(task_id) => (StatusCode::ACCEPTED, Json(ScanAccepted { task_id })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_scan(State(app): State<AppState>, Path(id): Path<u64>) -> Response {
    match app.engine.get_progress(TaskId(id)).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cancel_scan(State(app): State<AppState>, Path(id): Path<u64>) -> Response {
    match app.engine.request_cancel(TaskId(id)).await {
        Ok(cancelled) => (StatusCode::OK, Json(CancelOutcome { cancelled })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_discoveries(State(app): State<AppState>, Path(id): Path<u64>) -> Response {
    match app.engine.discoveries(TaskId(id)).await {
        Ok(list) => (StatusCode::OK, Json(list)).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(e: EngineError) -> Response {
    let status = match e {
        EngineError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::EmptyTarget
        | EngineError::InvalidTarget(_)
        | EngineError::TargetTooLarge { .. }
        | EngineError::InvalidTemplate(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: e.to_string() })).into_response()
}
