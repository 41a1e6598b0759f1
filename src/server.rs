//! Health endpoint and shared-secret import triggers.

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::error::{FeedError, ImportError};
use crate::import::ImportStats;
use crate::pipeline::Pipeline;
use crate::store::Store;

pub const IMPORT_TOKEN_HEADER: &str = "x-import-token";

/// Service health state
#[derive(Clone, Default)]
pub struct HealthState {
    pub last_run_time: Arc<RwLock<Option<DateTime<Utc>>>>,
    pub last_stats: Arc<RwLock<Option<ImportStats>>>,
    pub error_count: Arc<RwLock<usize>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, stats: ImportStats) {
        *self.last_run_time.write().await = Some(Utc::now());
        *self.last_stats.write().await = Some(stats);
        *self.error_count.write().await = 0;
    }

    pub async fn record_error(&self) {
        *self.error_count.write().await += 1;
    }
}

pub struct AppState<S: Store> {
    pipeline: Arc<Pipeline<S>>,
    health: HealthState,
    import_token: Option<Arc<str>>,
}

impl<S: Store> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            pipeline: self.pipeline.clone(),
            health: self.health.clone(),
            import_token: self.import_token.clone(),
        }
    }
}

impl<S: Store> AppState<S> {
    pub fn new(pipeline: Arc<Pipeline<S>>, import_token: Option<String>) -> Self {
        Self {
            pipeline,
            health: HealthState::new(),
            import_token: import_token.map(Arc::from),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<NaiveDate>,
}

pub fn router<S: Store>(state: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<S>))
        .route("/import/snapshot", post(snapshot_handler::<S>))
        .route("/import/fixtures", post(fixtures_handler::<S>))
        .route("/import/history/:club", post(history_handler::<S>))
        .with_state(state)
}

pub async fn serve<S: Store>(state: AppState<S>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("HTTP endpoint listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Health check handler
async fn health_handler<S: Store>(
    State(state): State<AppState<S>>,
) -> (StatusCode, Json<Value>) {
    let last_run = state.health.last_run_time.read().await;
    let last_stats = state.health.last_stats.read().await;
    let errors = state.health.error_count.read().await;

    let status = if *errors > 5 { "degraded" } else { "ok" };

    let http_status = if *errors > 10 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        http_status,
        Json(json!({
            "service": "ratings-ingestion",
            "version": env!("CARGO_PKG_VERSION"),
            "status": status,
            "last_run": last_run.map(|t| t.to_rfc3339()),
            "last_stats": *last_stats,
            "consecutive_errors": *errors
        })),
    )
}

async fn snapshot_handler<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Query(query): Query<DateQuery>,
) -> (StatusCode, Json<Value>) {
    if let Err(rejection) = authorize(state.import_token.as_deref(), &headers) {
        return rejection;
    }
    let result = state.pipeline.import_snapshot(query.date).await;
    respond(&state.health, "snapshot", result).await
}

async fn fixtures_handler<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Query(query): Query<DateQuery>,
) -> (StatusCode, Json<Value>) {
    if let Err(rejection) = authorize(state.import_token.as_deref(), &headers) {
        return rejection;
    }
    let result = state.pipeline.import_fixtures(query.date).await;
    respond(&state.health, "fixtures", result).await
}

async fn history_handler<S: Store>(
    State(state): State<AppState<S>>,
    headers: HeaderMap,
    Path(club): Path<String>,
) -> (StatusCode, Json<Value>) {
    if let Err(rejection) = authorize(state.import_token.as_deref(), &headers) {
        return rejection;
    }
    let result = state.pipeline.import_history(&club).await;
    respond(&state.health, "history", result).await
}

fn authorize(expected: Option<&str>, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let Some(expected) = expected else {
        return Err((
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "import triggers are disabled" })),
        ));
    };

    match headers
        .get(IMPORT_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(given) if given == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing or invalid import token" })),
        )),
    }
}

async fn respond(
    health: &HealthState,
    kind: &str,
    result: Result<ImportStats, ImportError>,
) -> (StatusCode, Json<Value>) {
    match result {
        Ok(stats) => {
            health.record_success(stats).await;
            (StatusCode::OK, Json(json!(stats)))
        }
        Err(e) => {
            health.record_error().await;
            error!("Triggered {} import failed: {}", kind, e);
            let status = match e {
                ImportError::Feed(FeedError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
                ImportError::Feed(_) => StatusCode::BAD_GATEWAY,
                ImportError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            (status, Json(json!({ "error": e.to_string() })))
        }
    }
}
