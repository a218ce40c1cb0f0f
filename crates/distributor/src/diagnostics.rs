use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tapglue_domain::distributor::{DistributorState, DistributorStats, StatsSnapshot};
use tapglue_domain::ports::db::DbAdapter;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::observability;

#[derive(Clone)]
pub struct DiagnosticsState {
    pub environment: String,
    pub consumer: String,
    pub state: watch::Receiver<DistributorState>,
    pub stats: Arc<DistributorStats>,
    pub db: Arc<dyn DbAdapter>,
}

pub fn router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/debug/stats", get(stats))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    environment: String,
    database: String,
}

async fn health(State(state): State<DiagnosticsState>) -> (StatusCode, Json<HealthResponse>) {
    let (code, status, database) = match state.db.health_check().await {
        Ok(()) => (StatusCode::OK, "ok", format!("{}: ok", state.db.name())),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "degraded",
            format!("{}: {err}", state.db.name()),
        ),
    };
    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            environment: state.environment.clone(),
            database,
        }),
    )
}

#[derive(Serialize)]
struct StatsResponse {
    consumer: String,
    state: DistributorState,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

async fn stats(State(state): State<DiagnosticsState>) -> Json<StatsResponse> {
    let current = *state.state.borrow();
    Json(StatsResponse {
        consumer: state.consumer.clone(),
        state: current,
        stats: state.stats.snapshot(),
    })
}

async fn metrics() -> Response {
    match observability::render_metrics() {
        Some(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
