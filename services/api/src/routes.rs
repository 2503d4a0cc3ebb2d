use crate::infra::AppState;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Extension;
use axum::Json;
use ordinal_valuation::error::AppError;
use ordinal_valuation::valuation::{AnalysisRequest, ValuationAnalysis, ValuationEngine};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

pub(crate) fn with_valuation_routes(engine: Arc<ValuationEngine>) -> axum::Router {
    axum::Router::new()
        .route("/health", axum::routing::get(healthcheck))
        .route("/ready", axum::routing::get(readiness_endpoint))
        .route("/metrics", axum::routing::get(metrics_endpoint))
        .route(
            "/api/v1/valuations",
            axum::routing::post(valuation_endpoint),
        )
        .layer(Extension(engine))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub(crate) async fn valuation_endpoint(
    Extension(engine): Extension<Arc<ValuationEngine>>,
    Json(request): Json<AnalysisRequest>,
) -> Result<Json<ValuationAnalysis>, AppError> {
    // LOO refits and the sensitivity sweep are CPU-bound
    let analysis = tokio::task::spawn_blocking(move || engine.analyze(&request))
        .await
        .map_err(std::io::Error::other)??;
    info!(
        subject = %analysis.mapping.subject,
        indicated_total = analysis.mapping.indicated_total_price,
        "valuation request served"
    );
    Ok(Json(analysis))
}
