//! HTTP surface of the serving process.

use super::service::{InferenceService, Prediction};
use crate::error::{CanariaError, Result};
use crate::lifecycle::{RebalanceMode, RebalanceReport, Rebalancer, StatusStateMachine};
use crate::types::{ModelStatus, Run, RunId, Scope};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InferenceService>,
    pub machine: Arc<StatusStateMachine>,
    pub rebalancer: Arc<Rebalancer>,
    pub scope: Scope,
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    pub features: Vec<f32>,
}

#[derive(Debug, Deserialize)]
pub struct RebalanceRequest {
    pub weights: BTreeMap<RunId, f64>,
    /// Restrict the rebalance to one live status and keep it.
    #[serde(default)]
    pub cohort: Option<ModelStatus>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<RebalanceReport>,
}

impl IntoResponse for CanariaError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let error = self.to_string();
        let report = match self {
            CanariaError::PartialRebalance(report) => Some(*report),
            _ => None,
        };
        (status, Json(ErrorBody { error, report })).into_response()
    }
}

/// Builds the router. `/metrics` is mounted only when a recorder handle is given.
pub fn router(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    let app = Router::new()
        .route("/predict", post(predict))
        .route("/health", get(health))
        .route("/reload", post(reload))
        .route("/admin/rebalance", post(rebalance))
        .route("/admin/runs/:id/enable", post(enable))
        .route("/admin/runs/:id/disable", post(disable))
        .route("/admin/runs/:id/canary", post(canary))
        .with_state(state);

    match metrics {
        Some(handle) => app.route("/metrics", get(move || std::future::ready(handle.render()))),
        None => app,
    }
}

async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<Prediction>> {
    state.service.predict(&request.features).await.map(Json)
}

async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.service.health().await {
        (StatusCode::OK, "Ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
    }
}

async fn reload(State(state): State<AppState>) -> Json<bool> {
    Json(state.service.reload().await)
}

async fn rebalance(
    State(state): State<AppState>,
    Json(request): Json<RebalanceRequest>,
) -> Result<Json<RebalanceReport>> {
    let mode = match request.cohort {
        Some(status) => RebalanceMode::Cohort(status),
        None => RebalanceMode::Promote,
    };
    info!(weights = ?request.weights, ?mode, "Rebalance requested");
    let result = state
        .rebalancer
        .rebalance(&request.weights, &state.scope, mode)
        .await;
    // Partial writes are visible too.
    state.service.reload().await;
    result.map(Json)
}

async fn enable(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Run>> {
    let result = state.machine.enable(&id).await;
    finish_transition(&state, &id, ModelStatus::Active, result).await
}

async fn disable(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Run>> {
    let result = state.machine.disable(&id).await;
    finish_transition(&state, &id, ModelStatus::Disabled, result).await
}

async fn canary(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Run>> {
    let result = state.machine.canary(&id).await;
    finish_transition(&state, &id, ModelStatus::Canary, result).await
}

async fn finish_transition(
    state: &AppState,
    run_id: &str,
    status: ModelStatus,
    result: Result<Run>,
) -> Result<Json<Run>> {
    if let Err(ref e) = result {
        warn!(run_id = %run_id, %status, error = %e, "Transition failed");
    }
    state.service.reload().await;
    result.map(Json)
}
