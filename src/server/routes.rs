// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use super::error::AppError;
use crate::coordinator::{
    Resolution, ScheduledSummary, StatusReport, SyncOrchestrator, SyncStatistics, TriggerResponse,
};
use crate::entity::SyncType;
use crate::ledger::{ResolutionStrategy, SyncConflict, SyncRun};
use crate::resilience::gate::GateStats;

/// Upper bound for `limit` query parameters
const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sync/trigger", post(trigger))
        .route("/sync/scheduled", post(scheduled))
        .route("/sync/status", get(status))
        .route("/sync/stats", get(stats))
        .route("/sync/runs", get(runs))
        .route("/sync/conflicts", get(conflicts))
        .route("/sync/conflicts/{id}/resolve", post(resolve))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `{"success": true, ...fields of T}`
#[derive(Debug, Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(flatten)]
    data: T,
}

fn ok<T>(data: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, data })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    running: bool,
    gate: GateStats,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        running: state.orchestrator.is_running(),
        gate: state.orchestrator.gate_stats(),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TriggerRequest {
    account_id: Option<String>,
    sync_type: Option<String>,
}

async fn trigger(
    State(state): State<AppState>,
    body: Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<Json<TriggerResponse>, AppError> {
    let Json(request) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    let account_id = request
        .account_id
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::bad_request("accountId is required"))?;
    let sync_type = match request.sync_type.as_deref() {
        None => SyncType::All,
        Some(raw) => raw.parse().map_err(|e: crate::entity::UnknownEntityType| AppError::bad_request(e.to_string()))?,
    };

    Ok(Json(state.orchestrator.trigger(&account_id, sync_type).await?))
}

async fn scheduled(State(state): State<AppState>) -> Result<Json<Envelope<ScheduledSummary>>, AppError> {
    let summary = state.orchestrator.run_scheduled().await?;
    Ok(Json(Envelope { success: summary.is_success(), data: summary }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    limit: Option<usize>,
    account_id: Option<String>,
}

impl ListParams {
    fn limit(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).clamp(1, MAX_LIMIT)
    }
}

async fn status(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Envelope<StatusReport>>, AppError> {
    let limit = params.limit(state.orchestrator.config().status_limit);
    Ok(ok(state.orchestrator.status(limit).await?))
}

async fn stats(State(state): State<AppState>) -> Result<Json<Envelope<SyncStatistics>>, AppError> {
    Ok(ok(state.orchestrator.statistics().await?))
}

#[derive(Debug, Serialize)]
struct RunList {
    runs: Vec<SyncRun>,
}

async fn runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Envelope<RunList>>, AppError> {
    let limit = params.limit(20);
    let runs = state.orchestrator.recent_runs(params.account_id.as_deref(), limit).await?;
    Ok(ok(RunList { runs }))
}

#[derive(Debug, Serialize)]
struct ConflictList {
    conflicts: Vec<SyncConflict>,
}

async fn conflicts(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Envelope<ConflictList>>, AppError> {
    let limit = params.limit(state.orchestrator.config().status_limit);
    let conflicts = state.orchestrator.pending_conflicts(limit).await?;
    Ok(ok(ConflictList { conflicts }))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    strategy: ResolutionStrategy,
}

async fn resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<Envelope<Resolution>>, AppError> {
    let Json(request) = body.map_err(|e| AppError::bad_request(e.body_text()))?;
    Ok(ok(state.orchestrator.resolve_conflict(&id, request.strategy).await?))
}
