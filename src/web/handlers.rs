//! HTTP request handlers.

use super::AppState;
use crate::db::{CheckSpec, DbError, MonitoredTarget};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;

// ============================================================================
// API: Targets
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_targets() {
        Ok(targets) => Json(targets).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TargetRequest {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

fn validate_target(req: &TargetRequest) -> Result<(), &'static str> {
    if req.name.trim().is_empty() {
        return Err("Name must not be empty");
    }
    if req.address.trim().is_empty() {
        return Err("Address must not be empty");
    }
    if req.checks.is_empty() {
        return Err("At least one check is required");
    }
    Ok(())
}

pub async fn handle_create_target(
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_target(&req) {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    let mut target = MonitoredTarget {
        id: 0,
        name: req.name,
        address: req.address,
        checks: req.checks,
        enabled: req.enabled,
    };

    match state.store.add_target(&mut target) {
        Ok(_) => Json(target).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_update_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<TargetRequest>,
) -> impl IntoResponse {
    if let Err(e) = validate_target(&req) {
        return (StatusCode::BAD_REQUEST, e).into_response();
    }

    if let Err(DbError::NotFound) = state.store.get_target(id) {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    let updated = MonitoredTarget {
        id,
        name: req.name,
        address: req.address,
        checks: req.checks,
        enabled: req.enabled,
    };

    match state.store.update_target(&updated) {
        Ok(_) => Json(updated).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    // Engine state goes first so a concurrent batch cannot resurrect it.
    state.engine.remove_target(id).await;

    match state.store.delete_target(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_enable_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    set_enabled(&state, id, true).await
}

pub async fn handle_disable_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    set_enabled(&state, id, false).await
}

async fn set_enabled(state: &AppState, id: i64, enabled: bool) -> axum::response::Response {
    if let Err(DbError::NotFound) = state.store.get_target(id) {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    // Membership changes take effect on the next probe cycle.
    match state.store.set_enabled(id, enabled) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Health
// ============================================================================

pub async fn handle_get_target_health(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    match state.engine.health(id).await {
        Some(health) => Json(health).into_response(),
        None => (StatusCode::NOT_FOUND, "No health state for target").into_response(),
    }
}

pub async fn handle_get_fleet_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.all_health().await)
}

// ============================================================================
// API: History and events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(500).clamp(1, 5000);

    if let Err(DbError::NotFound) = state.store.get_target(id) {
        return (StatusCode::NOT_FOUND, "Target not found").into_response();
    }

    match state.store.get_check_results(id, limit) {
        Ok(results) => Json(results).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

pub async fn handle_get_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.recent_events().await)
}
