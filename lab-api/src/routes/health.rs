use crate::state::AppState;
use axum::{extract::State, routing::get, Json, Router};
use lab_orchestrator::ActionFilter;
use serde_json::{json, Value};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
}

/// Service status and version.
#[utoipa::path(
    get,
    path = "/status",
    tag = "health",
    responses((status = 200, description = "Service status"))
)]
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let active = state
        .service
        .gate()
        .registry()
        .list(&ActionFilter {
            active_only: true,
            ..Default::default()
        })
        .await
        .map(|actions| actions.len())
        .ok();

    Json(json!({
        "status": "ok",
        "service": "lab-api",
        "version": env!("CARGO_PKG_VERSION"),
        "registry": state.registry_backend,
        "active_actions": active,
    }))
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses((status = 200, description = "Liveness"))
)]
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "lab-api",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses((status = 200, description = "Readiness including database"))
)]
pub async fn readiness_check(State(state): State<AppState>) -> Json<Value> {
    // Check database connectivity
    let db_ok = sqlx::query("SELECT 1").fetch_one(&state.pool).await.is_ok();

    Json(json!({
        "status": if db_ok { "ready" } else { "not_ready" },
        "service": "lab-api",
        "version": env!("CARGO_PKG_VERSION"),
        "database": if db_ok { "connected" } else { "disconnected" }
    }))
}
