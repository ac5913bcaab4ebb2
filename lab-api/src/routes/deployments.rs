use crate::{auth::AuthenticatedUser, error::ApiResult, state::AppState};
use axum::{extract::State, routing::get, Extension, Json, Router};
use lab_orchestrator::Deployment;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/deployments", get(list_deployments))
}

#[utoipa::path(
    get,
    path = "/api/v1/deployments",
    tag = "deployments",
    responses((status = 200, description = "The caller's live deployments", body = [Deployment]))
)]
pub async fn list_deployments(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> ApiResult<Json<Vec<Deployment>>> {
    let deployments = state.service.list_deployments(&user.username).await?;

    Ok(Json(deployments))
}
