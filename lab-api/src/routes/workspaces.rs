use crate::{
    auth::AuthenticatedUser,
    error::{ApiResult, ErrorBody},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use lab_orchestrator::{Action, Workspace, WorkspaceStatus};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/workspaces",
            get(list_workspaces).post(create_workspace),
        )
        .route(
            "/api/v1/workspaces/{id}",
            get(get_workspace).delete(archive_workspace),
        )
        .route("/api/v1/workspaces/{id}/deploy", post(start_deploy))
        .route("/api/v1/workspaces/{id}/destroy", post(start_destroy))
        .route("/api/v1/workspaces/{id}/plan", post(start_plan))
        .route("/api/v1/workspaces/{id}/action", get(action_status))
        .route("/api/v1/workspaces/{id}/history", get(action_history))
}

/// Body of `POST /api/v1/workspaces`; the owner is the authenticated caller.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NewWorkspace {
    pub lab_id: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkspacesQuery {
    status: Option<WorkspaceStatus>,
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    request_body = NewWorkspace,
    responses(
        (status = 201, description = "Workspace registered", body = Workspace),
        (status = 400, description = "Invalid lab or region", body = ErrorBody),
    )
)]
pub async fn create_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(req): Json<NewWorkspace>,
) -> ApiResult<(StatusCode, Json<Workspace>)> {
    let workspace = state
        .service
        .create_workspace(&user.username, &req.lab_id, &req.region)
        .await?;

    Ok((StatusCode::CREATED, Json(workspace)))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces",
    tag = "workspaces",
    params(("status" = Option<WorkspaceStatus>, Query, description = "Filter by status")),
    responses((status = 200, description = "The caller's workspaces", body = [Workspace]))
)]
pub async fn list_workspaces(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<WorkspacesQuery>,
) -> ApiResult<Json<Vec<Workspace>>> {
    let workspaces = state
        .service
        .list_workspaces(&user.username, query.status)
        .await?;

    Ok(Json(workspaces))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, description = "Workspace", body = Workspace),
        (status = 403, description = "Owned by another user", body = ErrorBody),
        (status = 404, description = "Unknown workspace", body = ErrorBody),
    )
)]
pub async fn get_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    let workspace = state.service.get_workspace(&user.username, &id).await?;

    Ok(Json(workspace))
}

/// Archive the workspace. Refused while an action runs or a deployment exists.
#[utoipa::path(
    delete,
    path = "/api/v1/workspaces/{id}",
    tag = "workspaces",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, description = "Workspace archived", body = Workspace),
        (status = 400, description = "Workspace still has a deployment", body = ErrorBody),
        (status = 409, description = "An action is running", body = ErrorBody),
    )
)]
pub async fn archive_workspace(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Workspace>> {
    let workspace = state.service.archive_workspace(&user.username, &id).await?;

    Ok(Json(workspace))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/deploy",
    tag = "actions",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 202, description = "Deploy admitted", body = Action),
        (status = 409, description = "Another action holds the workspace", body = ErrorBody),
    )
)]
pub async fn start_deploy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let action = state.service.start_deploy(&user.username, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(action)))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/destroy",
    tag = "actions",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 202, description = "Destroy admitted", body = Action),
        (status = 409, description = "Another action holds the workspace", body = ErrorBody),
    )
)]
pub async fn start_destroy(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let action = state.service.start_destroy(&user.username, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(action)))
}

#[utoipa::path(
    post,
    path = "/api/v1/workspaces/{id}/plan",
    tag = "actions",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 202, description = "Plan admitted", body = Action),
        (status = 409, description = "Another action holds the workspace", body = ErrorBody),
    )
)]
pub async fn start_plan(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Action>)> {
    let action = state.service.start_plan(&user.username, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(action)))
}

/// Latest action on the workspace, running or finished.
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/action",
    tag = "actions",
    params(("id" = String, Path, description = "Workspace id")),
    responses(
        (status = 200, description = "Current action state", body = Action),
        (status = 404, description = "No action yet", body = ErrorBody),
    )
)]
pub async fn action_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Action>> {
    let action = state.service.action_status(&user.username, &id).await?;
    Ok(Json(action))
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/history",
    tag = "actions",
    params(("id" = String, Path, description = "Workspace id")),
    responses((status = 200, description = "Archived actions, newest first", body = [Action]))
)]
pub async fn action_history(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Action>>> {
    let actions = state.service.archived_actions(&user.username, &id).await?;
    Ok(Json(actions))
}
