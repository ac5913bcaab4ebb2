use crate::{
    auth::AuthenticatedUser,
    error::{ApiResult, ErrorBody},
    state::AppState,
};
use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Extension, Json, Router,
};
use lab_orchestrator::{Action, ActionFilter, ActionKey, ActionKind, ActionState, ActionToken};
use serde::Deserialize;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/actions", get(list_actions))
        .route("/api/v1/actions/{token}", get(get_action))
        .route("/api/v1/actions/{token}/cancel", post(cancel_action))
}

#[derive(Debug, Deserialize)]
pub struct ActionsQuery {
    workspace_id: Option<String>,
    kind: Option<ActionKind>,
    state: Option<ActionState>,
    #[serde(default)]
    active: bool,
}

#[utoipa::path(
    get,
    path = "/api/v1/actions",
    tag = "actions",
    params(
        ("workspace_id" = Option<String>, Query, description = "Only this workspace"),
        ("kind" = Option<ActionKind>, Query, description = "deploy, destroy or plan"),
        ("state" = Option<ActionState>, Query, description = "Filter by state"),
        ("active" = Option<bool>, Query, description = "Only pending or running actions"),
    ),
    responses((status = 200, description = "The caller's actions, newest first", body = [Action]))
)]
pub async fn list_actions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Query(query): Query<ActionsQuery>,
) -> ApiResult<Json<Vec<Action>>> {
    let filter = ActionFilter {
        key: query
            .workspace_id
            .map(|ws| ActionKey::for_workspace(&user.username, &ws)),
        kind: query.kind,
        state: query.state,
        active_only: query.active,
    };

    let actions = state.service.list_actions(&user.username, filter).await?;

    Ok(Json(actions))
}

#[utoipa::path(
    get,
    path = "/api/v1/actions/{token}",
    tag = "actions",
    params(("token" = String, Path, description = "Action token")),
    responses(
        (status = 200, description = "Action", body = Action),
        (status = 404, description = "Unknown or archived action", body = ErrorBody),
    )
)]
pub async fn get_action(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(token): Path<String>,
) -> ApiResult<Json<Action>> {
    let token: ActionToken = token.parse()?;
    let action = state.service.action_by_token(&user.username, token).await?;

    Ok(Json(action))
}

/// Stop a running action and return it once it is terminal.
#[utoipa::path(
    post,
    path = "/api/v1/actions/{token}/cancel",
    tag = "actions",
    params(("token" = String, Path, description = "Action token")),
    responses(
        (status = 200, description = "Action in its terminal state", body = Action),
        (status = 400, description = "Action runs on another instance", body = ErrorBody),
    )
)]
pub async fn cancel_action(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(token): Path<String>,
) -> ApiResult<Json<Action>> {
    let token: ActionToken = token.parse()?;
    let action = state.service.cancel(&user.username, token).await?;

    Ok(Json(action))
}
