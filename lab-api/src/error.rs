use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use lab_orchestrator::{Action, OrchestratorError};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

pub type ApiResult<T> = Result<T, ApiError>;

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    /// The action currently holding the workspace, on 409 responses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Forbidden(String),
    Conflict {
        message: String,
        action: Option<Box<Action>>,
    },
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, action) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, None),
            ApiError::Conflict { message, action } => {
                (StatusCode::CONFLICT, message, action.map(|a| *a))
            }
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, None),
        };

        (status, Json(ErrorBody { error, action })).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Conflict(action) => ApiError::Conflict {
                message: format!(
                    "workspace busy: {} action {} is {}",
                    action.kind, action.token, action.state
                ),
                action: Some(action),
            },
            OrchestratorError::AlreadyCompleted(token) => ApiError::Conflict {
                message: format!("action {} already completed", token),
                action: None,
            },
            OrchestratorError::NotFound(what) => ApiError::NotFound(format!("Not found: {}", what)),
            OrchestratorError::Validation(msg) => ApiError::BadRequest(msg),
            OrchestratorError::Forbidden(msg) => ApiError::Forbidden(msg),
            other => {
                error!(error = %other, "request failed");
                ApiError::Internal(other.to_string())
            }
        }
    }
}
