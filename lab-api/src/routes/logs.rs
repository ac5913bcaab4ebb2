//! Log streaming for a workspace's current action.
//!
//! `GET .../logs` upgrades to a WebSocket carrying one JSON [`LogLine`] per
//! text frame. The socket closes when the action finishes, or early if the
//! client falls too far behind, in which case a final `{"error": "lagged"}`
//! frame tells it to reconnect with a replay.

use crate::{
    auth::AuthenticatedUser,
    error::{ApiResult, ErrorBody},
    state::AppState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Extension, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use lab_orchestrator::{LogLine, LogSubscription, StartAt};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/workspaces/{id}/logs", get(stream_logs))
        .route("/api/v1/workspaces/{id}/logs/lines", get(log_lines))
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// `start`, `tail`, or a sequence number
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LinesQuery {
    #[serde(default)]
    from: u64,
}

#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/logs",
    tag = "logs",
    params(
        ("id" = String, Path, description = "Workspace id"),
        ("from" = Option<String>, Query, description = "start (default), tail, or a sequence number"),
    ),
    responses(
        (status = 101, description = "WebSocket of JSON log lines"),
        (status = 404, description = "No log stream for the workspace", body = ErrorBody),
    )
)]
pub async fn stream_logs(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let start: StartAt = query.from.as_deref().unwrap_or("start").parse()?;
    let subscription = state.service.stream_logs(&user.username, &id, start).await?;

    Ok(ws.on_upgrade(move |socket| forward_logs(socket, subscription)))
}

async fn forward_logs(socket: WebSocket, mut subscription: LogSubscription) {
    let (mut sender, mut receiver) = socket.split();
    let token = subscription.token();

    let mut send_task = tokio::spawn(async move {
        loop {
            let (frame, closing) = match subscription.recv().await {
                Ok(Some(line)) => match serde_json::to_string(&line) {
                    Ok(text) => (text, false),
                    Err(e) => {
                        warn!(error = %e, "failed to encode log line");
                        continue;
                    }
                },
                Ok(None) => break,
                Err(lagged) => {
                    debug!(%token, skipped = lagged.skipped, "log subscriber lagged, disconnecting");
                    let text = json!({ "error": "lagged", "skipped": lagged.skipped }).to_string();
                    (text, true)
                }
            };

            if sender.send(Message::Text(frame.into())).await.is_err() || closing {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            if matches!(msg, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Lines of the workspace's current or most recent action, without streaming.
#[utoipa::path(
    get,
    path = "/api/v1/workspaces/{id}/logs/lines",
    tag = "logs",
    params(
        ("id" = String, Path, description = "Workspace id"),
        ("from" = Option<u64>, Query, description = "First sequence number to return"),
    ),
    responses(
        (status = 200, description = "Log lines in sequence order", body = [LogLine]),
        (status = 404, description = "No log stream for the workspace", body = ErrorBody),
    )
)]
pub async fn log_lines(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(id): Path<String>,
    Query(query): Query<LinesQuery>,
) -> ApiResult<Json<Vec<LogLine>>> {
    let lines = state.service.log_lines(&user.username, &id, query.from).await?;
    Ok(Json(lines))
}
