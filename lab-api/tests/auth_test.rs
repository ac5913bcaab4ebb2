//! Caller identity resolution.
//!
//! The username taken from proxy headers becomes the owner half of every
//! action key, so these tests pin down which header wins, how values are
//! normalized, and which values are refused before reaching a handler.

mod common;

use axum::{
    body::Body,
    http::{HeaderValue, Request, StatusCode},
    middleware,
    routing::get,
    Router,
};
use common::{extract_json_body, Step, TestClient};
use lab_api::auth::{auth_middleware, AuthenticatedUser};
use lab_orchestrator::test_utils::ScriptedTool;
use lab_orchestrator::{Action, Workspace};
use serde_json::{json, Value};
use tower::ServiceExt; // for `oneshot`

async fn whoami(axum::Extension(user): axum::Extension<AuthenticatedUser>) -> axum::Json<Value> {
    axum::Json(json!({ "username": user.username, "email": user.email }))
}

/// Resolve the identity for a request carrying `headers`.
async fn identify(headers: &[(&str, &str)]) -> (StatusCode, Value) {
    let app = Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn(auth_middleware));

    let mut builder = Request::builder().uri("/whoami");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let response = app.oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();

    let status = response.status();
    if status == StatusCode::OK {
        (status, extract_json_body(response).await)
    } else {
        (status, Value::Null)
    }
}

#[tokio::test]
async fn test_lab_user_header_takes_priority() {
    let (status, body) = identify(&[
        ("x-user", "dev"),
        ("x-forwarded-user", "proxied"),
        ("x-lab-user", "alice"),
    ])
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
}

#[tokio::test]
async fn test_forwarded_user_beats_dev_fallback() {
    let (status, body) = identify(&[("x-user", "dev"), ("x-forwarded-user", "proxied")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "proxied");

    let (status, body) = identify(&[("x-user", "dev")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "dev");
    assert!(body["email"].is_null());
}

#[tokio::test]
async fn test_username_is_trimmed() {
    let (status, body) = identify(&[("x-lab-user", "  alice\t")]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
}

#[tokio::test]
async fn test_missing_or_blank_identity_is_unauthorized() {
    assert_eq!(identify(&[]).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(identify(&[("x-user", "")]).await.0, StatusCode::UNAUTHORIZED);
    assert_eq!(identify(&[("x-lab-user", "   ")]).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_blank_preferred_header_does_not_fall_through() {
    // The proxy said who the caller is, and it said nobody
    let (status, _) = identify(&[("x-lab-user", " "), ("x-user", "dev")]).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_username_with_key_separator_is_rejected() {
    assert_eq!(identify(&[("x-lab-user", "alice/w1")]).await.0, StatusCode::BAD_REQUEST);
    assert_eq!(identify(&[("x-user", "/")]).await.0, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_non_text_username_is_unauthorized() {
    let app = Router::new()
        .route("/whoami", get(whoami))
        .layer(middleware::from_fn(auth_middleware));
    let request = Request::builder()
        .uri("/whoami")
        .header("x-lab-user", HeaderValue::from_bytes(b"al\xffice").unwrap())
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_email_prefers_lab_header() {
    let (_, body) = identify(&[
        ("x-lab-user", "alice"),
        ("x-forwarded-email", "alice@proxy.example"),
        ("x-lab-email", "alice@lab.example"),
    ])
    .await;
    assert_eq!(body["email"], "alice@lab.example");

    let (_, body) = identify(&[
        ("x-forwarded-user", "alice"),
        ("x-forwarded-email", "alice@proxy.example"),
    ])
    .await;
    assert_eq!(body["email"], "alice@proxy.example");
}

async fn send_as(
    client: &TestClient,
    method: &str,
    uri: &str,
    header: (&str, &str),
    body: Option<Value>,
) -> axum::http::Response<Body> {
    let mut builder = Request::builder().method(method).uri(uri).header(header.0, header.1);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    client.send_request(builder.body(body).unwrap()).await
}

#[tokio::test]
async fn test_identity_scopes_workspaces_and_action_keys() {
    let client = TestClient::new(ScriptedTool::new(Step::Succeed)).await;

    let response = send_as(
        &client,
        "POST",
        "/api/v1/workspaces",
        ("x-lab-user", " alice "),
        Some(json!({ "lab_id": "aks-basic", "region": "eastus" })),
    )
    .await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let workspace: Workspace = extract_json_body(response).await;
    assert_eq!(workspace.owner, "alice");

    // Same person through a different proxy header
    let uri = format!("/api/v1/workspaces/{}/plan", workspace.id);
    let response = send_as(&client, "POST", &uri, ("x-forwarded-user", "alice"), None).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let action: Action = extract_json_body(response).await;
    assert_eq!(action.key.as_str(), format!("alice/{}", workspace.id));
    assert_eq!(action.key.owner(), "alice");

    let uri = format!("/api/v1/workspaces/{}", workspace.id);
    let response = send_as(&client, "GET", &uri, ("x-lab-user", "mallory"), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let uri = format!("/api/v1/actions/{}", action.token);
    let response = send_as(&client, "GET", &uri, ("x-user", "mallory"), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_health_needs_no_identity() {
    let client = TestClient::new(ScriptedTool::new(Step::Succeed)).await;

    let response = client.get("/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = client.get("/api/v1/workspaces", None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
