//! Integration tests for the deployment reaper
//!
//! Tests that expired deployments created through the API are destroyed
//! by a reaper cycle, and that the reaper respects the admission gate.

mod common;

use axum::http::StatusCode;
use chrono::{Duration as ChronoDuration, Utc};
use common::{extract_json_body, wait_for_terminal, Step, TestClient};
use lab_orchestrator::test_utils::ScriptedTool;
use lab_orchestrator::{Action, ActionKind, ActionState, Deployment, ReapReport, Workspace};
use serde_json::json;
use std::time::Duration;

async fn deployed_workspace(client: &TestClient, user: &str) -> Workspace {
    let response = client
        .post(
            "/api/v1/workspaces",
            &json!({ "lab_id": "aks-basic", "region": "eastus" }),
            Some(user),
        )
        .await;
    let workspace: Workspace = extract_json_body(response).await;

    let response = client
        .post_empty(&format!("/api/v1/workspaces/{}/deploy", workspace.id), user)
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let deployed = wait_for_terminal(&client.service, user, &workspace.id).await;
    assert_eq!(deployed.state, ActionState::Succeeded);

    workspace
}

#[tokio::test]
async fn test_reaper_ignores_unexpired_deployments() {
    let client = TestClient::new(ScriptedTool::succeeding()).await;
    deployed_workspace(&client, "alice").await;

    let report = client
        .service
        .reaper(Duration::from_secs(60))
        .run_cycle()
        .await
        .expect("reaper cycle failed");

    assert_eq!(report, ReapReport::default());

    let response = client.get("/api/v1/deployments", Some("alice")).await;
    let deployments: Vec<Deployment> = extract_json_body(response).await;
    assert_eq!(deployments.len(), 1);
}

#[tokio::test]
async fn test_reaper_destroys_expired_deployment() {
    let client = TestClient::new(ScriptedTool::succeeding()).await;
    let workspace = deployed_workspace(&client, "alice").await;

    // The test service gives deployments an hour
    let later = Utc::now() + ChronoDuration::hours(2);
    let report = client
        .service
        .reaper(Duration::from_secs(60))
        .run_cycle_at(later)
        .await
        .expect("reaper cycle failed");

    assert_eq!(report.examined, 1);
    assert_eq!(report.started, 1);
    assert_eq!(report.succeeded, 1);

    let response = client.get("/api/v1/deployments", Some("alice")).await;
    let deployments: Vec<Deployment> = extract_json_body(response).await;
    assert!(deployments.is_empty());

    // The destroy is visible as the workspace's latest action
    let response = client
        .get(&format!("/api/v1/workspaces/{}/action", workspace.id), Some("alice"))
        .await;
    let action: Action = extract_json_body(response).await;
    assert_eq!(action.kind, ActionKind::Destroy);
    assert_eq!(action.state, ActionState::Succeeded);
}

#[tokio::test]
async fn test_reaper_skips_workspace_with_running_action() {
    // Deploy succeeds, everything after it hangs
    let client = TestClient::new(ScriptedTool::new(Step::Hang).then(Step::Succeed)).await;
    let workspace = deployed_workspace(&client, "alice").await;

    let response = client
        .post_empty(&format!("/api/v1/workspaces/{}/plan", workspace.id), "alice")
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let plan: Action = extract_json_body(response).await;

    let later = Utc::now() + ChronoDuration::hours(2);
    let report = client
        .service
        .reaper(Duration::from_secs(60))
        .run_cycle_at(later)
        .await
        .expect("reaper cycle failed");

    assert_eq!(report.examined, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.started, 0);

    // The user's plan still owns the key and the deployment is untouched
    let response = client
        .get(&format!("/api/v1/workspaces/{}/action", workspace.id), Some("alice"))
        .await;
    let current: Action = extract_json_body(response).await;
    assert_eq!(current.token, plan.token);

    let response = client.get("/api/v1/deployments", Some("alice")).await;
    let deployments: Vec<Deployment> = extract_json_body(response).await;
    assert_eq!(deployments.len(), 1);

    client.tool.release();
    wait_for_terminal(&client.service, "alice", &workspace.id).await;
}

#[tokio::test]
async fn test_reaper_task_starts_and_stops() {
    let client = TestClient::new(ScriptedTool::succeeding()).await;

    let task = client.service.reaper(Duration::from_millis(10)).start();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    tokio::time::timeout(Duration::from_secs(1), task.shutdown())
        .await
        .expect("reaper task did not stop");
}
