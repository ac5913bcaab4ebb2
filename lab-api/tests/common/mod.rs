//! Common test utilities and helpers for lab-api tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use lab_api::{create_app, AppState};
use lab_orchestrator::test_utils::ScriptedTool;
use lab_orchestrator::{
    build_registry, Action, BrokerConfig, ExecutorConfig, InfraTool, LabService, RegistryBackend,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for `oneshot`

pub use lab_orchestrator::test_utils::{create_test_db, Step};

/// Build a service over `pool` that runs actions with `tool`.
pub fn test_service(pool: &SqlitePool, tool: Arc<dyn InfraTool>) -> LabService {
    let executor = ExecutorConfig {
        timeout: Duration::from_secs(5),
        deployment_ttl: Duration::from_secs(3600),
    };
    LabService::new(
        pool.clone(),
        build_registry(RegistryBackend::Memory, pool, executor.action_deadline()),
        tool,
        BrokerConfig::default(),
        executor,
    )
}

/// Create a test app with the given database pool and tool
pub fn create_test_app(pool: SqlitePool, tool: Arc<dyn InfraTool>) -> (Router, LabService) {
    let service = test_service(&pool, tool);
    let state = AppState::new(pool, service.clone(), RegistryBackend::Memory);
    (create_app(state), service)
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: Response<Body>) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// Poll the service until the workspace's action is terminal.
pub async fn wait_for_terminal(service: &LabService, owner: &str, workspace_id: &str) -> Action {
    for _ in 0..200 {
        if let Ok(action) = service.action_status(owner, workspace_id).await {
            if action.state.is_terminal() {
                return action;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("action on {} never finished", workspace_id);
}

/// TestClient to encapsulate API interaction logic
pub struct TestClient {
    pub app: Router,
    pub service: LabService,
    pub pool: SqlitePool,
    pub tool: Arc<ScriptedTool>,
}

impl TestClient {
    pub async fn new(tool: ScriptedTool) -> Self {
        let pool = create_test_db().await;
        let tool = Arc::new(tool);
        let (app, service) = create_test_app(pool.clone(), tool.clone());
        Self {
            app,
            service,
            pool,
            tool,
        }
    }

    /// Send a request to the API
    pub async fn send_request(&self, request: Request<Body>) -> Response<Body> {
        // Clone the app to allow reuse (Router is cheap to clone)
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Post JSON to an endpoint as `user`
    pub async fn post<T: serde::Serialize>(&self, uri: &str, body: &T, user: Option<&str>) -> Response<Body> {
        let req_body = serde_json::to_string(body).expect("Failed to serialize request body");
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let request = builder.body(Body::from(req_body)).unwrap();
        self.send_request(request).await
    }

    /// Post without a body as `user`
    pub async fn post_empty(&self, uri: &str, user: &str) -> Response<Body> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("x-user", user)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }

    /// Get request to an endpoint as `user`
    pub async fn get(&self, uri: &str, user: Option<&str>) -> Response<Body> {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some(user) = user {
            builder = builder.header("x-user", user);
        }

        let request = builder.body(Body::empty()).unwrap();
        self.send_request(request).await
    }

    /// Delete request to an endpoint as `user`
    pub async fn delete(&self, uri: &str, user: &str) -> Response<Body> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("x-user", user)
            .body(Body::empty())
            .unwrap();
        self.send_request(request).await
    }
}
