//! Helpers shared by unit tests, integration tests, and the API crate's tests.

use crate::broker::LogSink;
use crate::executor::{InfraTool, Invocation};
use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceStore};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // Every connection to sqlite::memory: is a separate database, so pin the pool to one.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    // The path is relative to the crate root (lab-orchestrator/migrations)
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// Fixture: register a workspace owned by `owner`
pub async fn fixture_workspace(pool: &SqlitePool, owner: &str, lab_id: &str) -> Workspace {
    WorkspaceStore::new(pool.clone())
        .create_workspace(CreateWorkspaceRequest {
            owner: owner.to_string(),
            lab_id: lab_id.to_string(),
            region: "eastus".to_string(),
        })
        .await
        .expect("Failed to create fixture workspace")
}

/// What a scripted run does after emitting its lines.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(String),
    /// Block until released through [`ScriptedTool::release`], then succeed.
    Hang,
    Panic,
    Sleep(Duration),
}

/// Deterministic [`InfraTool`] driven by a queue of steps.
///
/// Each invocation pops the next step (falling back to the default) and emits
/// `lines` through the sink before performing it.
pub struct ScriptedTool {
    steps: Mutex<VecDeque<Step>>,
    default: Step,
    lines: Vec<String>,
    calls: AtomicUsize,
    invocations: Mutex<Vec<Invocation>>,
    started: Notify,
    release: Notify,
}

impl ScriptedTool {
    pub fn new(default: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            default,
            lines: vec!["Initializing...".to_string(), "Apply complete!".to_string()],
            calls: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
            started: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Step::Succeed)
    }

    pub fn with_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lines = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    /// Wait until some invocation has started.
    pub async fn started(&self) {
        self.started.notified().await;
    }

    /// Let one hanging invocation finish.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[async_trait]
impl InfraTool for ScriptedTool {
    async fn run(&self, invocation: &Invocation, sink: &LogSink) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invocations.lock().unwrap().push(invocation.clone());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone());

        for line in &self.lines {
            sink.line(line.clone());
        }
        self.started.notify_one();

        match step {
            Step::Succeed => Ok(()),
            Step::Fail(message) => Err(anyhow::anyhow!(message)),
            Step::Hang => {
                self.release.notified().await;
                Ok(())
            }
            Step::Panic => panic!("scripted tool panic"),
            Step::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
        }
    }
}
