//! Runs admitted actions against the infrastructure tool.
//!
//! One action is one tokio task. The executor owns everything that happens
//! between admission and completion: the per-workspace state lock, the
//! timeout and cancel race, log publishing and deployment bookkeeping.
//! Failures are recorded on the action and never retried.

use crate::action::{ActionErrorKind, ActionKey, ActionKind, ActionOutcome, ActionState, ActionToken};
use crate::broker::{LogBroker, LogSink};
use crate::deployment::{DeploymentStatus, DeploymentStore};
use crate::error::Result;
use crate::gate::ActionGuard;
use crate::workspace::{Workspace, WorkspaceStore};
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the tool needs to act on one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub kind: ActionKind,
    pub token: ActionToken,
    pub workspace_id: String,
    pub owner: String,
    pub lab_id: String,
    pub region: String,
    pub state_ref: String,
    pub resource_group: String,
}

impl Invocation {
    pub fn new(kind: ActionKind, token: ActionToken, workspace: &Workspace) -> Self {
        Self {
            kind,
            token,
            workspace_id: workspace.id.clone(),
            owner: workspace.owner.clone(),
            lab_id: workspace.lab_id.clone(),
            region: workspace.region.clone(),
            state_ref: workspace.state_ref.clone(),
            resource_group: workspace.resource_group(),
        }
    }
}

/// Infrastructure-as-code tool driving one action to completion.
///
/// Dropping the returned future must stop the underlying work.
#[async_trait]
pub trait InfraTool: Send + Sync {
    async fn run(&self, invocation: &Invocation, sink: &LogSink) -> anyhow::Result<()>;
}

/// Terraform CLI: `init`, `workspace select`, then `apply`, `destroy` or `plan`.
///
/// Each lab is a Terraform module under `labs_dir/<lab_id>`; the workspace's
/// `state_ref` is the Terraform workspace holding its state.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: PathBuf,
    labs_dir: PathBuf,
}

impl TerraformCli {
    pub fn new(binary: impl Into<PathBuf>, labs_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            labs_dir: labs_dir.into(),
        }
    }

    fn steps(invocation: &Invocation) -> Vec<Vec<String>> {
        let args = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        let main = match invocation.kind {
            ActionKind::Deploy => args(&["apply", "-auto-approve", "-input=false", "-no-color"]),
            ActionKind::Destroy => args(&["destroy", "-auto-approve", "-input=false", "-no-color"]),
            ActionKind::Plan => args(&["plan", "-input=false", "-no-color"]),
        };

        vec![
            args(&["init", "-input=false", "-no-color"]),
            args(&["workspace", "select", "-or-create", &invocation.state_ref]),
            main,
        ]
    }

    async fn run_step(
        &self,
        args: &[String],
        invocation: &Invocation,
        sink: &LogSink,
    ) -> anyhow::Result<()> {
        let module_dir = self.labs_dir.join(&invocation.lab_id);
        sink.line(format!("$ terraform {}", args.join(" ")));

        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&module_dir)
            .env("TF_IN_AUTOMATION", "1")
            .env("TF_VAR_lab_id", &invocation.lab_id)
            .env("TF_VAR_owner", &invocation.owner)
            .env("TF_VAR_region", &invocation.region)
            .env("TF_VAR_resource_group", &invocation.resource_group)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn '{}'", self.binary.display()))?;

        let stdout = child.stdout.take().context("failed to capture stdout")?;
        let stderr = child.stderr.take().context("failed to capture stderr")?;
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let (mut stdout_open, mut stderr_open) = (true, true);

        // Interleave both streams in arrival order
        while stdout_open || stderr_open {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line? {
                    Some(line) => sink.line(line),
                    None => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line? {
                    Some(line) => sink.line(line),
                    None => stderr_open = false,
                },
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("terraform {} exited with {}", args[0], status);
        }

        Ok(())
    }
}

#[async_trait]
impl InfraTool for TerraformCli {
    async fn run(&self, invocation: &Invocation, sink: &LogSink) -> anyhow::Result<()> {
        let module_dir = self.labs_dir.join(&invocation.lab_id);
        if !module_dir.is_dir() {
            anyhow::bail!("lab module '{}' not found in {}", invocation.lab_id, self.labs_dir.display());
        }

        for args in Self::steps(invocation) {
            self.run_step(&args, invocation, sink).await?;
        }

        Ok(())
    }
}

/// One mutex per Terraform state, so two runs never touch the same state.
#[derive(Clone, Default)]
pub struct StateLocks {
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl StateLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, state_ref: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(state_ref.to_string())
            .or_default()
            .clone()
    }

    pub async fn acquire(&self, state_ref: &str) -> OwnedMutexGuard<()> {
        self.entry(state_ref).lock_owned().await
    }

    pub fn is_locked(&self, state_ref: &str) -> bool {
        self.entry(state_ref).try_lock().is_err()
    }
}

/// Headroom past `timeout` for loading the workspace and recording the result.
const DEADLINE_SLACK: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on a single run, including the wait for the state lock.
    pub timeout: Duration,
    /// Lifetime given to deployments created by a successful deploy.
    pub deployment_ttl: Duration,
}

impl ExecutorConfig {
    /// Longest an action can legitimately stay non-terminal. A shared registry
    /// treats anything older as abandoned by a crashed instance.
    pub fn action_deadline(&self) -> Duration {
        self.timeout + DEADLINE_SLACK
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            deployment_ttl: Duration::from_secs(4 * 60 * 60),
        }
    }
}

struct RunControl {
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<Option<ActionState>>,
}

type RunningMap = Arc<Mutex<HashMap<ActionToken, RunControl>>>;

/// Entry in the running map for the lifetime of one run, removed on drop.
struct Registration {
    running: RunningMap,
    token: ActionToken,
    cancel: watch::Receiver<bool>,
    finished: watch::Sender<Option<ActionState>>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.token);
    }
}

/// Log channel of one run, finished on drop so an aborted run still closes it.
struct OpenLog {
    broker: Arc<LogBroker>,
    key: ActionKey,
    token: ActionToken,
}

impl OpenLog {
    fn open(broker: &Arc<LogBroker>, key: &ActionKey, token: ActionToken) -> Self {
        broker.open(key, token);
        Self {
            broker: broker.clone(),
            key: key.clone(),
            token,
        }
    }
}

impl Drop for OpenLog {
    fn drop(&mut self) {
        self.broker.finish(&self.key, self.token);
    }
}

#[derive(Clone)]
pub struct ProvisioningExecutor {
    tool: Arc<dyn InfraTool>,
    broker: Arc<LogBroker>,
    workspaces: WorkspaceStore,
    deployments: DeploymentStore,
    locks: StateLocks,
    config: ExecutorConfig,
    running: RunningMap,
}

impl ProvisioningExecutor {
    pub fn new(
        tool: Arc<dyn InfraTool>,
        broker: Arc<LogBroker>,
        workspaces: WorkspaceStore,
        deployments: DeploymentStore,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            tool,
            broker,
            workspaces,
            deployments,
            locks: StateLocks::new(),
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn broker(&self) -> &Arc<LogBroker> {
        &self.broker
    }

    pub fn state_locks(&self) -> &StateLocks {
        &self.locks
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run the action on its own task.
    pub fn spawn(&self, guard: ActionGuard) -> JoinHandle<ActionState> {
        let registration = self.register(guard.token());
        let executor = self.clone();
        tokio::spawn(async move { executor.run(guard, registration).await })
    }

    /// Run the action to completion on the current task.
    pub async fn execute(&self, guard: ActionGuard) -> ActionState {
        let registration = self.register(guard.token());
        self.run(guard, registration).await
    }

    /// Ask a run on this instance to stop and wait until it is terminal.
    ///
    /// Returns None when no run with `token` is executing here.
    pub async fn cancel(&self, token: ActionToken) -> Option<ActionState> {
        let mut finished = {
            let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            let control = running.get(&token)?;
            control.cancel.send_replace(true);
            control.finished.clone()
        };

        info!(%token, "cancel requested");

        let reported = finished.wait_for(Option::is_some).await.map(|state| *state);
        // The run task went away without reporting; its guard fails the action.
        reported.unwrap_or(Some(ActionState::Failed))
    }

    /// Whether a run with `token` is executing on this instance.
    pub fn is_running(&self, token: ActionToken) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&token)
    }

    fn register(&self, token: ActionToken) -> Registration {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(None);

        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token,
                RunControl {
                    cancel: cancel_tx,
                    finished: finished_rx,
                },
            );

        Registration {
            running: self.running.clone(),
            token,
            cancel: cancel_rx,
            finished: finished_tx,
        }
    }

    async fn run(&self, mut guard: ActionGuard, mut registration: Registration) -> ActionState {
        let key = guard.key().clone();
        let token = guard.token();
        let kind = guard.kind();

        let log = OpenLog::open(&self.broker, &key, token);

        let completed = match guard.mark_running().await {
            Ok(()) => {
                let sink = self.broker.sink(key.clone(), token);
                let work = self.perform(&key, kind, token, &sink, &mut registration.cancel);
                guard.supervise(work).await
            }
            Err(e) => {
                error!(key = %key, %token, error = %e, "failed to mark action running");
                guard
                    .complete(ActionOutcome::failed(ActionErrorKind::ExecutionError, e.to_string()))
                    .await
            }
        };

        drop(log);

        let state = match completed {
            Ok(action) => {
                info!(key = %key, %token, %kind, state = %action.state, "action finished");
                action.state
            }
            Err(e) => {
                error!(key = %key, %token, error = %e, "failed to complete action");
                ActionState::Failed
            }
        };

        registration.finished.send_replace(Some(state));
        state
    }

    async fn perform(
        &self,
        key: &ActionKey,
        kind: ActionKind,
        token: ActionToken,
        sink: &LogSink,
        cancel: &mut watch::Receiver<bool>,
    ) -> ActionOutcome {
        let workspace = match self.workspaces.get_workspace(key.workspace_id()).await {
            Ok(workspace) => workspace,
            Err(e) => {
                return ActionOutcome::failed(
                    ActionErrorKind::ExecutionError,
                    format!("failed to load workspace: {}", e),
                )
            }
        };
        let invocation = Invocation::new(kind, token, &workspace);

        let run = async {
            let _lock = self.locks.acquire(&workspace.state_ref).await;
            debug!(state_ref = %workspace.state_ref, "state lock acquired");
            self.tool.run(&invocation, sink).await
        };

        // The losing branches are dropped here: the tool's child process is
        // killed and the state lock released before anything is recorded.
        let outcome = tokio::select! {
            result = run => match result {
                Ok(()) => ActionOutcome::Succeeded,
                Err(e) => ActionOutcome::failed(ActionErrorKind::ExecutionError, format!("{:#}", e)),
            },
            _ = tokio::time::sleep(self.config.timeout) => {
                sink.line(format!("{} timed out after {}s", kind, self.config.timeout.as_secs()));
                ActionOutcome::failed(
                    ActionErrorKind::TimedOut,
                    format!("exceeded timeout of {}s", self.config.timeout.as_secs()),
                )
            },
            _ = cancelled(cancel) => {
                sink.line(format!("{} cancelled", kind));
                ActionOutcome::Cancelled {
                    reason: "cancelled by request".to_string(),
                }
            },
        };

        match self.record(kind, &workspace, key, &outcome, sink).await {
            Ok(()) => outcome,
            Err(e) if outcome == ActionOutcome::Succeeded => ActionOutcome::failed(
                ActionErrorKind::ExecutionError,
                format!("failed to record deployment: {}", e),
            ),
            Err(e) => {
                warn!(key = %key, %token, error = %e, "deployment bookkeeping failed after unsuccessful run");
                outcome
            }
        }
    }

    /// Deployment bookkeeping, done before the action turns terminal.
    async fn record(
        &self,
        kind: ActionKind,
        workspace: &Workspace,
        key: &ActionKey,
        outcome: &ActionOutcome,
        sink: &LogSink,
    ) -> Result<()> {
        let succeeded = *outcome == ActionOutcome::Succeeded;

        match kind {
            ActionKind::Deploy if succeeded => {
                let deployment = self
                    .deployments
                    .record_deployment(workspace, key, self.config.deployment_ttl)
                    .await?;
                sink.line(format!(
                    "deployment {} expires at {}",
                    deployment.resource_group,
                    deployment.expires_at.to_rfc3339()
                ));
            }
            ActionKind::Destroy if succeeded => {
                if let Some(deployment) = self.deployments.find_for_workspace(&workspace.id).await? {
                    self.deployments.remove_deployment(&deployment.id).await?;
                    sink.line(format!("deployment {} removed", deployment.resource_group));
                }
            }
            ActionKind::Destroy => {
                if let Some(deployment) = self.deployments.find_for_workspace(&workspace.id).await? {
                    if deployment.status == DeploymentStatus::Expiring {
                        self.deployments.revert_to_active(&deployment.id).await?;
                    }
                }
            }
            ActionKind::Deploy | ActionKind::Plan => {}
        }

        Ok(())
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}
