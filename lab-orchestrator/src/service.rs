//! Inbound operations, composed from the narrow components.
//!
//! Every operation takes the caller identity resolved by the transport. The
//! caller owns the workspaces it registered; keys are always built from the
//! stored owner, never from client input.

use crate::action::{
    Action, ActionErrorKind, ActionFilter, ActionKey, ActionKind, ActionOutcome, ActionToken,
};
use crate::archive::{ActionArchiver, ArchiveStore};
use crate::broker::{BrokerConfig, LogBroker, LogLine, LogSubscription, StartAt};
use crate::deployment::{Deployment, DeploymentStore};
use crate::error::{OrchestratorError, Result};
use crate::executor::{ExecutorConfig, InfraTool, ProvisioningExecutor};
use crate::gate::AdmissionGate;
use crate::reaper::DeploymentReaper;
use crate::registry::ActionRegistry;
use crate::workspace::{CreateWorkspaceRequest, Workspace, WorkspaceFilters, WorkspaceStatus, WorkspaceStore};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct LabService {
    workspaces: WorkspaceStore,
    deployments: DeploymentStore,
    archive: ArchiveStore,
    gate: AdmissionGate,
    executor: ProvisioningExecutor,
}

impl LabService {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<dyn ActionRegistry>,
        tool: Arc<dyn InfraTool>,
        broker: BrokerConfig,
        executor: ExecutorConfig,
    ) -> Self {
        let workspaces = WorkspaceStore::new(pool.clone());
        let deployments = DeploymentStore::new(pool.clone());
        let executor = ProvisioningExecutor::new(
            tool,
            Arc::new(LogBroker::new(broker)),
            workspaces.clone(),
            deployments.clone(),
            executor,
        );

        Self {
            workspaces,
            deployments,
            archive: ArchiveStore::new(pool),
            gate: AdmissionGate::new(registry),
            executor,
        }
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn executor(&self) -> &ProvisioningExecutor {
        &self.executor
    }

    pub fn deployments(&self) -> &DeploymentStore {
        &self.deployments
    }

    /// Reaper wired to this service's gate and executor.
    pub fn reaper(&self, interval: Duration) -> DeploymentReaper {
        DeploymentReaper::new(
            self.deployments.clone(),
            self.gate.clone(),
            self.executor.clone(),
            interval,
        )
    }

    pub fn archiver(&self, retention: Duration) -> ActionArchiver {
        ActionArchiver::new(self.gate.registry().clone(), self.archive.clone(), retention)
    }

    // Workspaces

    pub async fn create_workspace(&self, caller: &str, lab_id: &str, region: &str) -> Result<Workspace> {
        let workspace = self
            .workspaces
            .create_workspace(CreateWorkspaceRequest {
                owner: caller.to_string(),
                lab_id: lab_id.to_string(),
                region: region.to_string(),
            })
            .await?;

        info!(workspace_id = %workspace.id, owner = %caller, lab_id, "workspace registered");
        Ok(workspace)
    }

    pub async fn get_workspace(&self, caller: &str, id: &str) -> Result<Workspace> {
        self.owned_workspace(caller, id).await
    }

    pub async fn list_workspaces(&self, caller: &str, status: Option<WorkspaceStatus>) -> Result<Vec<Workspace>> {
        self.workspaces
            .list_workspaces(WorkspaceFilters {
                owner: Some(caller.to_string()),
                status,
            })
            .await
    }

    /// Archive a workspace with no running action and no live deployment.
    ///
    /// The status is written before the key is checked, and `start` re-reads
    /// the status after admission, so an action admitted concurrently is
    /// either seen here or refused there.
    pub async fn archive_workspace(&self, caller: &str, id: &str) -> Result<Workspace> {
        let workspace = self.owned_workspace(caller, id).await?;
        let key = ActionKey::for_workspace(&workspace.owner, &workspace.id);

        let archived = self.workspaces.archive_workspace(&workspace.id).await?;
        if let Err(e) = self.ensure_idle(&key, &workspace.id).await {
            self.workspaces.set_status(&workspace.id, workspace.status).await?;
            return Err(e);
        }

        info!(workspace_id = %workspace.id, owner = %caller, "workspace archived");
        Ok(archived)
    }

    async fn ensure_idle(&self, key: &ActionKey, workspace_id: &str) -> Result<()> {
        if let Some(active) = self.gate.check(key).await? {
            return Err(OrchestratorError::Conflict(Box::new(active)));
        }
        if self.deployments.find_for_workspace(workspace_id).await?.is_some() {
            return Err(OrchestratorError::Validation(format!(
                "workspace {} still has a deployment, destroy it first",
                workspace_id
            )));
        }
        Ok(())
    }

    // Actions

    pub async fn start_deploy(&self, caller: &str, workspace_id: &str) -> Result<Action> {
        self.start(caller, workspace_id, ActionKind::Deploy).await
    }

    pub async fn start_destroy(&self, caller: &str, workspace_id: &str) -> Result<Action> {
        self.start(caller, workspace_id, ActionKind::Destroy).await
    }

    pub async fn start_plan(&self, caller: &str, workspace_id: &str) -> Result<Action> {
        self.start(caller, workspace_id, ActionKind::Plan).await
    }

    /// Admit and launch an action; returns the pending action without waiting.
    async fn start(&self, caller: &str, workspace_id: &str, kind: ActionKind) -> Result<Action> {
        let workspace = self.owned_workspace(caller, workspace_id).await?;
        if workspace.status == WorkspaceStatus::Archived {
            return Err(archived(&workspace.id));
        }

        let key = ActionKey::for_workspace(&workspace.owner, &workspace.id);
        let guard = self.gate.admit(&key, kind).await?;

        // An archive that raced the check above has already written its status
        if self.workspaces.get_workspace(&workspace.id).await?.status == WorkspaceStatus::Archived {
            guard
                .complete(ActionOutcome::Cancelled {
                    reason: "workspace archived".to_string(),
                })
                .await?;
            return Err(archived(&workspace.id));
        }

        if kind == ActionKind::Destroy {
            if let Some(deployment) = self.deployments.find_for_workspace(&workspace.id).await? {
                if let Err(e) = self.deployments.mark_expiring(&deployment.id).await {
                    warn!(deployment_id = %deployment.id, error = %e, "failed to mark deployment expiring");
                    let outcome = ActionOutcome::failed(ActionErrorKind::ExecutionError, e.to_string());
                    guard.complete(outcome).await?;
                    return Err(e);
                }
            }
        }

        let action = guard.action().clone();
        self.executor.spawn(guard);

        Ok(action)
    }

    /// Latest action on the workspace's key.
    pub async fn action_status(&self, caller: &str, workspace_id: &str) -> Result<Action> {
        let workspace = self.owned_workspace(caller, workspace_id).await?;
        let key = ActionKey::for_workspace(&workspace.owner, &workspace.id);

        self.gate
            .registry()
            .get(&key)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("no action for workspace {}", workspace.id)))
    }

    pub async fn action_by_token(&self, caller: &str, token: ActionToken) -> Result<Action> {
        let action = self
            .gate
            .registry()
            .get_by_token(token)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("action {}", token)))?;

        if action.key.owner() != caller {
            return Err(OrchestratorError::Forbidden(format!(
                "action {} belongs to another user",
                token
            )));
        }

        Ok(action)
    }

    /// The caller's actions matching `filter`, newest first.
    pub async fn list_actions(&self, caller: &str, filter: ActionFilter) -> Result<Vec<Action>> {
        let actions = self.gate.registry().list(&filter).await?;
        Ok(actions
            .into_iter()
            .filter(|a| a.key.owner() == caller)
            .collect())
    }

    /// Archived actions of one workspace.
    pub async fn archived_actions(&self, caller: &str, workspace_id: &str) -> Result<Vec<Action>> {
        let workspace = self.owned_workspace(caller, workspace_id).await?;
        self.archive
            .list_for_key(&ActionKey::for_workspace(&workspace.owner, &workspace.id))
            .await
    }

    /// Cancel a running action and return it in its terminal state.
    ///
    /// Cancelling a finished action returns it unchanged.
    pub async fn cancel(&self, caller: &str, token: ActionToken) -> Result<Action> {
        let action = self.action_by_token(caller, token).await?;
        if action.state.is_terminal() {
            return Ok(action);
        }

        if self.executor.cancel(token).await.is_none() {
            let current = self.action_by_token(caller, token).await?;
            if current.is_active() {
                return Err(OrchestratorError::Validation(format!(
                    "action {} is not running on this instance",
                    token
                )));
            }
            return Ok(current);
        }

        self.action_by_token(caller, token).await
    }

    // Logs

    pub async fn stream_logs(&self, caller: &str, workspace_id: &str, start: StartAt) -> Result<LogSubscription> {
        let key = self.owned_key(caller, workspace_id).await?;
        self.executor.broker().subscribe(&key, start)
    }

    pub async fn log_lines(&self, caller: &str, workspace_id: &str, from: u64) -> Result<Vec<LogLine>> {
        let key = self.owned_key(caller, workspace_id).await?;
        self.executor.broker().snapshot(&key, from)
    }

    // Deployments

    pub async fn list_deployments(&self, caller: &str) -> Result<Vec<Deployment>> {
        self.deployments.list_deployments(Some(caller)).await
    }

    async fn owned_workspace(&self, caller: &str, id: &str) -> Result<Workspace> {
        let workspace = self.workspaces.get_workspace(id).await?;
        if workspace.owner != caller {
            return Err(OrchestratorError::Forbidden(format!(
                "workspace {} belongs to another user",
                id
            )));
        }
        Ok(workspace)
    }

    async fn owned_key(&self, caller: &str, workspace_id: &str) -> Result<ActionKey> {
        let workspace = self.owned_workspace(caller, workspace_id).await?;
        Ok(ActionKey::for_workspace(&workspace.owner, &workspace.id))
    }
}

fn archived(workspace_id: &str) -> OrchestratorError {
    OrchestratorError::Validation(format!("workspace {} is archived", workspace_id))
}
