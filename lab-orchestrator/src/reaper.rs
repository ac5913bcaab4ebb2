//! Destroys deployments whose time-to-live has passed.
//!
//! The reaper goes through the same admission gate as user requests. A
//! deployment whose key is busy is skipped untouched and picked up again on a
//! later cycle.

use crate::action::{ActionErrorKind, ActionKind, ActionOutcome, ActionState};
use crate::deployment::DeploymentStore;
use crate::error::{OrchestratorError, Result};
use crate::executor::ProvisioningExecutor;
use crate::gate::AdmissionGate;
use crate::tasks::BackgroundTask;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Counts for one reaper cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    pub examined: usize,
    pub started: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct DeploymentReaper {
    deployments: DeploymentStore,
    gate: AdmissionGate,
    executor: ProvisioningExecutor,
    interval: Duration,
}

impl DeploymentReaper {
    pub fn new(
        deployments: DeploymentStore,
        gate: AdmissionGate,
        executor: ProvisioningExecutor,
        interval: Duration,
    ) -> Self {
        Self {
            deployments,
            gate,
            executor,
            interval,
        }
    }

    pub async fn run_cycle(&self) -> Result<ReapReport> {
        self.run_cycle_at(Utc::now()).await
    }

    /// One pass over deployments due at `now`; admitted destroys run concurrently.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let due = self.deployments.get_reclaimable(now).await?;
        let mut report = ReapReport {
            examined: due.len(),
            ..ReapReport::default()
        };

        let mut destroys = JoinSet::new();

        for deployment in due {
            let guard = match self
                .gate
                .admit(&deployment.action_key, ActionKind::Destroy)
                .await
            {
                Ok(guard) => guard,
                Err(OrchestratorError::Conflict(holder)) => {
                    debug!(
                        deployment_id = %deployment.id,
                        holder = %holder.token,
                        kind = %holder.kind,
                        "deployment busy, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(deployment_id = %deployment.id, error = %e, "reaper admission failed");
                    report.failed += 1;
                    continue;
                }
            };

            match self.deployments.mark_expiring(&deployment.id).await {
                Ok(()) => {}
                // Admitted after a user destroy already removed the row
                Err(OrchestratorError::NotFound(_)) => {
                    debug!(deployment_id = %deployment.id, "deployment removed since listing, skipping");
                    let outcome = ActionOutcome::Cancelled {
                        reason: "deployment already removed".to_string(),
                    };
                    if let Err(e) = guard.complete(outcome).await {
                        error!(deployment_id = %deployment.id, error = %e, "failed to complete reaper action");
                    }
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(deployment_id = %deployment.id, error = %e, "failed to mark deployment expiring");
                    let outcome = ActionOutcome::failed(
                        ActionErrorKind::ExecutionError,
                        format!("failed to mark deployment expiring: {}", e),
                    );
                    if let Err(e) = guard.complete(outcome).await {
                        error!(deployment_id = %deployment.id, error = %e, "failed to complete reaper action");
                    }
                    report.failed += 1;
                    continue;
                }
            }

            info!(
                deployment_id = %deployment.id,
                resource_group = %deployment.resource_group,
                token = %guard.token(),
                "deployment expired, destroying"
            );
            report.started += 1;

            let executor = self.executor.clone();
            destroys.spawn(async move { executor.execute(guard).await });
        }

        while let Some(joined) = destroys.join_next().await {
            match joined {
                Ok(ActionState::Succeeded) => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "reaper destroy task crashed");
                    report.failed += 1;
                }
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                started = report.started,
                skipped = report.skipped,
                succeeded = report.succeeded,
                failed = report.failed,
                "reaper cycle finished"
            );
        }

        Ok(report)
    }

    /// Start the reaper loop; call `shutdown` on the handle to stop it.
    ///
    /// Stopping mid-cycle aborts the cycle's destroys. Their actions fail and
    /// the deployments stay expiring, which the next cycle picks up again.
    pub fn start(self) -> BackgroundTask {
        let period = self.interval;
        BackgroundTask::spawn("deployment-reaper", period, move || {
            let reaper = self.clone();
            async move {
                reaper.run_cycle().await?;
                Ok(())
            }
        })
    }
}
