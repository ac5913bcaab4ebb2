//! Realized cloud resources and their time-to-live.
//!
//! A deployment moves `active -> expiring -> deleted`. `expiring` marks a
//! destroy in flight; a failed destroy puts the row back to `active`, and the
//! row is removed only once the destroy succeeds.

use crate::action::ActionKey;
use crate::db::from_millis;
use crate::error::{OrchestratorError, Result};
use crate::workspace::Workspace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Deployment {
    pub id: String,
    pub workspace_id: String,
    #[schema(value_type = String)]
    pub action_key: ActionKey,
    pub resource_group: String,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Deployment {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Active,
    Expiring,
    Deleted,
}

/// Persistence collaborator for deployments.
#[derive(Clone)]
pub struct DeploymentStore {
    pool: SqlitePool,
}

impl DeploymentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record the deployment created by a successful deploy of `workspace`.
    ///
    /// If the workspace already has a live deployment it is returned as is:
    /// `expires_at` is fixed at creation and a redeploy does not move it.
    #[instrument(skip(self, workspace), fields(workspace_id = %workspace.id))]
    pub async fn record_deployment(
        &self,
        workspace: &Workspace,
        key: &ActionKey,
        ttl: Duration,
    ) -> Result<Deployment> {
        if let Some(existing) = self.find_for_workspace(&workspace.id).await? {
            return Ok(existing);
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| OrchestratorError::Validation("deployment TTL out of range".into()))?;
        let expires_at = now + ttl;

        sqlx::query(
            r#"
            INSERT INTO deployments (id, workspace_id, action_key, resource_group, status, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&workspace.id)
        .bind(key.as_str())
        .bind(workspace.resource_group())
        .bind(DeploymentStatus::Active)
        .bind(now.timestamp_millis())
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        info!(deployment_id = %id, %expires_at, "deployment recorded");

        self.get_deployment(&id).await
    }

    pub async fn get_deployment(&self, id: &str) -> Result<Deployment> {
        sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(DeploymentRow::into_deployment)
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {}", id)))
    }

    /// The workspace's deployment that has not been deleted, if any.
    pub async fn find_for_workspace(&self, workspace_id: &str) -> Result<Option<Deployment>> {
        Ok(sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM deployments
             WHERE workspace_id = ? AND status != 'deleted'
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(workspace_id)
        .fetch_optional(&self.pool)
        .await?
        .map(DeploymentRow::into_deployment))
    }

    /// Deployments visible to `owner`, or every deployment when `owner` is None.
    pub async fn list_deployments(&self, owner: Option<&str>) -> Result<Vec<Deployment>> {
        let rows = match owner {
            Some(owner) => {
                sqlx::query_as::<_, DeploymentRow>(
                    "SELECT d.* FROM deployments d
                     JOIN workspaces w ON w.id = d.workspace_id
                     WHERE w.owner = ?
                     ORDER BY d.created_at DESC",
                )
                .bind(owner)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, DeploymentRow>(
                    "SELECT * FROM deployments ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(DeploymentRow::into_deployment).collect())
    }

    /// Deployments the reaper should try to destroy at `now`: active ones past
    /// their expiry, plus any left in `expiring` by an interrupted destroy.
    pub async fn get_reclaimable(&self, now: DateTime<Utc>) -> Result<Vec<Deployment>> {
        let rows = sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM deployments
             WHERE (status = 'active' AND expires_at <= ?) OR status = 'expiring'
             ORDER BY expires_at ASC",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeploymentRow::into_deployment).collect())
    }

    /// `active -> expiring`; a no-op for rows already expiring.
    pub async fn mark_expiring(&self, id: &str) -> Result<()> {
        self.transition(id, DeploymentStatus::Active, DeploymentStatus::Expiring)
            .await
    }

    /// `expiring -> active` after a failed destroy.
    pub async fn revert_to_active(&self, id: &str) -> Result<()> {
        self.transition(id, DeploymentStatus::Expiring, DeploymentStatus::Active)
            .await
    }

    async fn transition(&self, id: &str, from: DeploymentStatus, to: DeploymentStatus) -> Result<()> {
        let result = sqlx::query("UPDATE deployments SET status = ? WHERE id = ? AND status = ?")
            .bind(to)
            .bind(id)
            .bind(from)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            let current = self.get_deployment(id).await?;
            if current.status != to {
                return Err(OrchestratorError::Validation(format!(
                    "deployment {} is {:?}, cannot move to {:?}",
                    id, current.status, to
                )));
            }
        }

        Ok(())
    }

    /// Mark the deployment deleted and remove it; called once its destroy succeeded.
    #[instrument(skip(self))]
    pub async fn remove_deployment(&self, id: &str) -> Result<Deployment> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(DeploymentStatus::Deleted)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("deployment {}", id)))?;

        sqlx::query("DELETE FROM deployments WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(resource_group = %row.resource_group, "deployment removed");

        Ok(row.into_deployment())
    }
}

#[derive(sqlx::FromRow)]
struct DeploymentRow {
    id: String,
    workspace_id: String,
    action_key: String,
    resource_group: String,
    status: DeploymentStatus,
    created_at: i64,
    expires_at: i64,
}

impl DeploymentRow {
    fn into_deployment(self) -> Deployment {
        Deployment {
            id: self.id,
            workspace_id: self.workspace_id,
            action_key: ActionKey::from(self.action_key),
            resource_group: self.resource_group,
            status: self.status,
            created_at: from_millis(self.created_at),
            expires_at: from_millis(self.expires_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_db, fixture_workspace};

    async fn setup() -> (DeploymentStore, Workspace, ActionKey) {
        let pool = create_test_db().await;
        let workspace = fixture_workspace(&pool, "dave", "aks-basic").await;
        let key = ActionKey::for_workspace(&workspace.owner, &workspace.id);
        (DeploymentStore::new(pool), workspace, key)
    }

    #[tokio::test]
    async fn record_sets_expiry_from_ttl() {
        let (store, workspace, key) = setup().await;
        let before = Utc::now();

        let deployment = store
            .record_deployment(&workspace, &key, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(deployment.status, DeploymentStatus::Active);
        assert_eq!(deployment.action_key, key);
        assert_eq!(deployment.resource_group, workspace.resource_group());
        let ttl = deployment.expires_at - before;
        assert!(ttl >= chrono::Duration::seconds(3599) && ttl <= chrono::Duration::seconds(3601));
    }

    #[tokio::test]
    async fn redeploy_keeps_original_expiry() {
        let (store, workspace, key) = setup().await;

        let first = store
            .record_deployment(&workspace, &key, Duration::from_secs(60))
            .await
            .unwrap();
        let second = store
            .record_deployment(&workspace, &key, Duration::from_secs(7200))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.expires_at, second.expires_at);
        assert_eq!(store.list_deployments(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reclaimable_includes_expired_and_stranded_rows() {
        let (store, workspace, key) = setup().await;
        let deployment = store
            .record_deployment(&workspace, &key, Duration::from_secs(60))
            .await
            .unwrap();

        assert!(store.get_reclaimable(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let due = store.get_reclaimable(later).await.unwrap();
        assert_eq!(due.len(), 1);
        assert!(due[0].is_expired(later));

        store.mark_expiring(&deployment.id).await.unwrap();
        let stranded = store.get_reclaimable(Utc::now()).await.unwrap();
        assert_eq!(stranded.len(), 1);
        assert_eq!(stranded[0].status, DeploymentStatus::Expiring);
    }

    #[tokio::test]
    async fn status_transitions() {
        let (store, workspace, key) = setup().await;
        let deployment = store
            .record_deployment(&workspace, &key, Duration::from_secs(60))
            .await
            .unwrap();

        store.mark_expiring(&deployment.id).await.unwrap();
        // Already expiring is fine
        store.mark_expiring(&deployment.id).await.unwrap();
        store.revert_to_active(&deployment.id).await.unwrap();
        assert_eq!(
            store.get_deployment(&deployment.id).await.unwrap().status,
            DeploymentStatus::Active
        );

        let removed = store.remove_deployment(&deployment.id).await.unwrap();
        assert_eq!(removed.status, DeploymentStatus::Deleted);
        assert!(matches!(
            store.get_deployment(&deployment.id).await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(store.find_for_workspace(&workspace.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_owner() {
        let (store, workspace, key) = setup().await;
        store
            .record_deployment(&workspace, &key, Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.list_deployments(Some("dave")).await.unwrap().len(), 1);
        assert!(store.list_deployments(Some("erin")).await.unwrap().is_empty());
    }
}
