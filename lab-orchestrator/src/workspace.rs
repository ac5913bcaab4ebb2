use crate::error::{OrchestratorError, Result};
use crate::db::from_millis;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Workspace {
    pub id: String,
    pub owner: String,
    pub lab_id: String,
    pub region: String,
    /// Terraform workspace holding this workspace's infrastructure state.
    pub state_ref: String,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Resource group realized for this workspace when deployed.
    pub fn resource_group(&self) -> String {
        format!("rg-{}", self.state_ref)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum WorkspaceStatus {
    Ready,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateWorkspaceRequest {
    pub owner: String,
    pub lab_id: String,
    pub region: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub owner: Option<String>,
    pub status: Option<WorkspaceStatus>,
}

/// Persistence collaborator for workspaces.
#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a new workspace
    #[instrument(skip(self, req), fields(owner = %req.owner, lab_id = %req.lab_id))]
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        validate_identifier("owner", &req.owner)?;
        validate_identifier("lab_id", &req.lab_id)?;
        validate_identifier("region", &req.region)?;

        let id = Uuid::new_v4().to_string();
        let state_ref = format!("lab-{}", id);
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            r#"
            INSERT INTO workspaces (id, owner, lab_id, region, state_ref, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&req.owner)
        .bind(&req.lab_id)
        .bind(&req.region)
        .bind(&state_ref)
        .bind(WorkspaceStatus::Ready)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_workspace(&id).await
    }

    /// List workspaces with optional filters
    pub async fn list_workspaces(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.owner.is_some() {
            query.push_str(" AND owner = ?");
        }
        if filters.status.is_some() {
            query.push_str(" AND status = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(owner) = &filters.owner {
            q = q.bind(owner);
        }
        if let Some(status) = filters.status {
            q = q.bind(status);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Workspace::from).collect())
    }

    /// Get a single workspace by ID
    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {}", id)))?;

        Ok(row.into())
    }

    /// Mark a workspace as archived; archived workspaces accept no new actions.
    pub async fn archive_workspace(&self, id: &str) -> Result<Workspace> {
        self.set_status(id, WorkspaceStatus::Archived).await
    }

    pub async fn set_status(&self, id: &str, status: WorkspaceStatus) -> Result<Workspace> {
        let result = sqlx::query("UPDATE workspaces SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {}", id)));
        }

        self.get_workspace(id).await
    }
}

/// Identifiers end up in Terraform variables and resource names.
fn validate_identifier(field: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > 64 {
        return Err(OrchestratorError::Validation(format!(
            "{} must be between 1 and 64 characters",
            field
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' || c == '@')
    {
        return Err(OrchestratorError::Validation(format!(
            "{} '{}' contains unsupported characters",
            field, value
        )));
    }
    Ok(())
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    owner: String,
    lab_id: String,
    region: String,
    state_ref: String,
    status: WorkspaceStatus,
    created_at: i64,
    updated_at: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            owner: row.owner,
            lab_id: row.lab_id,
            region: row.region,
            state_ref: row.state_ref,
            status: row.status,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_db;

    fn request(owner: &str) -> CreateWorkspaceRequest {
        CreateWorkspaceRequest {
            owner: owner.to_string(),
            lab_id: "aks-basic".to_string(),
            region: "eastus".to_string(),
        }
    }

    #[tokio::test]
    async fn create_and_get_workspace() {
        let store = WorkspaceStore::new(create_test_db().await);

        let workspace = store.create_workspace(request("alice")).await.unwrap();
        assert_eq!(workspace.owner, "alice");
        assert_eq!(workspace.status, WorkspaceStatus::Ready);
        assert_eq!(workspace.state_ref, format!("lab-{}", workspace.id));
        assert_eq!(workspace.resource_group(), format!("rg-lab-{}", workspace.id));

        let fetched = store.get_workspace(&workspace.id).await.unwrap();
        assert_eq!(fetched.id, workspace.id);
    }

    #[tokio::test]
    async fn invalid_identifiers_are_rejected() {
        let store = WorkspaceStore::new(create_test_db().await);

        let mut req = request("alice");
        req.lab_id = "bad lab; rm -rf".to_string();
        assert!(matches!(
            store.create_workspace(req).await,
            Err(OrchestratorError::Validation(_))
        ));

        let mut req = request("alice");
        req.region = String::new();
        assert!(matches!(
            store.create_workspace(req).await,
            Err(OrchestratorError::Validation(_))
        ));

        assert!(store
            .list_workspaces(WorkspaceFilters::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_owner_and_status() {
        let store = WorkspaceStore::new(create_test_db().await);
        let a = store.create_workspace(request("alice")).await.unwrap();
        store.create_workspace(request("alice")).await.unwrap();
        store.create_workspace(request("bob")).await.unwrap();
        store.archive_workspace(&a.id).await.unwrap();

        let alice = store
            .list_workspaces(WorkspaceFilters {
                owner: Some("alice".into()),
                status: None,
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);

        let archived = store
            .list_workspaces(WorkspaceFilters {
                owner: None,
                status: Some(WorkspaceStatus::Archived),
            })
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, a.id);
    }

    #[tokio::test]
    async fn missing_workspace_is_not_found() {
        let store = WorkspaceStore::new(create_test_db().await);
        assert!(matches!(
            store.get_workspace("nope").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            store.archive_workspace("nope").await,
            Err(OrchestratorError::NotFound(_))
        ));
    }
}
