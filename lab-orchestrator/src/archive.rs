//! Long-term storage for finished actions.
//!
//! The registry only needs to answer for recent actions. The archiver
//! periodically moves terminal actions older than the retention window out of
//! the registry and into the `action_archive` table. An action is only removed
//! from the registry after its archive row is committed; a failed run leaves
//! everything in place for the next one.

use crate::action::{Action, ActionKey, ActionToken};
use crate::error::{OrchestratorError, Result};
use crate::registry::sql::ActionRow;
use crate::registry::ActionRegistry;
use crate::tasks::BackgroundTask;
use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Clone)]
pub struct ArchiveStore {
    pool: SqlitePool,
}

impl ArchiveStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert finished actions; re-archiving the same token is a no-op.
    #[instrument(skip(self, actions), fields(count = actions.len()))]
    pub async fn store(&self, actions: &[Action]) -> Result<u64> {
        let archived_at = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        let mut stored = 0;

        for action in actions {
            let error = action.error.as_ref();
            let result = sqlx::query(
                "INSERT OR IGNORE INTO action_archive
                 (token, action_key, kind, state, started_at, finished_at, error_kind, error_message, archived_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(action.token.to_string())
            .bind(action.key.as_str())
            .bind(action.kind)
            .bind(action.state)
            .bind(action.started_at.timestamp_millis())
            .bind(action.finished_at.map(|at| at.timestamp_millis()))
            .bind(error.map(|e| e.kind))
            .bind(error.map(|e| e.message.clone()))
            .bind(archived_at)
            .execute(&mut *tx)
            .await?;
            stored += result.rows_affected();
        }

        tx.commit().await?;
        Ok(stored)
    }

    /// Archived actions for `key`, newest first.
    pub async fn list_for_key(&self, key: &ActionKey) -> Result<Vec<Action>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT token, action_key, kind, state, started_at, finished_at, error_kind, error_message
             FROM action_archive WHERE action_key = ?
             ORDER BY started_at DESC",
        )
        .bind(key.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_action).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM action_archive")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Clone)]
pub struct ActionArchiver {
    registry: Arc<dyn ActionRegistry>,
    archive: ArchiveStore,
    retention: Duration,
}

impl ActionArchiver {
    pub fn new(registry: Arc<dyn ActionRegistry>, archive: ArchiveStore, retention: Duration) -> Self {
        Self {
            registry,
            archive,
            retention,
        }
    }

    /// Move actions that finished more than `retention` ago into the archive.
    ///
    /// Returns how many actions left the registry.
    pub async fn run_once(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|_| OrchestratorError::Validation("action retention out of range".into()))?;
        let cutoff = Utc::now() - retention;

        let expired = self.registry.finished_before(cutoff).await?;
        if expired.is_empty() {
            debug!("no actions to archive");
            return Ok(0);
        }

        // Rows stored by an earlier run that failed to remove are ignored here
        let stored = self.archive.store(&expired).await?;
        let tokens: Vec<ActionToken> = expired.iter().map(|a| a.token).collect();
        let removed = self.registry.remove(&tokens).await?;
        info!(expired = expired.len(), stored, removed, "archived finished actions");

        Ok(removed)
    }

    pub fn start(self, period: Duration) -> BackgroundTask {
        BackgroundTask::spawn("action-archiver", period, move || {
            let archiver = self.clone();
            async move {
                archiver.run_once().await?;
                Ok(())
            }
        })
    }
}
