//! Action registry backed by the shared SQL store.
//!
//! Admission relies on the partial unique index `idx_actions_one_active`
//! (`actions(action_key) WHERE state IN ('pending', 'running')`): the INSERT is
//! the compare-and-register, so two instances racing on one key cannot both
//! succeed. Completion is a conditional UPDATE that only matches non-terminal
//! rows, which makes it idempotent across instances as well.
//!
//! Every row carries a deadline of `started_at + action_deadline`. An instance
//! that dies mid-run never completes its action, so admission first fails any
//! non-terminal row on the key whose deadline has passed.

use super::ActionRegistry;
use crate::action::{
    Action, ActionError, ActionErrorKind, ActionFilter, ActionKey, ActionKind, ActionOutcome,
    ActionState, ActionToken,
};
use crate::db::from_millis;
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Re-reads after a unique violation whose holder finished before we could read it.
const MAX_BEGIN_ATTEMPTS: usize = 3;

/// Matches the executor's default timeout plus its bookkeeping slack.
const DEFAULT_ACTION_DEADLINE: Duration = Duration::from_secs(35 * 60);

#[derive(Clone)]
pub struct SqlActionRegistry {
    pool: SqlitePool,
    deadline: Duration,
}

impl SqlActionRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            deadline: DEFAULT_ACTION_DEADLINE,
        }
    }

    /// How long an action may stay pending or running before admission on
    /// its key treats it as abandoned.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Fail non-terminal actions on `key` whose deadline has passed.
    async fn reclaim_abandoned(&self, key: &ActionKey) -> Result<u64> {
        let now = Utc::now().timestamp_millis();
        let reclaimed = sqlx::query(
            "UPDATE actions
             SET state = 'failed', finished_at = ?, error_kind = 'execution_error',
                 error_message = 'abandoned: no result before the action deadline'
             WHERE action_key = ? AND state IN ('pending', 'running') AND deadline < ?",
        )
        .bind(now)
        .bind(key.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if reclaimed > 0 {
            warn!(key = %key, "failed abandoned action past its deadline");
        }
        Ok(reclaimed)
    }

    async fn fetch(&self, token: ActionToken) -> Result<Option<Action>> {
        sqlx::query_as::<_, ActionRow>("SELECT * FROM actions WHERE token = ?")
            .bind(token.to_string())
            .fetch_optional(&self.pool)
            .await?
            .map(ActionRow::into_action)
            .transpose()
    }

    async fn fetch_active(&self, key: &ActionKey) -> Result<Option<Action>> {
        sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM actions WHERE action_key = ? AND state IN ('pending', 'running')",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(ActionRow::into_action)
        .transpose()
    }

    /// Explain why a conditional update matched no row.
    async fn miss(&self, token: ActionToken) -> OrchestratorError {
        match self.fetch(token).await {
            Ok(Some(_)) => OrchestratorError::AlreadyCompleted(token),
            Ok(None) => OrchestratorError::NotFound(format!("action {}", token)),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ActionRegistry for SqlActionRegistry {
    #[instrument(skip(self), fields(key = %key))]
    async fn try_begin(&self, key: &ActionKey, kind: ActionKind) -> Result<Action> {
        self.reclaim_abandoned(key).await?;

        let mut action = Action::pending(key.clone(), kind);
        action.started_at = truncate_millis(action.started_at);
        let deadline_millis = i64::try_from(self.deadline.as_millis()).unwrap_or(i64::MAX);
        let deadline = action.started_at.timestamp_millis().saturating_add(deadline_millis);

        for _ in 0..MAX_BEGIN_ATTEMPTS {
            let inserted = sqlx::query(
                "INSERT INTO actions (token, action_key, kind, state, started_at, deadline)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(action.token.to_string())
            .bind(key.as_str())
            .bind(kind)
            .bind(ActionState::Pending)
            .bind(action.started_at.timestamp_millis())
            .bind(deadline)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {
                    debug!(token = %action.token, %kind, "action registered");
                    return Ok(action);
                }
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    if let Some(existing) = self.fetch_active(key).await? {
                        return Err(OrchestratorError::Conflict(Box::new(existing)));
                    }
                    debug!("active action finished during admission, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        match self.get(key).await? {
            Some(latest) => Err(OrchestratorError::Conflict(Box::new(latest))),
            None => Err(OrchestratorError::NotFound(format!("action for {}", key))),
        }
    }

    async fn mark_running(&self, token: ActionToken) -> Result<Action> {
        sqlx::query("UPDATE actions SET state = 'running' WHERE token = ? AND state = 'pending'")
            .bind(token.to_string())
            .execute(&self.pool)
            .await?;

        match self.fetch(token).await? {
            Some(action) if action.state.is_terminal() => {
                Err(OrchestratorError::AlreadyCompleted(token))
            }
            Some(action) => Ok(action),
            None => Err(OrchestratorError::NotFound(format!("action {}", token))),
        }
    }

    #[instrument(skip(self, outcome), fields(token = %token, state = %outcome.state()))]
    async fn complete(&self, token: ActionToken, outcome: ActionOutcome) -> Result<Action> {
        let error = outcome.error();
        let result = sqlx::query(
            "UPDATE actions
             SET state = ?, finished_at = ?, error_kind = ?, error_message = ?
             WHERE token = ? AND state IN ('pending', 'running')",
        )
        .bind(outcome.state())
        .bind(Utc::now().timestamp_millis())
        .bind(error.as_ref().map(|e| e.kind))
        .bind(error.as_ref().map(|e| e.message.clone()))
        .bind(token.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.miss(token).await);
        }

        self.fetch(token)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("action {}", token)))
    }

    async fn get(&self, key: &ActionKey) -> Result<Option<Action>> {
        sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM actions WHERE action_key = ?
             ORDER BY state IN ('pending', 'running') DESC, started_at DESC
             LIMIT 1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?
        .map(ActionRow::into_action)
        .transpose()
    }

    async fn get_by_token(&self, token: ActionToken) -> Result<Option<Action>> {
        self.fetch(token).await
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let mut query = "SELECT * FROM actions WHERE 1=1".to_string();

        if filter.key.is_some() {
            query.push_str(" AND action_key = ?");
        }
        if filter.kind.is_some() {
            query.push_str(" AND kind = ?");
        }
        if filter.state.is_some() {
            query.push_str(" AND state = ?");
        }
        if filter.active_only {
            query.push_str(" AND state IN ('pending', 'running')");
        }

        query.push_str(" ORDER BY started_at DESC");

        let mut q = sqlx::query_as::<_, ActionRow>(&query);

        if let Some(key) = &filter.key {
            q = q.bind(key.as_str());
        }
        if let Some(kind) = filter.kind {
            q = q.bind(kind);
        }
        if let Some(state) = filter.state {
            q = q.bind(state);
        }

        let rows = q.fetch_all(&self.pool).await?;

        rows.into_iter().map(ActionRow::into_action).collect()
    }

    async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Action>> {
        let rows = sqlx::query_as::<_, ActionRow>(
            "SELECT * FROM actions
             WHERE state NOT IN ('pending', 'running') AND finished_at < ?
             ORDER BY finished_at",
        )
        .bind(cutoff.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ActionRow::into_action).collect()
    }

    async fn remove(&self, tokens: &[ActionToken]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;

        for token in tokens {
            removed += sqlx::query(
                "DELETE FROM actions WHERE token = ? AND state NOT IN ('pending', 'running')",
            )
            .bind(token.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        }

        tx.commit().await?;
        Ok(removed)
    }
}

/// Row shape shared by `actions` and `action_archive`.
#[derive(sqlx::FromRow)]
pub(crate) struct ActionRow {
    token: String,
    action_key: String,
    kind: ActionKind,
    state: ActionState,
    started_at: i64,
    finished_at: Option<i64>,
    error_kind: Option<ActionErrorKind>,
    error_message: Option<String>,
}

impl ActionRow {
    pub(crate) fn into_action(self) -> Result<Action> {
        let error = self.error_kind.map(|kind| ActionError {
            kind,
            message: self.error_message.unwrap_or_default(),
        });

        Ok(Action {
            state: self.state,
            key: ActionKey::from(self.action_key),
            token: self.token.parse()?,
            kind: self.kind,
            started_at: from_millis(self.started_at),
            finished_at: self.finished_at.map(from_millis),
            error,
        })
    }
}

fn truncate_millis(at: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(at.timestamp_millis())
}
