//! In-process action registry for single-instance deployments.
//!
//! All state lives behind one `std::sync::Mutex` and no lock is held across an
//! await point, so every operation is linearizable.

use super::ActionRegistry;
use crate::action::{Action, ActionFilter, ActionKey, ActionKind, ActionOutcome, ActionToken};
use crate::error::{OrchestratorError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    actions: HashMap<ActionToken, Action>,
    active: HashMap<ActionKey, ActionToken>,
    latest: HashMap<ActionKey, ActionToken>,
}

#[derive(Debug, Default)]
pub struct InMemoryActionRegistry {
    inner: Mutex<Inner>,
}

impl InMemoryActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Mutations never leave `Inner` half-updated, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ActionRegistry for InMemoryActionRegistry {
    async fn try_begin(&self, key: &ActionKey, kind: ActionKind) -> Result<Action> {
        let mut inner = self.lock();

        if let Some(token) = inner.active.get(key) {
            if let Some(existing) = inner.actions.get(token) {
                return Err(OrchestratorError::Conflict(Box::new(existing.clone())));
            }
        }

        let action = Action::pending(key.clone(), kind);
        inner.active.insert(key.clone(), action.token);
        inner.latest.insert(key.clone(), action.token);
        inner.actions.insert(action.token, action.clone());
        debug!(key = %key, token = %action.token, %kind, "action registered");

        Ok(action)
    }

    async fn mark_running(&self, token: ActionToken) -> Result<Action> {
        let mut inner = self.lock();
        let action = inner
            .actions
            .get_mut(&token)
            .ok_or_else(|| OrchestratorError::NotFound(format!("action {}", token)))?;

        if action.state.is_terminal() {
            return Err(OrchestratorError::AlreadyCompleted(token));
        }
        action.state = crate::action::ActionState::Running;

        Ok(action.clone())
    }

    async fn complete(&self, token: ActionToken, outcome: ActionOutcome) -> Result<Action> {
        let mut inner = self.lock();
        let action = inner
            .actions
            .get_mut(&token)
            .ok_or_else(|| OrchestratorError::NotFound(format!("action {}", token)))?;

        if action.state.is_terminal() {
            return Err(OrchestratorError::AlreadyCompleted(token));
        }
        action.finish(&outcome);
        let completed = action.clone();

        if inner.active.get(&completed.key) == Some(&token) {
            inner.active.remove(&completed.key);
        }
        debug!(key = %completed.key, %token, state = %completed.state, "action completed");

        Ok(completed)
    }

    async fn get(&self, key: &ActionKey) -> Result<Option<Action>> {
        let inner = self.lock();
        Ok(inner
            .latest
            .get(key)
            .and_then(|token| inner.actions.get(token))
            .cloned())
    }

    async fn get_by_token(&self, token: ActionToken) -> Result<Option<Action>> {
        Ok(self.lock().actions.get(&token).cloned())
    }

    async fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>> {
        let inner = self.lock();
        let mut actions: Vec<Action> = inner
            .actions
            .values()
            .filter(|action| filter.matches(action))
            .cloned()
            .collect();
        actions.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        Ok(actions)
    }

    async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Action>> {
        let inner = self.lock();
        Ok(inner
            .actions
            .values()
            .filter(|a| a.state.is_terminal() && a.finished_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect())
    }

    async fn remove(&self, tokens: &[ActionToken]) -> Result<u64> {
        let mut inner = self.lock();
        let mut removed = 0;

        for token in tokens {
            if !inner.actions.get(token).is_some_and(|a| a.state.is_terminal()) {
                continue;
            }
            if let Some(action) = inner.actions.remove(token) {
                if inner.latest.get(&action.key) == Some(token) {
                    inner.latest.remove(&action.key);
                }
                removed += 1;
            }
        }

        Ok(removed)
    }
}
