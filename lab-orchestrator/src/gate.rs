//! Admission control shared by request handlers and the reaper.
//!
//! [`AdmissionGate::admit`] is the only way an action comes into existence.
//! It hands back an [`ActionGuard`], which owns the obligation to complete the
//! action: completing it explicitly, supervising a future that might panic, or
//! being dropped mid-flight all end with the action in a terminal state, so a
//! crashed handler never leaves its key locked.

use crate::action::{Action, ActionErrorKind, ActionKey, ActionKind, ActionOutcome, ActionToken};
use crate::error::{OrchestratorError, Result};
use crate::registry::ActionRegistry;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AdmissionGate {
    registry: Arc<dyn ActionRegistry>,
}

impl AdmissionGate {
    pub fn new(registry: Arc<dyn ActionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn ActionRegistry> {
        &self.registry
    }

    /// Atomically register a `kind` action on `key`.
    ///
    /// On `Conflict` the error carries the action currently holding the key;
    /// nothing is queued and the caller is expected to poll or retry.
    pub async fn admit(&self, key: &ActionKey, kind: ActionKind) -> Result<ActionGuard> {
        match self.registry.try_begin(key, kind).await {
            Ok(action) => {
                info!(key = %key, token = %action.token, %kind, "action admitted");
                Ok(ActionGuard {
                    registry: self.registry.clone(),
                    action,
                    armed: true,
                })
            }
            Err(OrchestratorError::Conflict(existing)) => {
                debug!(
                    key = %key,
                    holder = %existing.token,
                    state = %existing.state,
                    "admission refused, key busy"
                );
                Err(OrchestratorError::Conflict(existing))
            }
            Err(e) => Err(e),
        }
    }

    /// The non-terminal action holding `key`, without admitting anything.
    pub async fn check(&self, key: &ActionKey) -> Result<Option<Action>> {
        Ok(self.registry.get(key).await?.filter(Action::is_active))
    }
}

/// Scoped ownership of an admitted action.
pub struct ActionGuard {
    registry: Arc<dyn ActionRegistry>,
    action: Action,
    armed: bool,
}

impl std::fmt::Debug for ActionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionGuard")
            .field("action", &self.action)
            .field("armed", &self.armed)
            .finish()
    }
}

impl ActionGuard {
    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn token(&self) -> ActionToken {
        self.action.token
    }

    pub fn key(&self) -> &ActionKey {
        &self.action.key
    }

    pub fn kind(&self) -> ActionKind {
        self.action.kind
    }

    pub async fn mark_running(&mut self) -> Result<()> {
        self.action = self.registry.mark_running(self.action.token).await?;
        Ok(())
    }

    /// Complete the action. The guard stays armed if the registry could not
    /// record the outcome, so the drop path retries with a failure.
    pub async fn complete(mut self, outcome: ActionOutcome) -> Result<Action> {
        match self.registry.complete(self.action.token, outcome).await {
            Ok(action) => {
                self.armed = false;
                Ok(action)
            }
            Err(e @ OrchestratorError::AlreadyCompleted(_)) => {
                self.armed = false;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Run `work` to produce the outcome, completing the action with it.
    ///
    /// A panic inside `work` completes the action as `Failed(ExecutionError)`.
    pub async fn supervise<F>(self, work: F) -> Result<Action>
    where
        F: Future<Output = ActionOutcome>,
    {
        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(token = %self.action.token, panic = %message, "guarded action panicked");
                ActionOutcome::failed(
                    ActionErrorKind::ExecutionError,
                    format!("action panicked: {}", message),
                )
            }
        };

        self.complete(outcome).await
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let registry = self.registry.clone();
        let token = self.action.token;
        let key = self.action.key.clone();
        warn!(key = %key, %token, "action dropped before completion, marking failed");

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(key = %key, %token, "no runtime to fail dropped action");
            return;
        };

        handle.spawn(async move {
            let outcome = ActionOutcome::failed(
                ActionErrorKind::ExecutionError,
                "executor stopped before the action completed",
            );
            match registry.complete(token, outcome).await {
                Ok(_) | Err(OrchestratorError::AlreadyCompleted(_)) => {}
                Err(e) => error!(key = %key, %token, error = %e, "failed to fail dropped action"),
            }
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionState;
    use crate::registry::InMemoryActionRegistry;
    use std::time::Duration;

    fn gate() -> AdmissionGate {
        AdmissionGate::new(Arc::new(InMemoryActionRegistry::new()))
    }

    fn key() -> ActionKey {
        ActionKey::for_workspace("frank", "ws")
    }

    async fn wait_terminal(gate: &AdmissionGate, token: ActionToken) -> Action {
        for _ in 0..100 {
            if let Some(action) = gate.registry().get_by_token(token).await.unwrap() {
                if action.state.is_terminal() {
                    return action;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("action {} never became terminal", token);
    }

    #[tokio::test]
    async fn conflict_reports_current_holder() {
        let gate = gate();
        let mut guard = gate.admit(&key(), ActionKind::Deploy).await.unwrap();
        guard.mark_running().await.unwrap();

        let err = gate.admit(&key(), ActionKind::Destroy).await.unwrap_err();
        let holder = err.conflicting_action().unwrap();
        assert_eq!(holder.token, guard.token());
        assert_eq!(holder.state, ActionState::Running);

        let checked = gate.check(&key()).await.unwrap().unwrap();
        assert_eq!(checked.token, guard.token());

        guard.complete(ActionOutcome::Succeeded).await.unwrap();
        assert!(gate.check(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn supervise_fails_action_on_panic() {
        let gate = gate();
        let guard = gate.admit(&key(), ActionKind::Deploy).await.unwrap();

        let work = async {
            let explode = true;
            if explode {
                panic!("boom");
            }
            ActionOutcome::Succeeded
        };
        let action = guard.supervise(work).await.unwrap();

        assert_eq!(action.state, ActionState::Failed);
        let error = action.error.unwrap();
        assert_eq!(error.kind, ActionErrorKind::ExecutionError);
        assert!(error.message.contains("boom"));

        // The key is free again
        gate.admit(&key(), ActionKind::Deploy).await.unwrap();
    }

    #[tokio::test]
    async fn dropped_guard_fails_action_and_frees_key() {
        let gate = gate();
        let guard = gate.admit(&key(), ActionKind::Destroy).await.unwrap();
        let token = guard.token();
        drop(guard);

        let action = wait_terminal(&gate, token).await;
        assert_eq!(action.state, ActionState::Failed);
        assert_eq!(action.error.unwrap().kind, ActionErrorKind::ExecutionError);
        gate.admit(&key(), ActionKind::Destroy).await.unwrap();
    }

    #[tokio::test]
    async fn aborted_task_fails_its_action() {
        let gate = gate();
        let guard = gate.admit(&key(), ActionKind::Deploy).await.unwrap();
        let token = guard.token();

        let task = tokio::spawn(async move {
            guard.supervise(std::future::pending::<ActionOutcome>()).await
        });
        tokio::task::yield_now().await;
        task.abort();

        let action = wait_terminal(&gate, token).await;
        assert_eq!(action.state, ActionState::Failed);
    }

    #[tokio::test]
    async fn completed_guard_does_not_touch_action_on_drop() {
        let gate = gate();
        let guard = gate.admit(&key(), ActionKind::Plan).await.unwrap();
        let token = guard.token();
        guard.complete(ActionOutcome::Succeeded).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let action = gate.registry().get_by_token(token).await.unwrap().unwrap();
        assert_eq!(action.state, ActionState::Succeeded);
    }
}
