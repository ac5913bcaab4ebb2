//! Authoritative record of in-flight and completed actions.
//!
//! The [`ActionRegistry`] trait is the single shared mutable structure of the
//! orchestrator. Every implementation must make `try_begin` an atomic
//! check-and-register so that at most one non-terminal action exists per key.
//!
//! - [`InMemoryActionRegistry`]: single instance, guarded by one mutex
//! - [`SqlActionRegistry`]: backed by a shared SQL store for multi-instance
//!   deployments, using a partial unique index as the compare-and-register

pub mod memory;
pub mod sql;

pub use memory::InMemoryActionRegistry;
pub use sql::SqlActionRegistry;

use crate::action::{Action, ActionFilter, ActionKey, ActionKind, ActionOutcome, ActionToken};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ActionRegistry: Send + Sync {
    /// Register a new pending action for `key`.
    ///
    /// Fails with `OrchestratorError::Conflict` carrying the existing action
    /// when the key already has a non-terminal action.
    async fn try_begin(&self, key: &ActionKey, kind: ActionKind) -> Result<Action>;

    /// Move a pending action to running.
    async fn mark_running(&self, token: ActionToken) -> Result<Action>;

    /// Move an action to a terminal state.
    ///
    /// Returns `AlreadyCompleted` without mutating anything if the action is
    /// already terminal, and `NotFound` for an unknown token.
    async fn complete(&self, token: ActionToken, outcome: ActionOutcome) -> Result<Action>;

    /// Latest action registered for `key`.
    async fn get(&self, key: &ActionKey) -> Result<Option<Action>>;

    async fn get_by_token(&self, token: ActionToken) -> Result<Option<Action>>;

    /// Actions matching `filter`, newest first.
    async fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>>;

    /// Terminal actions that finished before `cutoff`.
    async fn finished_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Action>>;

    /// Drop the given terminal actions. Tokens that are unknown or still
    /// active are skipped; returns how many were removed.
    async fn remove(&self, tokens: &[ActionToken]) -> Result<u64>;
}

/// Which registry implementation backs admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// In-process registry; correct for a single instance only.
    #[default]
    Memory,
    /// Registry rows in the shared database.
    Shared,
}

impl std::str::FromStr for RegistryBackend {
    type Err = crate::error::OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(RegistryBackend::Memory),
            "shared" => Ok(RegistryBackend::Shared),
            other => Err(crate::error::OrchestratorError::Validation(format!(
                "unknown registry backend '{}', expected 'memory' or 'shared'",
                other
            ))),
        }
    }
}

/// Build the registry selected by configuration.
///
/// `action_deadline` bounds how long a shared-registry action may stay
/// non-terminal before another instance may reclaim its key.
pub fn build_registry(
    backend: RegistryBackend,
    shared: &SqlitePool,
    action_deadline: Duration,
) -> Arc<dyn ActionRegistry> {
    match backend {
        RegistryBackend::Memory => Arc::new(InMemoryActionRegistry::new()),
        RegistryBackend::Shared => {
            Arc::new(SqlActionRegistry::new(shared.clone()).with_deadline(action_deadline))
        }
    }
}
