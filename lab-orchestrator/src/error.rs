use crate::action::{Action, ActionToken};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Action {} already {} for {}", .0.token, .0.state, .0.key)]
    Conflict(Box<Action>),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Action already completed: {0}")]
    AlreadyCompleted(ActionToken),

    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// The action currently holding the key, when this is a conflict.
    pub fn conflicting_action(&self) -> Option<&Action> {
        match self {
            OrchestratorError::Conflict(action) => Some(action),
            _ => None,
        }
    }
}
