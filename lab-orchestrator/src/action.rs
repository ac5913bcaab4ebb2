use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Identity of the target an action operates on: `{owner}/{workspace_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ActionKey(String);

impl ActionKey {
    pub fn for_workspace(owner: &str, workspace_id: &str) -> Self {
        Self(format!("{}/{}", owner, workspace_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn owner(&self) -> &str {
        self.0.split_once('/').map(|(owner, _)| owner).unwrap_or("")
    }

    pub fn workspace_id(&self) -> &str {
        self.0.split_once('/').map(|(_, ws)| ws).unwrap_or("")
    }
}

impl FromStr for ActionKey {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((owner, ws)) if !owner.is_empty() && !ws.is_empty() && !ws.contains('/') => {
                Ok(Self(s.to_string()))
            }
            _ => Err(OrchestratorError::Validation(format!(
                "action key must look like owner/workspace, got '{}'",
                s
            ))),
        }
    }
}

impl From<String> for ActionKey {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle issued by a successful admission; identifies one action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct ActionToken(Uuid);

impl ActionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ActionToken {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| OrchestratorError::Validation(format!("invalid action token '{}'", s)))
    }
}

impl fmt::Display for ActionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ActionKind {
    Deploy,
    Destroy,
    Plan,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Deploy => "deploy",
            ActionKind::Destroy => "destroy",
            ActionKind::Plan => "plan",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ActionState::Succeeded | ActionState::Failed | ActionState::Cancelled
        )
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionState::Pending => "pending",
            ActionState::Running => "running",
            ActionState::Succeeded => "succeeded",
            ActionState::Failed => "failed",
            ActionState::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// The tool exited abnormally, the executor crashed, or bookkeeping failed.
    ExecutionError,
    /// The run exceeded the per-action execution timeout.
    TimedOut,
    Cancelled,
}

impl fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionErrorKind::ExecutionError => "execution_error",
            ActionErrorKind::TimedOut => "timed_out",
            ActionErrorKind::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A tracked unit of long-running mutating work against a target.
///
/// Serializes to the status response shape returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Action {
    pub state: ActionState,
    #[serde(rename = "action_key")]
    #[schema(value_type = String)]
    pub key: ActionKey,
    #[schema(value_type = String, format = Uuid)]
    pub token: ActionToken,
    pub kind: ActionKind,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ActionError>,
}

impl Action {
    pub(crate) fn pending(key: ActionKey, kind: ActionKind) -> Self {
        Self {
            state: ActionState::Pending,
            key,
            token: ActionToken::new(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    pub(crate) fn finish(&mut self, outcome: &ActionOutcome) {
        self.state = outcome.state();
        self.finished_at = Some(Utc::now());
        self.error = outcome.error();
    }
}

/// Terminal result handed to `ActionRegistry::complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed(ActionError),
    Cancelled { reason: String },
}

impl ActionOutcome {
    pub fn failed(kind: ActionErrorKind, message: impl Into<String>) -> Self {
        ActionOutcome::Failed(ActionError::new(kind, message))
    }

    pub fn state(&self) -> ActionState {
        match self {
            ActionOutcome::Succeeded => ActionState::Succeeded,
            ActionOutcome::Failed(_) => ActionState::Failed,
            ActionOutcome::Cancelled { .. } => ActionState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<ActionError> {
        match self {
            ActionOutcome::Succeeded => None,
            ActionOutcome::Failed(err) => Some(err.clone()),
            ActionOutcome::Cancelled { reason } => {
                Some(ActionError::new(ActionErrorKind::Cancelled, reason.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActionFilter {
    pub key: Option<ActionKey>,
    pub kind: Option<ActionKind>,
    pub state: Option<ActionState>,
    pub active_only: bool,
}

impl ActionFilter {
    pub fn matches(&self, action: &Action) -> bool {
        self.key.as_ref().map_or(true, |k| *k == action.key)
            && self.kind.map_or(true, |k| k == action.kind)
            && self.state.map_or(true, |s| s == action.state)
            && (!self.active_only || action.is_active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_owner_and_workspace() {
        let key = ActionKey::for_workspace("alice", "ws-1");
        assert_eq!(key.as_str(), "alice/ws-1");
        assert_eq!(key.owner(), "alice");
        assert_eq!(key.workspace_id(), "ws-1");
        assert_eq!("alice/ws-1".parse::<ActionKey>().unwrap(), key);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        for raw in ["", "alice", "/ws", "alice/", "a/b/c"] {
            assert!(
                matches!(
                    raw.parse::<ActionKey>(),
                    Err(OrchestratorError::Validation(_))
                ),
                "expected validation error for {:?}",
                raw
            );
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!ActionState::Pending.is_terminal());
        assert!(!ActionState::Running.is_terminal());
        assert!(ActionState::Succeeded.is_terminal());
        assert!(ActionState::Failed.is_terminal());
        assert!(ActionState::Cancelled.is_terminal());
    }

    #[test]
    fn action_serializes_to_status_shape() {
        let mut action = Action::pending(ActionKey::for_workspace("bob", "lab"), ActionKind::Deploy);
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["action_key"], "bob/lab");
        assert_eq!(json["kind"], "deploy");
        assert!(json.get("finished_at").is_none());
        assert!(json.get("error").is_none());

        action.finish(&ActionOutcome::failed(ActionErrorKind::TimedOut, "too slow"));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "timed_out");
        assert!(json["finished_at"].is_string());
    }

    #[test]
    fn filter_matches_on_every_field() {
        let action = Action::pending(ActionKey::for_workspace("a", "w"), ActionKind::Plan);
        assert!(ActionFilter::default().matches(&action));
        assert!(ActionFilter {
            active_only: true,
            ..Default::default()
        }
        .matches(&action));
        assert!(!ActionFilter {
            kind: Some(ActionKind::Deploy),
            ..Default::default()
        }
        .matches(&action));
        assert!(!ActionFilter {
            state: Some(ActionState::Running),
            ..Default::default()
        }
        .matches(&action));
    }
}
