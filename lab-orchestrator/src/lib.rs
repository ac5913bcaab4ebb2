//! Orchestration core for ephemeral lab environments.
//!
//! Users start deploy, destroy and plan actions against their workspaces. At
//! most one action runs per workspace at a time; the admission gate enforces
//! this for user requests and the deployment reaper alike. The crate is
//! consumed by the lab-api HTTP service but has no HTTP dependency itself.

pub mod action;
pub mod archive;
pub mod broker;
pub mod db;
pub mod deployment;
pub mod error;
pub mod executor;
pub mod gate;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod tasks;
pub mod workspace;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use action::{
    Action, ActionError, ActionErrorKind, ActionFilter, ActionKey, ActionKind, ActionOutcome,
    ActionState, ActionToken,
};
pub use archive::{ActionArchiver, ArchiveStore};
pub use broker::{BrokerConfig, Lagged, LogBroker, LogLine, LogSink, LogSubscription, StartAt};
pub use deployment::{Deployment, DeploymentStatus, DeploymentStore};
pub use error::{OrchestratorError, Result};
pub use executor::{ExecutorConfig, InfraTool, Invocation, ProvisioningExecutor, StateLocks, TerraformCli};
pub use gate::{ActionGuard, AdmissionGate};
pub use reaper::{DeploymentReaper, ReapReport};
pub use registry::{build_registry, ActionRegistry, InMemoryActionRegistry, RegistryBackend, SqlActionRegistry};
pub use service::LabService;
pub use tasks::BackgroundTask;
pub use workspace::{CreateWorkspaceRequest, Workspace, WorkspaceFilters, WorkspaceStatus, WorkspaceStore};
