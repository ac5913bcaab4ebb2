use crate::error::ErrorBody;
use crate::routes::workspaces::NewWorkspace;
use lab_orchestrator::{
    Action, ActionError, ActionErrorKind, ActionKind, ActionState, Deployment, DeploymentStatus,
    LogLine, Workspace, WorkspaceStatus,
};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::status,
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::workspaces::list_workspaces,
        crate::routes::workspaces::create_workspace,
        crate::routes::workspaces::get_workspace,
        crate::routes::workspaces::archive_workspace,
        crate::routes::workspaces::start_deploy,
        crate::routes::workspaces::start_destroy,
        crate::routes::workspaces::start_plan,
        crate::routes::workspaces::action_status,
        crate::routes::workspaces::action_history,
        crate::routes::actions::list_actions,
        crate::routes::actions::get_action,
        crate::routes::actions::cancel_action,
        crate::routes::deployments::list_deployments,
        crate::routes::logs::stream_logs,
        crate::routes::logs::log_lines,
    ),
    components(
        schemas(
            Workspace,
            WorkspaceStatus,
            NewWorkspace,
            Action,
            ActionKind,
            ActionState,
            ActionError,
            ActionErrorKind,
            Deployment,
            DeploymentStatus,
            LogLine,
            ErrorBody
        )
    ),
    tags(
        (name = "lab-api", description = "Lab environment orchestration API")
    )
)]
pub struct ApiDoc;
