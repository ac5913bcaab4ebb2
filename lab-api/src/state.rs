use crate::config::Config;
use lab_orchestrator::db::{connect_shared, run_migrations};
use lab_orchestrator::{build_registry, LabService, RegistryBackend, TerraformCli};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub service: LabService,
    pub pool: SqlitePool,
    pub registry_backend: RegistryBackend,
}

impl AppState {
    pub fn new(pool: SqlitePool, service: LabService, registry_backend: RegistryBackend) -> Self {
        Self {
            service,
            pool,
            registry_backend,
        }
    }

    /// Wire the service from configuration: registry backend, Terraform CLI, limits.
    pub async fn from_config(pool: SqlitePool, config: &Config) -> anyhow::Result<Self> {
        let registry_pool = match (&config.registry_backend, &config.shared_store_url) {
            (RegistryBackend::Shared, Some(url)) => {
                info!(url = %url, "connecting to shared registry store");
                let shared = connect_shared(url).await?;
                run_migrations(&shared).await?;
                shared
            }
            _ => pool.clone(),
        };
        let executor = config.executor_config();
        let registry = build_registry(config.registry_backend, &registry_pool, executor.action_deadline());

        let tool = Arc::new(TerraformCli::new(&config.terraform_bin, &config.labs_dir));
        let service = LabService::new(pool.clone(), registry, tool, config.broker_config(), executor);

        Ok(Self::new(pool, service, config.registry_backend))
    }
}
