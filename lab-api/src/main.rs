use anyhow::Result;
use lab_api::{create_app, AppState, Config};
use lab_orchestrator::db::{backup_database, create_pool, run_migrations};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing; RUST_LOG overrides the default filter
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lab_api=debug,lab_orchestrator=debug,tower_http=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting lab-api service...");

    // Load configuration
    let config = Config::from_env();
    config.validate()?;
    info!(
        bind_addr = %config.bind_addr,
        db_path = %config.db_path.display(),
        registry = ?config.registry_backend,
        "Configuration loaded"
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    // Create pool and run migrations
    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let state = AppState::from_config(pool, &config).await?;

    let mut tasks = Vec::new();
    if config.reaper_enabled {
        tasks.push(state.service.reaper(config.reaper_interval()).start());
        info!(
            "Deployment reaper started (interval: {}s)",
            config.reaper_interval_secs
        );
    } else {
        info!("Deployment reaper disabled");
    }
    tasks.push(
        state
            .service
            .archiver(config.action_retention())
            .start(config.archiver_interval()),
    );

    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    for task in tasks {
        task.shutdown().await;
    }
    info!("lab-api stopped");

    Ok(())
}
