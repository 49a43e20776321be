//! # Calendar Sync Service Entry Point

use calendar_sync::{
    config::ConfigLoader, db::init_pool, migration::Migrator, server::run_server, telemetry,
};
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from layered env files and variables
    let config = ConfigLoader::new().load()?;
    config.validate()?;

    telemetry::init_tracing(&config)?;
    tracing::info!(profile = %config.profile, "Configuration loaded");
    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Effective configuration");
    }

    let db = init_pool(&config).await?;
    Migrator::up(&db, None).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
        }
        signal.cancel();
    });

    run_server(config, db, shutdown).await?;
    Ok(())
}
