use std::sync::Arc;

use hypewatch::api::{ApiServer, ApiServerConfig, AppState};
use hypewatch::config::AppConfig;
use hypewatch::database;
use hypewatch::logging::init_logging;
use hypewatch::services::ServiceContainer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();

    // Keep the guard alive so buffered log lines are flushed on exit
    let (logging_config, _log_guard) = init_logging(&config.log_dir)?;
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        channels = ?config.default_channels,
        "Starting hypewatch"
    );

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let api_config = ApiServerConfig::from_app_config(&config);
    let container = Arc::new(ServiceContainer::new(config, pool));
    container.initialize();

    let cancel_token = container.cancellation_token();
    logging_config.start_retention_cleanup(cancel_token.clone());

    let state = AppState::from_container(&container).with_logging_config(logging_config);
    let server = ApiServer::with_state(api_config, state).with_cancel_token(cancel_token.clone());

    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl-C, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl-C: {}", e),
        }
        signal_token.cancel();
    });

    let served = server.run().await;
    if let Err(e) = &served {
        tracing::error!("API server error: {}", e);
    }

    container.shutdown().await?;
    tracing::info!("hypewatch stopped");

    served?;
    Ok(())
}
