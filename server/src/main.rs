//! Weft Server binary.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use weft_server::config::Config;
use weft_server::{db, router, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Weft Server on {}:{}", config.host, config.port);

    let schema = config.load_schema()?;
    let database = db::shared(db::open_database(&config, schema)?);

    let state = AppState::new(database.clone(), config.clone());
    let flush_task = state.conn_manager.spawn_flush_task(config.flush_interval);
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    flush_task.abort();
    db::persist(&database, &config).await?;
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
