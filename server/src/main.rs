//! Depot Server binary.

use depot_server::config::Config;
use depot_server::db::{MemoryRepository, PgRepository, RecordRepository};
use depot_server::{app, AppState};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Depot Server on {}:{}", config.host, config.port);

    let repo: Arc<dyn RecordRepository> = match &config.database_url {
        Some(url) => Arc::new(PgRepository::connect(url).await?),
        None => {
            tracing::warn!("DATABASE_URL not set, keeping records in memory");
            Arc::new(MemoryRepository::new(config.key_field.clone()))
        }
    };

    let addr = format!("{}:{}", config.host, config.port);
    let app = app(AppState::new(repo, config));

    // Start server
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
