//! urldex server binary

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use urldex::config::{AppConfig, LogFormat};
use urldex::query::QueryEngine;
use urldex::storage::local::LocalStorage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;

    // Initialize tracing
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "urldex={},tower_http=info",
            config.logging.level
        ))
    });
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    tracing::info!("Using storage path: {}", config.storage.base_path);
    let storage = Arc::new(LocalStorage::new(&config.storage.base_path)?);

    let engine = QueryEngine::open(storage, config.cache.clone())
        .await
        .context("failed to open the query engine; has an index been built?")?;
    let stats = engine.stats();
    tracing::info!(
        "Serving index version {} ({} domains, {} files)",
        stats.version,
        stats.num_domains,
        stats.num_files
    );

    let app = urldex::api::create_router(Arc::new(engine));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
