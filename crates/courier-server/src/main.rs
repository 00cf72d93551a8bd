use std::sync::Arc;

use tracing::info;

use courier_db::{Database, DiskFileStore};
use courier_gateway::{Gateway, MessageRouter, Stores};

mod config;

use config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,courier_gateway=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init stores
    let db = Arc::new(Database::open(&config.db_path)?);
    let files = Arc::new(DiskFileStore::new(config.file_dir.clone())?);
    let router = MessageRouter::load(Stores::sqlite(db, files)).await?;

    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Courier server listening on {}", addr);

    Gateway::new(router, config.gateway).run(listener).await;

    Ok(())
}
