//! Database connection and migrations.

use std::sync::Arc;

use anyhow::{Context, Result};
use relgate_engine::{Engine, EngineConfig, PgStore};

/// Connect to the configured database, apply migrations and build an engine.
pub async fn connect_engine(config: EngineConfig) -> Result<Engine> {
    let store = connect_store(&config).await?;
    Engine::new(Arc::new(store), config).context("failed to initialize engine")
}

async fn connect_store(config: &EngineConfig) -> Result<PgStore> {
    let url = config.require_database_url()?;
    PgStore::connect_and_migrate(url, config)
        .await
        .context("failed to connect to the database")
}

/// Apply pending migrations and exit.
pub async fn run_migrate(config: &EngineConfig) -> Result<u8> {
    connect_store(config).await?;
    println!("migrations applied");
    Ok(0)
}
