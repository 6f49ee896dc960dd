// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runplane Core - Run Lifecycle Engine
//!
//! Standalone entry point: connects to the configured database, applies
//! migrations, wires up the run service and waits for shutdown. Transports
//! embed the library instead of talking to this process.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tracing::{error, info};

use runplane_core::config::Config;
use runplane_core::migrations;
use runplane_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use runplane_core::service::RunServiceBuilder;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runplane_core=info".parse()?),
        )
        .init();

    info!("Starting Runplane Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        force_cancel_cooldown_secs = config.force_cancel_cooldown.as_secs(),
        artifact_cache_capacity = config.artifact_cache_capacity,
        event_buffer = config.event_buffer,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        info!("Running SQLite migrations...");
        migrations::run_sqlite(&pool).await?;
        Arc::new(SqlitePersistence::new(pool))
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.database_url)
            .await?;
        info!("Running PostgreSQL migrations...");
        migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };
    info!("Migrations completed");

    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database health check passed");

    let service = RunServiceBuilder::from_config(&config)
        .persistence(persistence)
        .build()?;
    info!(?service, "Runplane Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    info!(
        subscribers = service.event_bus().subscriber_count(),
        "Shutdown complete"
    );

    Ok(())
}
