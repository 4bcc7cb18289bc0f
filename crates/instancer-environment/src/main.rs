// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Instancer - per-owner challenge instance lifecycle service.
//!
//! Runs the reclaim scheduler against the tracking database and keeps the
//! lifecycle manager ready for the platform's request layer.

use std::sync::Arc;
use tracing::{info, warn};

use instancer_core::persistence::{PostgresPersistence, ProviderConfigStore};
use instancer_environment::config::Config;
use instancer_environment::gateway::{ComputeGateway, HttpComputeGateway, ResilientGateway};
use instancer_environment::runtime::InstancerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the filter reads RUST_LOG
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "instancer_environment=info,instancer_core=info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        sweep_interval_secs = config.sweep_interval.as_secs(),
        auto_reclaim = config.auto_reclaim_enabled,
        "Starting Instancer"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;

    info!("Connected to database");

    instancer_core::migrations::run_postgres(&pool).await?;

    info!("Database schema verified");

    let persistence = Arc::new(PostgresPersistence::new(pool));

    if let Some(provider) = &config.seed_provider {
        persistence.save_provider_config(provider).await?;
        info!(region = %provider.region, "Provider configuration seeded from environment");
    }

    let gateway = Arc::new(ResilientGateway::with_config(
        HttpComputeGateway::new(),
        config.resilience(),
    ));
    info!(provider_type = gateway.provider_type(), "Gateway initialized");

    let runtime = InstancerRuntime::builder()
        .persistence(persistence)
        .gateway(gateway)
        .secret_policy(config.secret_policy())
        .scheduler_config(config.scheduler())
        .build()?
        .start()
        .await?;

    info!("Instancer ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Instancer shut down");

    Ok(())
}
