// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! runstate-core - Run State Orchestration Engine
//!
//! Connects to the configured database, applies migrations, builds the
//! orchestrator and waits for shutdown. Transport adapters embed the library
//! and call into `state_handlers`.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use runstate_core::config::Config;
use runstate_core::orchestrator::OrchestratorBuilder;
use runstate_core::persistence;
use runstate_core::rules::OrchestrationRule;
use runstate_core::state_handlers::{StateHandlerState, handle_health_check};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("runstate_core=info".parse()?),
        )
        .init();

    info!("Starting runstate-core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        max_connections = config.db_max_connections,
        max_commit_attempts = config.max_commit_attempts,
        concurrency_retry_secs = config.concurrency_retry_after.as_secs(),
        heartbeat_timeout_secs = config.heartbeat_timeout.map(|t| t.as_secs()),
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = persistence::connect(&config.database_url, config.db_max_connections).await?;
    info!("Database connection established, migrations applied");

    let orchestrator = OrchestratorBuilder::from_config(&config)
        .persistence(persistence)
        .build()?;
    let handlers = StateHandlerState::new(Arc::new(orchestrator));

    let healthy = handle_health_check(&handlers).await?;
    info!(healthy, "Database health check passed");

    info!(
        rules = ?handlers.orchestrator.pipeline().rules().iter().map(|r| r.name()).collect::<Vec<_>>(),
        "runstate-core initialized successfully"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    Ok(())
}
