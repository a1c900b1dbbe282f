// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forge Environment - CI/CD Run Orchestration Server
//!
//! Runs the forge engine:
//! - Job scheduler (promotion, dispatch, run completion)
//! - Container execution of jobs
//! - Log streaming hub
//! - Webhook delivery and retries

use std::sync::Arc;
use tracing::{info, warn};

use forge_core::SchedulerConfig;
use forge_core::LogHubSweeperConfig;
use forge_environment::backend::{Backend, ContainerBackend, ContainerBackendConfig};
use forge_environment::config::Config;
use forge_environment::runtime::ForgeRuntime;
use forge_webhooks::{DeliveryRetryWorkerConfig, DispatcherConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "forge_environment=info,forge_core=info,forge_webhooks=info".into()
            }),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        container_cli = %config.container_cli,
        job_image = %config.job_image,
        workers = config.workers.len(),
        "Starting Forge Environment"
    );

    // Connect to database (migrations run on connect)
    let persistence = forge_core::persistence::connect(&config.database_url).await?;
    info!("Connected to database");

    let backend = Arc::new(ContainerBackend::new(ContainerBackendConfig {
        cli: config.container_cli.clone(),
        ..ContainerBackendConfig::from_env()
    }));
    info!(backend_type = backend.backend_type(), "Backend initialized");

    let secrets = config.secret_resolver()?;

    // Start the runtime
    let runtime = ForgeRuntime::builder()
        .persistence(persistence)
        .backend(backend)
        .secrets(secrets)
        .workers(config.workers.clone())
        .scheduler_config(SchedulerConfig::from_env())
        .executor_config(config.executor_config())
        .log_buffer(config.log_buffer)
        .sweeper_config(LogHubSweeperConfig {
            poll_interval: config.log_sweep_interval,
        })
        .dispatcher_config(DispatcherConfig::from_env())
        .retry_config(DeliveryRetryWorkerConfig::from_env())
        .build()?
        .start()
        .await?;

    info!("Forge Environment ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Forge Environment shut down");

    Ok(())
}
