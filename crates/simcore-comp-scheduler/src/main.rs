// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Computational scheduler service.
//!
//! Connects the task store, keeps a client to the default cluster open and
//! records the task events it pushes until the process is interrupted.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use simcore_comp_scheduler::compute::SchedulerStatus;
use simcore_comp_scheduler::{
    ClusterClientPool, Config, GatewayClientFactory, TaskEventRecorder, connect_task_store,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Failed to load .env file: {}", e);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "simcore_comp_scheduler=info,simcore_comp_core=info",
                )
            }),
        )
        .init();

    info!("Starting computational scheduler");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    let default_cluster = config.default_cluster();

    info!(
        default_cluster = %default_cluster.endpoint,
        auth = default_cluster.authentication.kind(),
        task_update_concurrency = config.task_update_concurrency,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let store = connect_task_store(&config.database_url, config.task_update_concurrency).await?;

    let factory = Arc::new(GatewayClientFactory::new(config.gateway_settings()));
    let pool = ClusterClientPool::new(factory, config.pool_settings());
    pool.register_handlers(Arc::new(TaskEventRecorder::new(store)))
        .await;

    // A failing default cluster is not fatal: clients are created on demand.
    match pool
        .acquire(&default_cluster, |client| async move { client.status().await })
        .await
    {
        Ok(SchedulerStatus::Running) => info!("Default cluster is running"),
        Ok(status) => warn!(?status, "Default cluster is not running"),
        Err(e) => warn!(error = %e, "Default cluster is not reachable"),
    }

    info!("Computational scheduler initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    for (cluster_id, e) in pool.delete().await {
        warn!(cluster_id, error = %e, "Failed to close cluster client");
    }

    info!("Computational scheduler stopped");
    Ok(())
}
