// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

use crate::compute::{Cluster, ClusterAuthentication, FileLinkType, GatewaySettings};
use crate::pool::PoolSettings;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL or SQLite connection URL
    pub database_url: String,
    /// Gateway URL of the default cluster
    pub default_cluster_url: String,
    /// Credentials of the default cluster
    pub default_cluster_auth: ClusterAuthentication,
    /// File link type of the default cluster
    pub default_cluster_file_link_type: FileLinkType,
    /// File link type of other permanent clusters
    pub default_file_link_type: FileLinkType,
    /// File link type of on-demand clusters
    pub on_demand_clusters_file_link_type: FileLinkType,
    /// Maximum concurrent writes of bulk task updates
    pub task_update_concurrency: usize,
    /// Interval between two event polls of gateway clients
    pub event_poll_interval: Duration,
    /// Timeout of a single gateway HTTP request
    pub http_timeout: Duration,
}

fn var_or(key: &'static str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn file_link_type(key: &'static str, default: &str) -> Result<FileLinkType, ConfigError> {
    var_or(key, default)
        .parse()
        .map_err(|_| ConfigError::Invalid(key, "must be one of 's3', 'presigned'"))
}

fn positive_integer(key: &'static str, default: &str) -> Result<u64, ConfigError> {
    match var_or(key, default).parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::Invalid(key, "must be a positive integer")),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `COMP_SCHEDULER_DATABASE_URL`: PostgreSQL or SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_URL` (default: `http://dask-gateway:8000`)
    /// - `COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_AUTH`: JSON credentials (default: `{"type":"none"}`)
    /// - `COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_FILE_LINK_TYPE` (default: `s3`)
    /// - `COMPUTATIONAL_BACKEND_DEFAULT_FILE_LINK_TYPE` (default: `presigned`)
    /// - `COMPUTATIONAL_BACKEND_ON_DEMAND_CLUSTERS_FILE_LINK_TYPE` (default: `presigned`)
    /// - `COMP_SCHEDULER_TASK_UPDATE_CONCURRENCY` (default: 20)
    /// - `COMP_SCHEDULER_EVENT_POLL_INTERVAL_MS` (default: 1000)
    /// - `COMP_SCHEDULER_HTTP_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("COMP_SCHEDULER_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("COMP_SCHEDULER_DATABASE_URL"))?;

        let default_cluster_url = var_or(
            "COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_URL",
            "http://dask-gateway:8000",
        );
        if !default_cluster_url.starts_with("http://") && !default_cluster_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(
                "COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_URL",
                "must be an http(s) URL",
            ));
        }

        let default_cluster_auth: ClusterAuthentication = serde_json::from_str(&var_or(
            "COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_AUTH",
            r#"{"type":"none"}"#,
        ))
        .map_err(|_| {
            ConfigError::Invalid(
                "COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_AUTH",
                "must be a JSON object with a 'type' of none, simple, jupyterhub or kerberos",
            )
        })?;

        Ok(Self {
            database_url,
            default_cluster_url,
            default_cluster_auth,
            default_cluster_file_link_type: file_link_type(
                "COMPUTATIONAL_BACKEND_DEFAULT_CLUSTER_FILE_LINK_TYPE",
                "s3",
            )?,
            default_file_link_type: file_link_type(
                "COMPUTATIONAL_BACKEND_DEFAULT_FILE_LINK_TYPE",
                "presigned",
            )?,
            on_demand_clusters_file_link_type: file_link_type(
                "COMPUTATIONAL_BACKEND_ON_DEMAND_CLUSTERS_FILE_LINK_TYPE",
                "presigned",
            )?,
            task_update_concurrency: positive_integer(
                "COMP_SCHEDULER_TASK_UPDATE_CONCURRENCY",
                "20",
            )? as usize,
            event_poll_interval: Duration::from_millis(positive_integer(
                "COMP_SCHEDULER_EVENT_POLL_INTERVAL_MS",
                "1000",
            )?),
            http_timeout: Duration::from_secs(positive_integer(
                "COMP_SCHEDULER_HTTP_TIMEOUT_SECS",
                "30",
            )?),
        })
    }

    /// The environment-configured cluster.
    pub fn default_cluster(&self) -> Cluster {
        Cluster::default_cluster(&self.default_cluster_url, self.default_cluster_auth.clone())
    }

    /// File link types of the client pool.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            default_cluster_file_link_type: self.default_cluster_file_link_type,
            default_file_link_type: self.default_file_link_type,
            on_demand_clusters_file_link_type: self.on_demand_clusters_file_link_type,
        }
    }

    /// Settings of gateway clients.
    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            http_timeout: self.http_timeout,
            event_poll_interval: self.event_poll_interval,
            ..GatewaySettings::default()
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
