// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy for the computational scheduler.
//!
//! Every variant carries a fixed, typed payload. Callers decide between retry,
//! abort and propagation from [`SchedulerError::kind`]; the only local recovery
//! performed by the core itself (client eviction) is driven by
//! [`SchedulerError::triggers_client_eviction`].

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{ClusterId, NodeId, ProjectId, RunId};

/// Result type using SchedulerError
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Coarse classification of scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The scheduler, a cluster or a pricing plan is misconfigured. Not retried.
    Configuration,
    /// Cluster resources or wallet credits are insufficient. Not retried.
    ResourceInsufficiency,
    /// The compute backend is unreachable or changed identity.
    BackendConnectivity,
    /// A task, run, cluster or pricing unit does not exist.
    NotFound,
    /// The operation conflicts with the current state of the record.
    Conflict,
    /// A collaborator (catalog, pricing, database) failed.
    Collaborator,
    /// An internal invariant was violated.
    Internal,
}

/// Errors raised by the scheduling core.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Scheduler or cluster configuration is invalid.
    #[error("Configuration error: {msg}")]
    Configuration {
        /// What is misconfigured.
        msg: String,
    },

    /// The requested cluster is not known.
    #[error("Cluster '{cluster_id}' not found")]
    ClusterNotFound {
        /// The cluster ID that was not found.
        cluster_id: ClusterId,
    },

    /// No worker of the cluster advertises the resources a task needs.
    #[error(
        "Service of node {node_id} requires {task_resources:?} but cluster {cluster_id} has no worker providing them"
    )]
    MissingComputationalResources {
        /// The node whose task cannot run.
        node_id: NodeId,
        /// The target cluster.
        cluster_id: ClusterId,
        /// Resources requested by the task.
        task_resources: BTreeMap<String, f64>,
    },

    /// Workers exist but none is large enough for the task.
    #[error(
        "Insufficient computational resources to run node {node_id}: requested {task_resources:?}, no single worker of cluster {cluster_id} is large enough (cluster total {cluster_resources:?})"
    )]
    InsufficientComputationalResources {
        /// The node whose task cannot run.
        node_id: NodeId,
        /// The target cluster.
        cluster_id: ClusterId,
        /// Resources requested by the task.
        task_resources: BTreeMap<String, f64>,
        /// Resources summed over all workers of the cluster.
        cluster_resources: BTreeMap<String, f64>,
    },

    /// The wallet attached to the run has no credits left.
    #[error("Wallet '{wallet_name}' has {wallet_credit_amount} credits")]
    WalletNotEnoughCredits {
        /// Name of the wallet.
        wallet_name: String,
        /// Available credits.
        wallet_credit_amount: Decimal,
    },

    /// The compute backend cannot be reached.
    #[error("The computational backend is not connected: {msg}")]
    ComputationalBackendNotConnected {
        /// Details from the transport.
        msg: String,
    },

    /// The remote scheduler restarted or was replaced since the client connected.
    #[error(
        "The computational scheduler changed from '{original_scheduler_id}' to '{current_scheduler_id}'"
    )]
    ComputationalSchedulerChanged {
        /// Scheduler identity observed when the client was created.
        original_scheduler_id: String,
        /// Scheduler identity observed now.
        current_scheduler_id: String,
    },

    /// A client for a cluster could not be created.
    #[error("Could not acquire a client for cluster {cluster_id}: {source}")]
    ClientAcquisition {
        /// The cluster a client was requested for.
        cluster_id: ClusterId,
        /// The error raised while constructing the client.
        #[source]
        source: Box<SchedulerError>,
    },

    /// The clusters-keeper (fleet manager) did not answer.
    #[error("The clusters-keeper service is not available")]
    ClustersKeeperNotAvailable,

    /// An operation was cancelled before it completed.
    #[error("Operation '{operation}' was cancelled")]
    Cancelled {
        /// The cancelled operation.
        operation: String,
    },

    /// No task exists for the given project and node.
    #[error("Task for node {node_id} of project {project_id} not found")]
    TaskNotFound {
        /// The project ID.
        project_id: ProjectId,
        /// The node ID.
        node_id: NodeId,
    },

    /// No run exists with the given ID.
    #[error("Run {run_id} not found")]
    RunNotFound {
        /// The run ID that was not found.
        run_id: RunId,
    },

    /// The pricing unit referenced by a node does not exist.
    #[error("Pricing unit {pricing_unit_id} of plan {pricing_plan_id} not found")]
    PricingUnitNotFound {
        /// The pricing plan ID.
        pricing_plan_id: i64,
        /// The pricing unit ID.
        pricing_unit_id: i64,
    },

    /// The backend does not know the job.
    #[error("Job '{job_id}' not found in the computational backend")]
    ComputationalBackendTaskNotFound {
        /// The external job ID.
        job_id: String,
    },

    /// The job exists but its results are not available yet.
    #[error("Results of job '{job_id}' are not ready yet")]
    ComputationalBackendTaskResultsNotReady {
        /// The external job ID.
        job_id: String,
    },

    /// Frontend nodes are evaluated client side and never get a backend job.
    #[error("Node {node_id} of project {project_id} is a frontend service and cannot receive a job id")]
    FrontendTaskJobRejected {
        /// The project ID.
        project_id: ProjectId,
        /// The node ID.
        node_id: NodeId,
    },

    /// Outputs were requested for nodes that have no task in the project.
    #[error("Outputs requested for nodes {missing:?} which have no task in project {project_id}")]
    OutputsIncomplete {
        /// The project ID.
        project_id: ProjectId,
        /// Node IDs without a task row.
        missing: Vec<NodeId>,
    },

    /// The compute backend answered with an unexpected error.
    #[error("Computational backend error: {details}")]
    Backend {
        /// Error details.
        details: String,
    },

    /// A collaborator service failed.
    #[error("Collaborator '{service}' failed: {details}")]
    Collaborator {
        /// Name of the collaborator.
        service: String,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// A stored or transported payload could not be (de)serialized.
    #[error("Serialization error: {details}")]
    Serialization {
        /// Error details.
        details: String,
    },
}

impl SchedulerError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::ClusterNotFound { .. } => "CLUSTER_NOT_FOUND",
            Self::MissingComputationalResources { .. } => "MISSING_COMPUTATIONAL_RESOURCES",
            Self::InsufficientComputationalResources { .. } => {
                "INSUFFICIENT_COMPUTATIONAL_RESOURCES"
            }
            Self::WalletNotEnoughCredits { .. } => "WALLET_NOT_ENOUGH_CREDITS",
            Self::ComputationalBackendNotConnected { .. } => "COMPUTATIONAL_BACKEND_NOT_CONNECTED",
            Self::ComputationalSchedulerChanged { .. } => "COMPUTATIONAL_SCHEDULER_CHANGED",
            Self::ClientAcquisition { .. } => "CLIENT_ACQUISITION_ERROR",
            Self::ClustersKeeperNotAvailable => "CLUSTERS_KEEPER_NOT_AVAILABLE",
            Self::Cancelled { .. } => "CANCELLED",
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::PricingUnitNotFound { .. } => "PRICING_UNIT_NOT_FOUND",
            Self::ComputationalBackendTaskNotFound { .. } => {
                "COMPUTATIONAL_BACKEND_TASK_NOT_FOUND"
            }
            Self::ComputationalBackendTaskResultsNotReady { .. } => {
                "COMPUTATIONAL_BACKEND_TASK_RESULTS_NOT_READY"
            }
            Self::FrontendTaskJobRejected { .. } => "FRONTEND_TASK_JOB_REJECTED",
            Self::OutputsIncomplete { .. } => "OUTPUTS_INCOMPLETE",
            Self::Backend { .. } => "COMPUTATIONAL_BACKEND_ERROR",
            Self::Collaborator { .. } => "COLLABORATOR_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
            Self::Serialization { .. } => "SERIALIZATION_ERROR",
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::MissingComputationalResources { .. }
            | Self::InsufficientComputationalResources { .. }
            | Self::WalletNotEnoughCredits { .. } => ErrorKind::ResourceInsufficiency,
            Self::ComputationalBackendNotConnected { .. }
            | Self::ComputationalSchedulerChanged { .. }
            | Self::ClientAcquisition { .. }
            | Self::ClustersKeeperNotAvailable
            | Self::Cancelled { .. } => ErrorKind::BackendConnectivity,
            Self::ClusterNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::PricingUnitNotFound { .. }
            | Self::ComputationalBackendTaskNotFound { .. } => ErrorKind::NotFound,
            Self::ComputationalBackendTaskResultsNotReady { .. }
            | Self::FrontendTaskJobRejected { .. } => ErrorKind::Conflict,
            Self::Backend { .. }
            | Self::Collaborator { .. }
            | Self::Database { .. }
            | Self::Serialization { .. } => ErrorKind::Collaborator,
            Self::OutputsIncomplete { .. } => ErrorKind::Internal,
        }
    }

    /// Whether a client that raised this error must be dropped from the pool.
    pub fn triggers_client_eviction(&self) -> bool {
        matches!(
            self,
            Self::ComputationalBackendNotConnected { .. }
                | Self::ComputationalSchedulerChanged { .. }
                | Self::Cancelled { .. }
        )
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(err: sqlx::Error) -> Self {
        SchedulerError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for SchedulerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        SchedulerError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization {
            details: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_codes_and_kinds() {
        let project_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let test_cases = vec![
            (
                SchedulerError::Configuration {
                    msg: "bad".to_string(),
                },
                "CONFIGURATION_ERROR",
                ErrorKind::Configuration,
            ),
            (
                SchedulerError::WalletNotEnoughCredits {
                    wallet_name: "w".to_string(),
                    wallet_credit_amount: Decimal::ZERO,
                },
                "WALLET_NOT_ENOUGH_CREDITS",
                ErrorKind::ResourceInsufficiency,
            ),
            (
                SchedulerError::ComputationalBackendNotConnected {
                    msg: "down".to_string(),
                },
                "COMPUTATIONAL_BACKEND_NOT_CONNECTED",
                ErrorKind::BackendConnectivity,
            ),
            (
                SchedulerError::TaskNotFound {
                    project_id,
                    node_id,
                },
                "TASK_NOT_FOUND",
                ErrorKind::NotFound,
            ),
            (
                SchedulerError::ComputationalBackendTaskResultsNotReady {
                    job_id: "j".to_string(),
                },
                "COMPUTATIONAL_BACKEND_TASK_RESULTS_NOT_READY",
                ErrorKind::Conflict,
            ),
            (
                SchedulerError::OutputsIncomplete {
                    project_id,
                    missing: vec![node_id],
                },
                "OUTPUTS_INCOMPLETE",
                ErrorKind::Internal,
            ),
        ];

        for (error, expected_code, expected_kind) in test_cases {
            assert_eq!(error.error_code(), expected_code, "code of {:?}", error);
            assert_eq!(error.kind(), expected_kind, "kind of {:?}", error);
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_eviction_policy() {
        assert!(
            SchedulerError::ComputationalBackendNotConnected {
                msg: "x".to_string()
            }
            .triggers_client_eviction()
        );
        assert!(
            SchedulerError::ComputationalSchedulerChanged {
                original_scheduler_id: "a".to_string(),
                current_scheduler_id: "b".to_string(),
            }
            .triggers_client_eviction()
        );
        assert!(
            SchedulerError::Cancelled {
                operation: "submit".to_string()
            }
            .triggers_client_eviction()
        );
        assert!(
            !SchedulerError::ComputationalBackendTaskNotFound {
                job_id: "j".to_string()
            }
            .triggers_client_eviction()
        );
        assert!(!SchedulerError::ClustersKeeperNotAvailable.triggers_client_eviction());
    }

    #[test]
    fn test_client_acquisition_keeps_cause() {
        let err = SchedulerError::ClientAcquisition {
            cluster_id: 3,
            source: Box::new(SchedulerError::ComputationalBackendNotConnected {
                msg: "connection refused".to_string(),
            }),
        };
        let source = std::error::Error::source(&err).expect("cause should be kept");
        assert!(source.to_string().contains("connection refused"));
        assert!(err.to_string().contains("cluster 3"));
    }

    #[test]
    fn test_display() {
        let err = SchedulerError::Database {
            operation: "insert".to_string(),
            details: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Database error during 'insert': connection refused"
        );

        let err = SchedulerError::RunNotFound { run_id: 42 };
        assert_eq!(err.to_string(), "Run 42 not found");
    }
}
