// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute client trait definitions.
//!
//! Defines the abstract interface to a compute cluster and the types exchanged
//! with it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simcore_comp_core::models::Image;
use simcore_comp_core::{ClusterId, DEFAULT_CLUSTER_ID, NodeId, ProjectId, Result, RunningState, UserId};

/// How input/output files are handed to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileLinkType {
    /// Direct S3 links.
    S3,
    /// Presigned HTTP links.
    Presigned,
}

impl fmt::Display for FileLinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileLinkType::S3 => write!(f, "s3"),
            FileLinkType::Presigned => write!(f, "presigned"),
        }
    }
}

impl FromStr for FileLinkType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(FileLinkType::S3),
            "presigned" => Ok(FileLinkType::Presigned),
            _ => Err(format!("Unknown file link type: {}", s)),
        }
    }
}

/// Credentials used to reach a cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClusterAuthentication {
    /// Direct, unauthenticated connection to the scheduler.
    None,
    /// Gateway with basic authentication.
    Simple {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Gateway behind a JupyterHub token.
    Jupyterhub {
        /// API token.
        api_token: String,
    },
    /// Gateway with Kerberos authentication.
    Kerberos,
}

impl ClusterAuthentication {
    /// Whether the cluster is reached through a gateway.
    pub fn is_gateway(&self) -> bool {
        !matches!(self, ClusterAuthentication::None)
    }

    /// Short name of the scheme, safe to log.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterAuthentication::None => "none",
            ClusterAuthentication::Simple { .. } => "simple",
            ClusterAuthentication::Jupyterhub { .. } => "jupyterhub",
            ClusterAuthentication::Kerberos => "kerberos",
        }
    }
}

impl fmt::Debug for ClusterAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterAuthentication::Simple { username, .. } => f
                .debug_struct("Simple")
                .field("username", username)
                .field("password", &"********")
                .finish(),
            ClusterAuthentication::Jupyterhub { .. } => f
                .debug_struct("Jupyterhub")
                .field("api_token", &"********")
                .finish(),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Where a cluster runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterType {
    /// Permanent cluster.
    #[default]
    OnPremise,
    /// Permanent cluster in AWS.
    Aws,
    /// Cluster created for a user on demand.
    OnDemand,
}

/// A compute cluster the scheduler can submit to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster identifier.
    pub id: ClusterId,
    /// Display name.
    pub name: String,
    /// Scheduler or gateway endpoint.
    pub endpoint: String,
    /// Credentials.
    pub authentication: ClusterAuthentication,
    /// Where the cluster runs.
    #[serde(default)]
    pub cluster_type: ClusterType,
}

impl Cluster {
    /// The cluster configured through the environment.
    pub fn default_cluster(endpoint: impl Into<String>, authentication: ClusterAuthentication) -> Self {
        Self {
            id: DEFAULT_CLUSTER_ID,
            name: "Default cluster".to_string(),
            endpoint: endpoint.into(),
            authentication,
            cluster_type: ClusterType::OnPremise,
        }
    }

    /// Whether this is the environment-configured cluster.
    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_CLUSTER_ID
    }
}

/// A task ready to be submitted to a cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    /// Owner of the run.
    pub user_id: UserId,
    /// Project of the task.
    pub project_id: ProjectId,
    /// Node of the task.
    pub node_id: NodeId,
    /// What to run.
    pub image: Image,
    /// Resolved inputs.
    pub inputs: Map<String, Value>,
    /// Expected outputs.
    pub output_schema: Map<String, Value>,
    /// Where the service uploads its logs.
    pub log_file_url: Option<String>,
}

/// Lifecycle status of a cluster scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerStatus {
    /// Starting up.
    Init,
    /// Accepting work.
    Running,
    /// Temporarily not accepting work.
    Paused,
    /// Shutting down.
    Closing,
    /// Shut down.
    Closed,
    /// Crashed.
    Failed,
    /// Reported a status we do not know.
    #[serde(other)]
    Unknown,
}

/// Resources and identity of one worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker identifier (usually its address).
    #[serde(default)]
    pub id: String,
    /// Resources advertised by the worker (`CPU`, `RAM`, `GPU`, ...).
    #[serde(default)]
    pub resources: BTreeMap<String, f64>,
}

/// Snapshot of a cluster scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerInfo {
    /// Identity of the scheduler process; changes when it restarts.
    pub scheduler_id: String,
    /// Scheduler status.
    pub status: SchedulerStatus,
    /// Connected workers keyed by address.
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerInfo>,
}

/// State change of a task pushed by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStateEvent {
    /// Backend job id.
    pub job_id: String,
    /// New state.
    pub state: RunningState,
    /// Optional message (error text for failures).
    pub msg: Option<String>,
}

/// Progress report of a running task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskProgressEvent {
    /// Backend job id.
    pub job_id: String,
    /// Progress between 0 and 1.
    pub progress: f64,
}

/// Log line emitted by a running task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskLogEvent {
    /// Backend job id.
    pub job_id: String,
    /// Log line.
    pub log: String,
    /// Python-style log level (20 = info).
    pub log_level: i32,
}

/// Push event from the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// State change.
    State(TaskStateEvent),
    /// Progress report.
    Progress(TaskProgressEvent),
    /// Log line.
    Log(TaskLogEvent),
}

impl TaskEvent {
    /// Job the event is about.
    pub fn job_id(&self) -> &str {
        match self {
            TaskEvent::State(e) => &e.job_id,
            TaskEvent::Progress(e) => &e.job_id,
            TaskEvent::Log(e) => &e.job_id,
        }
    }
}

/// Callbacks invoked for backend push events.
#[async_trait]
pub trait TaskEventHandler: Send + Sync {
    /// A task changed state.
    async fn on_task_state(&self, event: TaskStateEvent) -> Result<()>;

    /// A task reported progress.
    async fn on_task_progress(&self, event: TaskProgressEvent) -> Result<()>;

    /// A task emitted a log line.
    async fn on_task_log(&self, event: TaskLogEvent) -> Result<()> {
        tracing::debug!(job_id = %event.job_id, level = event.log_level, "{}", event.log);
        Ok(())
    }
}

/// Shared handler set installed on every new client.
pub type TaskHandlers = Arc<dyn TaskEventHandler>;

/// One session with a compute cluster.
///
/// Implementations must be safe to use from several tasks at once.
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Cluster this client is connected to.
    fn cluster_id(&self) -> ClusterId;

    /// File link type used for this cluster.
    fn file_link_type(&self) -> FileLinkType;

    /// Short name of the implementation.
    fn client_type(&self) -> &'static str;

    /// Submit one task and return its job id.
    async fn submit(&self, cluster_id: ClusterId, task: &TaskDefinition) -> Result<String>;

    /// State of one job.
    async fn get_status(&self, job_id: &str) -> Result<RunningState> {
        let states = self.get_tasks_status(&[job_id.to_string()]).await?;
        Ok(states.into_iter().next().unwrap_or(RunningState::Unknown))
    }

    /// States of several jobs, in the order of `job_ids`.
    async fn get_tasks_status(&self, job_ids: &[String]) -> Result<Vec<RunningState>>;

    /// Cancel a job. Unknown jobs are ignored.
    async fn cancel(&self, job_id: &str) -> Result<()>;

    /// Outputs of a finished job.
    async fn get_task_result(&self, job_id: &str) -> Result<Map<String, Value>>;

    /// Drop the stored result of a job.
    async fn release_task_result(&self, job_id: &str) -> Result<()>;

    /// Link to the cluster dashboard, when there is one.
    fn dashboard_link(&self) -> Option<String>;

    /// Scheduler identity, status and workers.
    async fn scheduler_info(&self) -> Result<SchedulerInfo>;

    /// Scheduler status.
    async fn status(&self) -> Result<SchedulerStatus>;

    /// Release the session. Calling it again is a no-op.
    async fn delete(&self) -> Result<()>;
}

/// Creates compute clients for the pool.
#[async_trait]
pub trait ComputeClientFactory: Send + Sync {
    /// Open a session with `cluster`.
    async fn create(
        &self,
        cluster: &Cluster,
        file_link_type: FileLinkType,
        handlers: Option<TaskHandlers>,
    ) -> Result<Arc<dyn ComputeClient>>;
}
