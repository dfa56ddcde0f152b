// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain models for computational tasks and runs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Project identifier.
pub type ProjectId = Uuid;
/// Node (pipeline step) identifier, unique within a project.
pub type NodeId = Uuid;
/// User identifier.
pub type UserId = i64;
/// Compute cluster identifier.
pub type ClusterId = u64;
/// Run identifier assigned by the `comp_runs` table.
pub type RunId = i64;

/// Identifier of the cluster configured through the environment.
pub const DEFAULT_CLUSTER_ID: ClusterId = 0;

/// Lifecycle state of a computational task (or of a whole run).
///
/// ```text
/// NOT_STARTED -> PUBLISHED -> WAITING_FOR_RESOURCES | WAITING_FOR_CLUSTER
///             -> PENDING -> STARTED -> SUCCESS | FAILED | ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunningState {
    /// State could not be determined. Persisted as `FAILED`.
    Unknown,
    /// Node flagged to run, waiting for the scheduler.
    Published,
    /// Task row exists but nothing was requested yet.
    NotStarted,
    /// Submitted to the backend, not yet picked by a worker.
    Pending,
    /// The backend has no worker able to run the task yet.
    WaitingForResources,
    /// The cluster is being created or is not ready.
    WaitingForCluster,
    /// A worker is running the task.
    Started,
    /// Finished successfully.
    Success,
    /// Finished with errors.
    Failed,
    /// Stopped before completion.
    Aborted,
}

/// States in which a task will not change anymore.
pub const COMPLETED_STATES: [RunningState; 3] = [
    RunningState::Success,
    RunningState::Failed,
    RunningState::Aborted,
];

impl RunningState {
    /// Database representation. `UNKNOWN` is stored as `FAILED`.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RunningState::Unknown | RunningState::Failed => "FAILED",
            RunningState::Published => "PUBLISHED",
            RunningState::NotStarted => "NOT_STARTED",
            RunningState::Pending => "PENDING",
            RunningState::WaitingForResources => "WAITING_FOR_RESOURCES",
            RunningState::WaitingForCluster => "WAITING_FOR_CLUSTER",
            RunningState::Started => "STARTED",
            RunningState::Success => "SUCCESS",
            RunningState::Aborted => "ABORTED",
        }
    }

    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        COMPLETED_STATES.contains(self)
    }

    fn rank(&self) -> u8 {
        match self {
            RunningState::NotStarted => 0,
            RunningState::Published => 1,
            RunningState::Pending
            | RunningState::WaitingForResources
            | RunningState::WaitingForCluster => 2,
            RunningState::Started => 3,
            RunningState::Unknown
            | RunningState::Success
            | RunningState::Failed
            | RunningState::Aborted => 4,
        }
    }

    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Re-applying the same state is always legal. Terminal states only accept
    /// themselves; a new lineage starts with a fresh publish. Pending and the
    /// waiting states may alternate since the backend reports them as it
    /// (re)assigns workers.
    pub fn can_transition_to(&self, next: RunningState) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if next == RunningState::Aborted {
            return true;
        }
        next.rank() >= self.rank() && !(next.rank() == self.rank() && self.rank() < 2)
    }
}

impl fmt::Display for RunningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunningState::Unknown => write!(f, "UNKNOWN"),
            other => write!(f, "{}", other.as_db_str()),
        }
    }
}

impl FromStr for RunningState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UNKNOWN" => Ok(RunningState::Unknown),
            "PUBLISHED" => Ok(RunningState::Published),
            "NOT_STARTED" => Ok(RunningState::NotStarted),
            "PENDING" => Ok(RunningState::Pending),
            "WAITING_FOR_RESOURCES" => Ok(RunningState::WaitingForResources),
            "WAITING_FOR_CLUSTER" => Ok(RunningState::WaitingForCluster),
            "STARTED" => Ok(RunningState::Started),
            "SUCCESS" => Ok(RunningState::Success),
            "FAILED" => Ok(RunningState::Failed),
            "ABORTED" => Ok(RunningState::Aborted),
            _ => Err(format!("Unknown running state: {}", s)),
        }
    }
}

/// Class of a workbench node, derived from its service key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeClass {
    /// Batch service executed on a compute cluster.
    Computational,
    /// Long running interactive service.
    Interactive,
    /// Evaluated by the frontend (file pickers, parameters).
    Frontend,
}

impl NodeClass {
    /// Derive the node class from a service key such as `simcore/services/comp/sleeper`.
    pub fn from_service_key(key: &str) -> Option<Self> {
        let mut parts = key.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("simcore"), Some("services"), Some("comp")) => Some(NodeClass::Computational),
            (Some("simcore"), Some("services"), Some("dynamic")) => Some(NodeClass::Interactive),
            (Some("simcore"), Some("services"), Some("frontend")) => Some(NodeClass::Frontend),
            _ => None,
        }
    }

    /// Database representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            NodeClass::Computational => "COMPUTATIONAL",
            NodeClass::Interactive => "INTERACTIVE",
            NodeClass::Frontend => "FRONTEND",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for NodeClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "COMPUTATIONAL" => Ok(NodeClass::Computational),
            "INTERACTIVE" => Ok(NodeClass::Interactive),
            "FRONTEND" => Ok(NodeClass::Frontend),
            _ => Err(format!("Unknown node class: {}", s)),
        }
    }
}

/// How a service container boots on a worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BootMode {
    /// Regular CPU boot.
    #[default]
    Cpu,
    /// Boot with GPU access.
    Gpu,
    /// Boot as an MPI job.
    Mpi,
}

/// Hardware a task needs on a worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRequirements {
    /// Number of CPUs.
    #[serde(rename = "CPU")]
    pub cpu: f64,
    /// Number of GPUs.
    #[serde(rename = "GPU", default, skip_serializing_if = "Option::is_none")]
    pub gpu: Option<f64>,
    /// RAM in bytes.
    #[serde(rename = "RAM")]
    pub ram: u64,
    /// GPU memory in bytes.
    #[serde(rename = "VRAM", default, skip_serializing_if = "Option::is_none")]
    pub vram: Option<u64>,
}

fn default_command() -> Vec<String> {
    vec!["run".to_string()]
}

/// Everything needed to start a node's service on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// Service key, e.g. `simcore/services/comp/sleeper`.
    pub name: String,
    /// Service version.
    pub tag: String,
    /// Resources reserved for the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_requirements: Option<NodeRequirements>,
    /// Boot mode.
    #[serde(default)]
    pub boot_mode: BootMode,
    /// Container command.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Extra container environment.
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
}

impl Image {
    /// Image with default boot mode, command and no requirements.
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
            node_requirements: None,
            boot_mode: BootMode::default(),
            command: default_command(),
            envs: BTreeMap::new(),
        }
    }
}

/// Input/output port schema of the node's service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    /// Input ports.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Output ports.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Structured error attached to a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDict {
    /// Location of the error (e.g. node id, port key).
    pub loc: Vec<String>,
    /// Human readable message.
    pub msg: String,
    /// Machine readable error type.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Extra context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx: Option<Value>,
}

/// Billing binding of a task. The unit cost itself is not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingInfo {
    /// Pricing plan.
    pub pricing_plan_id: i64,
    /// Pricing unit within the plan.
    pub pricing_unit_id: i64,
    /// Current cost entry of the unit.
    pub pricing_unit_cost_id: i64,
}

/// Cloud hardware bound to a task through its pricing unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    /// EC2 instance type names, first one is the selected type.
    #[serde(default)]
    pub aws_ec2_instances: Vec<String>,
}

/// A row of the live `comp_tasks` table (or of the snapshot table).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompTask {
    /// Surrogate key.
    pub task_id: i64,
    /// Owning project.
    pub project_id: ProjectId,
    /// Node of the project's workbench.
    pub node_id: NodeId,
    /// Backend job identifier once submitted.
    pub job_id: Option<String>,
    /// 1-based position in the pipeline.
    pub internal_id: i32,
    /// Service port schema.
    pub schema: NodeSchema,
    /// Resolved inputs.
    pub inputs: Map<String, Value>,
    /// Produced outputs.
    pub outputs: Map<String, Value>,
    /// Image to run.
    pub image: Image,
    /// Digest of inputs+outputs of the last successful run.
    pub run_hash: Option<String>,
    /// Current state.
    pub state: RunningState,
    /// Progress between 0 and 1.
    pub progress: Option<f64>,
    /// Errors of a failed task.
    pub errors: Option<Vec<ErrorDict>>,
    /// Class of node.
    pub node_class: NodeClass,
    /// When the task was submitted (published).
    pub submit: Option<DateTime<Utc>>,
    /// When a worker started it.
    pub start: Option<DateTime<Utc>>,
    /// When it reached a final state.
    pub end: Option<DateTime<Utc>>,
    /// Last liveness report of a running task.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Row creation time.
    pub created: DateTime<Utc>,
    /// Row modification time.
    pub modified: DateTime<Utc>,
    /// Billing binding.
    pub pricing_info: Option<PricingInfo>,
    /// Hardware binding.
    pub hardware_info: HardwareInfo,
}

/// A task as produced by the graph assembler, ready to be upserted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCompTask {
    /// Owning project.
    pub project_id: ProjectId,
    /// Node of the project's workbench.
    pub node_id: NodeId,
    /// 1-based position in the pipeline.
    pub internal_id: i32,
    /// Service port schema.
    pub schema: NodeSchema,
    /// Node inputs.
    pub inputs: Map<String, Value>,
    /// Node outputs.
    pub outputs: Map<String, Value>,
    /// Image to run.
    pub image: Image,
    /// Initial state.
    pub state: RunningState,
    /// Initial progress.
    pub progress: Option<f64>,
    /// Class of node.
    pub node_class: NodeClass,
    /// Submission time.
    pub submit: DateTime<Utc>,
    /// Billing binding.
    pub pricing_info: Option<PricingInfo>,
    /// Hardware binding.
    pub hardware_info: HardwareInfo,
}

/// Partial update of one task. `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskUpdate {
    /// New state.
    pub state: Option<RunningState>,
    /// New progress.
    pub progress: Option<f64>,
    /// New errors; `Some(None)` clears them.
    pub errors: Option<Option<Vec<ErrorDict>>>,
    /// Start time.
    pub start: Option<DateTime<Utc>>,
    /// End time.
    pub end: Option<DateTime<Utc>>,
    /// Last heartbeat.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Backend job id.
    pub job_id: Option<String>,
}

impl TaskUpdate {
    /// Update that only changes the state.
    pub fn state(state: RunningState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }

    /// Whether nothing would be written.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// A row of `comp_runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompRun {
    /// Run identifier.
    pub run_id: RunId,
    /// Project of the run.
    pub project_uuid: ProjectId,
    /// User that started the run.
    pub user_id: UserId,
    /// Iteration number per project and user, starting at 1.
    pub iteration: i64,
    /// Groups runs started together.
    pub collection_run_id: String,
    /// Aggregated state of the run.
    pub result: RunningState,
    /// Free-form run metadata (wallet, product, ...).
    pub metadata: Value,
    /// Whether tasks run on an on-demand cluster.
    pub use_on_demand_clusters: bool,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Modification time.
    pub modified: DateTime<Utc>,
    /// When the run started.
    pub started: Option<DateTime<Utc>>,
    /// When the run ended.
    pub ended: Option<DateTime<Utc>>,
}

/// Snapshot of a task within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompRunSnapshotTask {
    /// Surrogate key.
    pub snapshot_task_id: i64,
    /// Run this snapshot belongs to.
    pub run_id: RunId,
    /// Mirrored task.
    pub task: CompTask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_persists_as_failed() {
        assert_eq!(RunningState::Unknown.as_db_str(), "FAILED");
        assert_eq!(
            "FAILED".parse::<RunningState>().unwrap(),
            RunningState::Failed
        );
    }

    #[test]
    fn test_db_round_trip_of_known_states() {
        for state in [
            RunningState::Published,
            RunningState::NotStarted,
            RunningState::Pending,
            RunningState::WaitingForResources,
            RunningState::WaitingForCluster,
            RunningState::Started,
            RunningState::Success,
            RunningState::Failed,
            RunningState::Aborted,
        ] {
            assert_eq!(state.as_db_str().parse::<RunningState>().unwrap(), state);
        }
    }

    #[test]
    fn test_transitions() {
        use RunningState::*;
        assert!(NotStarted.can_transition_to(Published));
        assert!(Published.can_transition_to(WaitingForCluster));
        assert!(WaitingForResources.can_transition_to(Pending));
        assert!(Pending.can_transition_to(WaitingForResources));
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Success));
        assert!(Started.can_transition_to(Failed));
        assert!(Published.can_transition_to(Aborted));

        // idempotent
        assert!(Started.can_transition_to(Started));
        assert!(Success.can_transition_to(Success));

        // backwards and out of terminal states
        assert!(!Started.can_transition_to(Pending));
        assert!(!Published.can_transition_to(NotStarted));
        assert!(!Success.can_transition_to(Started));
        assert!(!Aborted.can_transition_to(Published));
        assert!(!Failed.can_transition_to(Aborted));
    }

    #[test]
    fn test_node_class_from_key() {
        assert_eq!(
            NodeClass::from_service_key("simcore/services/comp/itis/sleeper"),
            Some(NodeClass::Computational)
        );
        assert_eq!(
            NodeClass::from_service_key("simcore/services/dynamic/jupyter-math"),
            Some(NodeClass::Interactive)
        );
        assert_eq!(
            NodeClass::from_service_key("simcore/services/frontend/file-picker"),
            Some(NodeClass::Frontend)
        );
        assert_eq!(NodeClass::from_service_key("docker/library/busybox"), None);
    }

    #[test]
    fn test_node_requirements_serialization() {
        let reqs = NodeRequirements {
            cpu: 1.5,
            gpu: None,
            ram: 1024,
            vram: None,
        };
        let json = serde_json::to_value(&reqs).unwrap();
        assert_eq!(json, serde_json::json!({"CPU": 1.5, "RAM": 1024}));
    }

    #[test]
    fn test_image_defaults() {
        let image: Image =
            serde_json::from_value(serde_json::json!({"name": "simcore/services/comp/a", "tag": "1.0.0"}))
                .unwrap();
        assert_eq!(image.command, vec!["run".to_string()]);
        assert_eq!(image.boot_mode, BootMode::Cpu);
        assert!(image.envs.is_empty());
    }
}
