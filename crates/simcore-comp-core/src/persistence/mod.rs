// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence of computational tasks and runs.
//!
//! Two tables hold task state: the live `comp_tasks` table (one row per
//! project node) and `comp_run_snapshot_tasks` (one row per node per run).
//! Every state/progress/timestamp change goes to both inside one transaction.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresTaskStore;
pub use self::sqlite::SqliteTaskStore;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::{Map, Value};
use sqlx::types::Json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::models::{
    CompRun, CompRunSnapshotTask, CompTask, ErrorDict, HardwareInfo, Image, NewCompTask,
    NodeClass, NodeId, NodeSchema, PricingInfo, ProjectId, RunId, RunningState, TaskUpdate,
    UserId,
};

/// Default number of concurrent per-task writes in bulk updates.
pub const DEFAULT_UPDATE_CONCURRENCY: usize = 20;

/// Columns written by a publish (insert or conflict update).
pub(crate) const UPSERT_COLUMNS: [&str; 15] = [
    "project_id",
    "node_id",
    "internal_id",
    "schema",
    "inputs",
    "outputs",
    "image",
    "state",
    "progress",
    "node_class",
    "submit",
    "created",
    "modified",
    "pricing_info",
    "hardware_info",
];

/// Columns that are never overwritten when a row already exists.
const INSERT_ONLY_COLUMNS: [&str; 3] = ["project_id", "node_id", "created"];

/// Task columns shared by the live and the snapshot tables.
pub(crate) const TASK_COLUMNS: &str = r#"project_id, node_id, job_id, internal_id, schema, inputs, outputs, image,
    run_hash, state, progress, errors, node_class, submit, start, "end", last_heartbeat,
    created, modified, pricing_info, hardware_info"#;

/// Columns that must not be overwritten when republishing an existing node.
///
/// `state` and `progress` belong to the scheduler once a node ran, so they are
/// only reset when the node is published again. `outputs` are produced by the
/// backend, except for frontend nodes whose outputs are edited by the user.
pub fn columns_to_exclude(
    node_id: NodeId,
    node_class: NodeClass,
    published_nodes: &[NodeId],
) -> BTreeSet<&'static str> {
    let mut excluded = BTreeSet::new();
    if !published_nodes.contains(&node_id) {
        excluded.insert("state");
        excluded.insert("progress");
    }
    if node_class != NodeClass::Frontend {
        excluded.insert("outputs");
    }
    excluded
}

/// Placeholder flavour of the SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placeholder {
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
    /// `?1`, `?2`, ... (SQLite)
    Question,
}

impl Placeholder {
    fn nth(&self, n: usize) -> String {
        match self {
            Placeholder::Dollar => format!("${}", n),
            Placeholder::Question => format!("?{}", n),
        }
    }
}

/// Build the publish statement for one task.
///
/// Binds follow [`UPSERT_COLUMNS`] order.
pub(crate) fn upsert_task_sql(placeholder: Placeholder, excluded: &BTreeSet<&str>) -> String {
    let columns = UPSERT_COLUMNS
        .iter()
        .map(|c| format!("\"{}\"", c))
        .collect::<Vec<_>>()
        .join(", ");
    let values = (1..=UPSERT_COLUMNS.len())
        .map(|i| placeholder.nth(i))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = UPSERT_COLUMNS
        .iter()
        .filter(|c| !INSERT_ONLY_COLUMNS.contains(c) && !excluded.contains(*c))
        .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO comp_tasks ({columns}) VALUES ({values}) \
         ON CONFLICT (project_id, node_id) DO UPDATE SET {updates} \
         RETURNING task_id, {TASK_COLUMNS}"
    )
}

/// Raw `comp_tasks` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRow {
    pub task_id: i64,
    pub project_id: String,
    pub node_id: String,
    pub job_id: Option<String>,
    pub internal_id: i32,
    pub schema: Json<NodeSchema>,
    pub inputs: Json<Map<String, Value>>,
    pub outputs: Json<Map<String, Value>>,
    pub image: Json<Image>,
    pub run_hash: Option<String>,
    pub state: String,
    pub progress: Option<f64>,
    pub errors: Option<Json<Vec<ErrorDict>>>,
    pub node_class: String,
    pub submit: Option<DateTime<Utc>>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub pricing_info: Option<Json<PricingInfo>>,
    pub hardware_info: Json<HardwareInfo>,
}

/// Raw `comp_run_snapshot_tasks` row. `task_id` is aliased to the snapshot id.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SnapshotTaskRow {
    pub snapshot_task_id: i64,
    pub run_id: i64,
    #[sqlx(flatten)]
    pub task: TaskRow,
}

/// Raw `comp_runs` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RunRow {
    pub run_id: i64,
    pub project_uuid: String,
    pub user_id: i64,
    pub iteration: i64,
    pub collection_run_id: String,
    pub result: String,
    pub metadata: Json<Value>,
    pub use_on_demand_clusters: bool,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

fn parse_uuid(column: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| SchedulerError::Serialization {
        details: format!("invalid {} '{}': {}", column, value, e),
    })
}

fn parse_state(value: &str) -> Result<RunningState> {
    value
        .parse()
        .map_err(|details| SchedulerError::Serialization { details })
}

impl TryFrom<TaskRow> for CompTask {
    type Error = SchedulerError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(CompTask {
            task_id: row.task_id,
            project_id: parse_uuid("project_id", &row.project_id)?,
            node_id: parse_uuid("node_id", &row.node_id)?,
            job_id: row.job_id,
            internal_id: row.internal_id,
            schema: row.schema.0,
            inputs: row.inputs.0,
            outputs: row.outputs.0,
            image: row.image.0,
            run_hash: row.run_hash,
            state: parse_state(&row.state)?,
            progress: row.progress,
            errors: row.errors.map(|e| e.0),
            node_class: row
                .node_class
                .parse()
                .map_err(|details| SchedulerError::Serialization { details })?,
            submit: row.submit,
            start: row.start,
            end: row.end,
            last_heartbeat: row.last_heartbeat,
            created: row.created,
            modified: row.modified,
            pricing_info: row.pricing_info.map(|p| p.0),
            hardware_info: row.hardware_info.0,
        })
    }
}

impl TryFrom<SnapshotTaskRow> for CompRunSnapshotTask {
    type Error = SchedulerError;

    fn try_from(row: SnapshotTaskRow) -> Result<Self> {
        Ok(CompRunSnapshotTask {
            snapshot_task_id: row.snapshot_task_id,
            run_id: row.run_id,
            task: row.task.try_into()?,
        })
    }
}

impl TryFrom<RunRow> for CompRun {
    type Error = SchedulerError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(CompRun {
            run_id: row.run_id,
            project_uuid: parse_uuid("project_uuid", &row.project_uuid)?,
            user_id: row.user_id,
            iteration: row.iteration,
            collection_run_id: row.collection_run_id,
            result: parse_state(&row.result)?,
            metadata: row.metadata.0,
            use_on_demand_clusters: row.use_on_demand_clusters,
            created: row.created,
            modified: row.modified,
            started: row.started,
            ended: row.ended,
        })
    }
}

pub(crate) fn rows_into<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = SchedulerError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Outcome of a best-effort bulk update.
#[derive(Debug, Default)]
pub struct TaskUpdateReport {
    /// Nodes whose rows were written.
    pub updated: Vec<NodeId>,
    /// Nodes whose write failed, with the error.
    pub failed: Vec<(NodeId, SchedulerError)>,
}

impl TaskUpdateReport {
    /// Whether every write succeeded.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Storage of computational tasks, task snapshots and runs.
#[allow(missing_docs)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Fetch one task, `TaskNotFound` when absent.
    async fn get_task(&self, project_id: ProjectId, node_id: NodeId) -> Result<CompTask>;

    /// All tasks of a project ordered by `internal_id`.
    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<CompTask>>;

    /// Replace the project's task set with `tasks`.
    ///
    /// Rows whose node is not in `workbench_node_ids` are deleted. Existing
    /// rows are updated except for the columns given by [`columns_to_exclude`].
    async fn upsert_tasks_from_project(
        &self,
        project_id: ProjectId,
        workbench_node_ids: &[NodeId],
        tasks: &[NewCompTask],
        published_nodes: &[NodeId],
    ) -> Result<Vec<CompTask>>;

    /// Apply a partial update to the live row and to the run's snapshot row.
    async fn update_task(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        run_id: RunId,
        update: TaskUpdate,
    ) -> Result<CompTask>;

    /// Abort computational tasks still waiting to be scheduled. Returns the
    /// number of live rows changed.
    async fn mark_project_published_waiting_for_cluster_tasks_as_aborted(
        &self,
        project_id: ProjectId,
        run_id: RunId,
    ) -> Result<u64>;

    /// Delete every live task of the project. Returns the number of rows deleted.
    async fn delete_tasks_from_project(&self, project_id: ProjectId) -> Result<u64>;

    async fn create_run(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        collection_run_id: &str,
        metadata: Value,
        use_on_demand_clusters: bool,
    ) -> Result<CompRun>;

    async fn get_run(&self, run_id: RunId) -> Result<CompRun>;

    async fn get_latest_run(&self, project_id: ProjectId, user_id: UserId)
    -> Result<Option<CompRun>>;

    /// Copy the project's live rows into the run's snapshot table.
    async fn create_snapshot_tasks(
        &self,
        project_id: ProjectId,
        run_id: RunId,
    ) -> Result<Vec<CompRunSnapshotTask>>;

    async fn list_run_snapshot_tasks(&self, run_id: RunId) -> Result<Vec<CompRunSnapshotTask>>;

    async fn list_collection_run_tasks(
        &self,
        collection_run_id: &str,
    ) -> Result<Vec<CompRunSnapshotTask>>;

    /// Maximum concurrent writes issued by bulk updates.
    fn update_concurrency(&self) -> usize {
        DEFAULT_UPDATE_CONCURRENCY
    }

    async fn task_exists(&self, project_id: ProjectId, node_id: NodeId) -> Result<bool> {
        match self.get_task(project_id, node_id).await {
            Ok(_) => Ok(true),
            Err(SchedulerError::TaskNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Computational tasks of a project ordered by `internal_id`.
    async fn list_computational_tasks(&self, project_id: ProjectId) -> Result<Vec<CompTask>> {
        Ok(self
            .list_tasks(project_id)
            .await?
            .into_iter()
            .filter(|t| t.node_class == NodeClass::Computational)
            .collect())
    }

    /// Apply the same update to several tasks of a run.
    ///
    /// Writes run concurrently, bounded by [`TaskStore::update_concurrency`].
    /// A failing node does not stop the others; failures are reported back.
    async fn update_project_tasks_state(
        &self,
        project_id: ProjectId,
        run_id: RunId,
        node_ids: &[NodeId],
        update: TaskUpdate,
    ) -> Result<TaskUpdateReport> {
        let concurrency = self.update_concurrency().max(1);
        let results: Vec<(NodeId, Result<CompTask>)> = futures::stream::iter(node_ids.to_vec())
            .map(|node_id| {
                let update = update.clone();
                async move {
                    let result = self.update_task(project_id, node_id, run_id, update).await;
                    (node_id, result)
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = TaskUpdateReport::default();
        for (node_id, result) in results {
            match result {
                Ok(_) => report.updated.push(node_id),
                Err(e) => {
                    warn!(%project_id, %node_id, run_id, error = %e, "Failed to update task state");
                    report.failed.push((node_id, e));
                }
            }
        }
        debug!(
            %project_id,
            run_id,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "Bulk task update finished"
        );
        Ok(report)
    }

    /// Store the backend job id. Frontend tasks never get one.
    async fn set_task_job_id(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        run_id: RunId,
        job_id: &str,
    ) -> Result<CompTask> {
        let update = TaskUpdate {
            job_id: Some(job_id.to_string()),
            ..TaskUpdate::default()
        };
        self.update_task(project_id, node_id, run_id, update).await
    }

    async fn update_task_progress(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        run_id: RunId,
        progress: f64,
    ) -> Result<CompTask> {
        let update = TaskUpdate {
            progress: Some(progress.clamp(0.0, 1.0)),
            ..TaskUpdate::default()
        };
        self.update_task(project_id, node_id, run_id, update).await
    }

    async fn update_task_last_heartbeat(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        run_id: RunId,
        heartbeat: DateTime<Utc>,
    ) -> Result<CompTask> {
        let update = TaskUpdate {
            last_heartbeat: Some(heartbeat),
            ..TaskUpdate::default()
        };
        self.update_task(project_id, node_id, run_id, update).await
    }

    /// Outputs of the given nodes. Every node must exist in the project.
    async fn get_outputs_from_tasks(
        &self,
        project_id: ProjectId,
        node_ids: &[NodeId],
    ) -> Result<BTreeMap<NodeId, Map<String, Value>>> {
        let outputs: BTreeMap<NodeId, Map<String, Value>> = self
            .list_tasks(project_id)
            .await?
            .into_iter()
            .filter(|t| node_ids.contains(&t.node_id))
            .map(|t| (t.node_id, t.outputs))
            .collect();

        let missing: Vec<NodeId> = node_ids
            .iter()
            .filter(|id| !outputs.contains_key(id))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(SchedulerError::OutputsIncomplete {
                project_id,
                missing,
            });
        }

        Ok(outputs)
    }
}
