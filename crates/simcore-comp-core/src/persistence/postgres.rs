// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed task store.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};
use crate::models::{
    CompRun, CompRunSnapshotTask, CompTask, NewCompTask, NodeClass, NodeId, ProjectId, RunId,
    RunningState, TaskUpdate, UserId,
};

use super::{
    DEFAULT_UPDATE_CONCURRENCY, Placeholder, RunRow, SnapshotTaskRow, TASK_COLUMNS, TaskRow,
    TaskStore, columns_to_exclude, rows_into, upsert_task_sql,
};

const CREATE_RUN_ATTEMPTS: u32 = 3;

const RUN_COLUMNS: &str = "run_id, project_uuid, user_id, iteration, collection_run_id, result, \
    metadata, use_on_demand_clusters, created, modified, started, ended";

/// PostgreSQL-backed task store.
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
    update_concurrency: usize,
}

impl PostgresTaskStore {
    /// Create a new store from an existing, migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            update_concurrency: DEFAULT_UPDATE_CONCURRENCY,
        }
    }

    /// Bound the number of concurrent writes of bulk updates.
    pub fn with_update_concurrency(mut self, concurrency: usize) -> Self {
        self.update_concurrency = concurrency.max(1);
        self
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn push_task_update(qb: &mut QueryBuilder<'_, Postgres>, update: &TaskUpdate) {
    if let Some(state) = update.state {
        qb.push(", state = ").push_bind(state.as_db_str());
    }
    if let Some(progress) = update.progress {
        qb.push(", progress = ").push_bind(progress);
    }
    if let Some(errors) = &update.errors {
        qb.push(", errors = ").push_bind(errors.clone().map(Json));
    }
    if let Some(start) = update.start {
        qb.push(", start = ").push_bind(start);
    }
    if let Some(end) = update.end {
        qb.push(", \"end\" = ").push_bind(end);
    }
    if let Some(heartbeat) = update.last_heartbeat {
        qb.push(", last_heartbeat = ").push_bind(heartbeat);
    }
    if let Some(job_id) = &update.job_id {
        qb.push(", job_id = ").push_bind(job_id.clone());
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn get_task(&self, project_id: ProjectId, node_id: NodeId) -> Result<CompTask> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT task_id, {TASK_COLUMNS} FROM comp_tasks WHERE project_id = $1 AND node_id = $2"
        ))
        .bind(project_id.to_string())
        .bind(node_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(SchedulerError::TaskNotFound {
            project_id,
            node_id,
        })?
        .try_into()
    }

    async fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<CompTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT task_id, {TASK_COLUMNS} FROM comp_tasks WHERE project_id = $1 ORDER BY internal_id"
        ))
        .bind(project_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows_into(rows)
    }

    async fn upsert_tasks_from_project(
        &self,
        project_id: ProjectId,
        workbench_node_ids: &[NodeId],
        tasks: &[NewCompTask],
        published_nodes: &[NodeId],
    ) -> Result<Vec<CompTask>> {
        let mut tx = self.pool.begin().await?;

        let workbench: Vec<String> = workbench_node_ids.iter().map(|n| n.to_string()).collect();
        let removed = sqlx::query(
            "DELETE FROM comp_tasks WHERE project_id = $1 AND NOT (node_id = ANY($2))",
        )
        .bind(project_id.to_string())
        .bind(&workbench)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed > 0 {
            debug!(%project_id, removed, "Removed tasks of nodes no longer in workbench");
        }

        let now = Utc::now();
        let mut stored = Vec::with_capacity(tasks.len());
        for task in tasks {
            let excluded = columns_to_exclude(task.node_id, task.node_class, published_nodes);
            let sql = upsert_task_sql(Placeholder::Dollar, &excluded);
            let row = sqlx::query_as::<_, TaskRow>(&sql)
                .bind(project_id.to_string())
                .bind(task.node_id.to_string())
                .bind(task.internal_id)
                .bind(Json(task.schema.clone()))
                .bind(Json(task.inputs.clone()))
                .bind(Json(task.outputs.clone()))
                .bind(Json(task.image.clone()))
                .bind(task.state.as_db_str())
                .bind(task.progress)
                .bind(task.node_class.as_db_str())
                .bind(task.submit)
                .bind(now)
                .bind(now)
                .bind(task.pricing_info.clone().map(Json))
                .bind(Json(task.hardware_info.clone()))
                .fetch_one(&mut *tx)
                .await?;
            stored.push(CompTask::try_from(row)?);
        }

        tx.commit().await?;
        info!(%project_id, tasks = stored.len(), "Upserted project tasks");
        Ok(stored)
    }

    async fn update_task(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        run_id: RunId,
        update: TaskUpdate,
    ) -> Result<CompTask> {
        let mut tx = self.pool.begin().await?;

        let node_class: Option<String> = sqlx::query_scalar(
            "SELECT node_class FROM comp_tasks WHERE project_id = $1 AND node_id = $2 FOR UPDATE",
        )
        .bind(project_id.to_string())
        .bind(node_id.to_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(node_class) = node_class else {
            return Err(SchedulerError::TaskNotFound {
                project_id,
                node_id,
            });
        };
        if update.job_id.is_some() && node_class == NodeClass::Frontend.as_db_str() {
            return Err(SchedulerError::FrontendTaskJobRejected {
                project_id,
                node_id,
            });
        }

        let now = Utc::now();
        for (table, scoped_to_run) in [("comp_tasks", false), ("comp_run_snapshot_tasks", true)] {
            let mut qb = QueryBuilder::<Postgres>::new(format!("UPDATE {table} SET modified = "));
            qb.push_bind(now);
            push_task_update(&mut qb, &update);
            qb.push(" WHERE project_id = ")
                .push_bind(project_id.to_string())
                .push(" AND node_id = ")
                .push_bind(node_id.to_string());
            if scoped_to_run {
                qb.push(" AND run_id = ").push_bind(run_id);
            }
            qb.build().execute(&mut *tx).await?;
        }

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT task_id, {TASK_COLUMNS} FROM comp_tasks WHERE project_id = $1 AND node_id = $2"
        ))
        .bind(project_id.to_string())
        .bind(node_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        row.try_into()
    }

    async fn mark_project_published_waiting_for_cluster_tasks_as_aborted(
        &self,
        project_id: ProjectId,
        run_id: RunId,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let live = sqlx::query(
            r#"
            UPDATE comp_tasks
            SET state = 'ABORTED', progress = 1.0, "end" = $1, modified = $1
            WHERE project_id = $2
              AND node_class = 'COMPUTATIONAL'
              AND state IN ('PUBLISHED', 'WAITING_FOR_CLUSTER')
            "#,
        )
        .bind(now)
        .bind(project_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            r#"
            UPDATE comp_run_snapshot_tasks
            SET state = 'ABORTED', progress = 1.0, "end" = $1, modified = $1
            WHERE project_id = $2
              AND run_id = $3
              AND node_class = 'COMPUTATIONAL'
              AND state IN ('PUBLISHED', 'WAITING_FOR_CLUSTER')
            "#,
        )
        .bind(now)
        .bind(project_id.to_string())
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        if live > 0 {
            info!(%project_id, run_id, aborted = live, "Aborted tasks waiting for a cluster");
        }
        Ok(live)
    }

    async fn delete_tasks_from_project(&self, project_id: ProjectId) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM comp_tasks WHERE project_id = $1")
            .bind(project_id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn create_run(
        &self,
        project_id: ProjectId,
        user_id: UserId,
        collection_run_id: &str,
        metadata: Value,
        use_on_demand_clusters: bool,
    ) -> Result<CompRun> {
        let mut attempt = 1;
        loop {
            let now = Utc::now();
            let inserted = sqlx::query_as::<_, RunRow>(&format!(
                r#"
                INSERT INTO comp_runs (project_uuid, user_id, iteration, collection_run_id, result,
                                       metadata, use_on_demand_clusters, created, modified)
                VALUES ($1, $2,
                        (SELECT COALESCE(MAX(iteration), 0) + 1 FROM comp_runs
                         WHERE project_uuid = $1 AND user_id = $2),
                        $3, $4, $5, $6, $7, $7)
                RETURNING {RUN_COLUMNS}
                "#
            ))
            .bind(project_id.to_string())
            .bind(user_id)
            .bind(collection_run_id)
            .bind(RunningState::Published.as_db_str())
            .bind(Json(metadata.clone()))
            .bind(use_on_demand_clusters)
            .bind(now)
            .fetch_one(&self.pool)
            .await;

            match inserted {
                Ok(row) => return row.try_into(),
                // A concurrent run took the same iteration.
                Err(sqlx::Error::Database(e))
                    if e.is_unique_violation() && attempt < CREATE_RUN_ATTEMPTS =>
                {
                    debug!(%project_id, user_id, attempt, "Run iteration taken, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn get_run(&self, run_id: RunId) -> Result<CompRun> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM comp_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(SchedulerError::RunNotFound { run_id })?.try_into()
    }

    async fn get_latest_run(
        &self,
        project_id: ProjectId,
        user_id: UserId,
    ) -> Result<Option<CompRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {RUN_COLUMNS} FROM comp_runs WHERE project_uuid = $1 AND user_id = $2 \
             ORDER BY iteration DESC LIMIT 1"
        ))
        .bind(project_id.to_string())
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CompRun::try_from).transpose()
    }

    async fn create_snapshot_tasks(
        &self,
        project_id: ProjectId,
        run_id: RunId,
    ) -> Result<Vec<CompRunSnapshotTask>> {
        self.get_run(run_id).await?;

        let copied = sqlx::query(&format!(
            "INSERT INTO comp_run_snapshot_tasks (run_id, {TASK_COLUMNS}) \
             SELECT $1, {TASK_COLUMNS} FROM comp_tasks WHERE project_id = $2 \
             ON CONFLICT (run_id, node_id) DO NOTHING"
        ))
        .bind(run_id)
        .bind(project_id.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();
        debug!(%project_id, run_id, copied, "Created run snapshot tasks");

        self.list_run_snapshot_tasks(run_id).await
    }

    async fn list_run_snapshot_tasks(&self, run_id: RunId) -> Result<Vec<CompRunSnapshotTask>> {
        let rows = sqlx::query_as::<_, SnapshotTaskRow>(&format!(
            "SELECT snapshot_task_id, run_id, snapshot_task_id AS task_id, {TASK_COLUMNS} \
             FROM comp_run_snapshot_tasks WHERE run_id = $1 ORDER BY internal_id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows_into(rows)
    }

    async fn list_collection_run_tasks(
        &self,
        collection_run_id: &str,
    ) -> Result<Vec<CompRunSnapshotTask>> {
        let rows = sqlx::query_as::<_, SnapshotTaskRow>(&format!(
            "SELECT snapshot_task_id, run_id, snapshot_task_id AS task_id, {TASK_COLUMNS} \
             FROM comp_run_snapshot_tasks \
             WHERE run_id IN (SELECT run_id FROM comp_runs WHERE collection_run_id = $1) \
             ORDER BY run_id, internal_id"
        ))
        .bind(collection_run_id)
        .fetch_all(&self.pool)
        .await?;

        rows_into(rows)
    }

    fn update_concurrency(&self) -> usize {
        self.update_concurrency
    }
}
