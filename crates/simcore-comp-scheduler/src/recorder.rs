// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Applies backend push events to the task store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use simcore_comp_core::models::ErrorDict;
use simcore_comp_core::{CompRun, CompTask, Result, RunningState, TaskStore, TaskUpdate};
use tracing::{debug, info, warn};

use crate::compute::{
    JobIdParts, TaskEventHandler, TaskLogEvent, TaskProgressEvent, TaskStateEvent, parse_job_id,
};

/// Writes task state and progress reported by compute clients.
///
/// Events are resolved to the latest run of the task's project and user, so
/// both the live row and the run snapshot are updated. States never move
/// backwards: events arriving after the task reached a final state, or
/// older than its current state, are dropped. `UNKNOWN` finishes the task as
/// `FAILED`.
pub struct TaskEventRecorder {
    store: Arc<dyn TaskStore>,
}

impl TaskEventRecorder {
    /// Create a recorder writing to `store`.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    async fn locate(&self, job_id: &str) -> Result<Option<(JobIdParts, CompRun, CompTask)>> {
        let parts = parse_job_id(job_id)?;
        let Some(run) = self
            .store
            .get_latest_run(parts.project_id, parts.user_id)
            .await?
        else {
            warn!(job_id, project_id = %parts.project_id, "No run for task event");
            return Ok(None);
        };
        let task = self.store.get_task(parts.project_id, parts.node_id).await?;
        if task.state.is_terminal() {
            debug!(job_id, state = %task.state, "Task already completed, event ignored");
            return Ok(None);
        }
        Ok(Some((parts, run, task)))
    }
}

#[async_trait]
impl TaskEventHandler for TaskEventRecorder {
    async fn on_task_state(&self, event: TaskStateEvent) -> Result<()> {
        let Some((parts, run, task)) = self.locate(&event.job_id).await? else {
            return Ok(());
        };

        // A task the backend lost track of is finished as a failure.
        let lost = event.state == RunningState::Unknown;
        let state = if lost {
            RunningState::Failed
        } else {
            event.state
        };
        if !task.state.can_transition_to(state) {
            debug!(
                job_id = %event.job_id,
                from = %task.state,
                to = %state,
                "Out of order task state ignored"
            );
            return Ok(());
        }

        let now = Utc::now();
        let mut update = TaskUpdate::state(state);
        match state {
            RunningState::Started if task.start.is_none() => update.start = Some(now),
            state if state.is_terminal() => {
                update.end = Some(now);
                update.progress = Some(1.0);
                if state == RunningState::Failed {
                    let default_msg = if lost {
                        "task state unknown on backend"
                    } else {
                        "task failed"
                    };
                    update.errors = Some(Some(vec![ErrorDict {
                        loc: vec![parts.project_id.to_string(), parts.node_id.to_string()],
                        msg: event
                            .msg
                            .clone()
                            .unwrap_or_else(|| default_msg.to_string()),
                        error_type: "runtime".to_string(),
                        ctx: None,
                    }]));
                }
            }
            _ => {}
        }

        self.store
            .update_task(parts.project_id, parts.node_id, run.run_id, update)
            .await?;
        info!(
            job_id = %event.job_id,
            run_id = run.run_id,
            from = %task.state,
            to = %state,
            "Task state recorded"
        );
        Ok(())
    }

    async fn on_task_progress(&self, event: TaskProgressEvent) -> Result<()> {
        let Some((parts, run, task)) = self.locate(&event.job_id).await? else {
            return Ok(());
        };

        let now = Utc::now();
        let mut update = TaskUpdate {
            progress: Some(event.progress.clamp(0.0, 1.0)),
            last_heartbeat: Some(now),
            ..TaskUpdate::default()
        };
        if task.state != RunningState::Started {
            update.state = Some(RunningState::Started);
            if task.start.is_none() {
                update.start = Some(now);
            }
        }

        self.store
            .update_task(parts.project_id, parts.node_id, run.run_id, update)
            .await?;
        debug!(job_id = %event.job_id, progress = event.progress, "Task progress recorded");
        Ok(())
    }

    async fn on_task_log(&self, event: TaskLogEvent) -> Result<()> {
        match event.log_level {
            level if level >= 40 => warn!(job_id = %event.job_id, "{}", event.log),
            level if level >= 20 => info!(job_id = %event.job_id, "{}", event.log),
            _ => debug!(job_id = %event.job_id, "{}", event.log),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::generate_job_id;
    use serde_json::{Map, json};
    use simcore_comp_core::models::{HardwareInfo, Image, NodeSchema};
    use simcore_comp_core::{NewCompTask, NodeClass, NodeId, ProjectId, SqliteTaskStore, migrations};
    use sqlx::sqlite::SqlitePoolOptions;
    use uuid::Uuid;

    const KEY: &str = "simcore/services/comp/itis/sleeper";

    struct Fixture {
        store: Arc<SqliteTaskStore>,
        recorder: TaskEventRecorder,
        project_id: ProjectId,
        node_id: NodeId,
        job_id: String,
    }

    async fn fixture() -> Fixture {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run_sqlite(&pool).await.unwrap();
        let store = Arc::new(SqliteTaskStore::new(pool));

        let project_id = Uuid::new_v4();
        let node_id = Uuid::new_v4();
        let task = NewCompTask {
            project_id,
            node_id,
            internal_id: 1,
            schema: NodeSchema::default(),
            inputs: Map::new(),
            outputs: Map::new(),
            image: Image::new(KEY, "1.0.0"),
            state: RunningState::Published,
            progress: None,
            node_class: NodeClass::Computational,
            submit: Utc::now(),
            pricing_info: None,
            hardware_info: HardwareInfo::default(),
        };
        store
            .upsert_tasks_from_project(project_id, &[node_id], &[task], &[node_id])
            .await
            .unwrap();
        let run = store
            .create_run(project_id, 7, "collection-1", json!({}), false)
            .await
            .unwrap();
        store.create_snapshot_tasks(project_id, run.run_id).await.unwrap();

        Fixture {
            recorder: TaskEventRecorder::new(store.clone()),
            job_id: generate_job_id(KEY, "1.0.0", 7, project_id, node_id),
            store,
            project_id,
            node_id,
        }
    }

    fn state_event(job_id: &str, state: RunningState, msg: Option<&str>) -> TaskStateEvent {
        TaskStateEvent {
            job_id: job_id.to_string(),
            state,
            msg: msg.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_started_then_success() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Started, None))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Started);
        assert!(task.start.is_some());
        assert!(task.end.is_none());

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Success, None))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Success);
        assert_eq!(task.progress, Some(1.0));
        assert!(task.end.is_some());

        // The run snapshot follows the live row.
        let run = f.store.get_latest_run(f.project_id, 7).await.unwrap().unwrap();
        let snapshots = f.store.list_run_snapshot_tasks(run.run_id).await.unwrap();
        assert_eq!(snapshots[0].task.state, RunningState::Success);
    }

    #[tokio::test]
    async fn test_failure_records_error() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Failed, Some("segfault")))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Failed);
        let errors = task.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg, "segfault");
        assert_eq!(errors[0].error_type, "runtime");
        assert_eq!(errors[0].loc[1], f.node_id.to_string());
    }

    #[tokio::test]
    async fn test_events_after_completion_are_ignored() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Aborted, None))
            .await
            .unwrap();
        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Started, None))
            .await
            .unwrap();
        f.recorder
            .on_task_progress(TaskProgressEvent {
                job_id: f.job_id.clone(),
                progress: 0.3,
            })
            .await
            .unwrap();

        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Aborted);
        assert_eq!(task.progress, Some(1.0));
    }

    #[tokio::test]
    async fn test_out_of_order_state_is_ignored() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Started, None))
            .await
            .unwrap();
        let started = f.store.get_task(f.project_id, f.node_id).await.unwrap();

        // A late PENDING from the backend must not move the task backwards.
        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Pending, None))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Started);
        assert_eq!(task.start, started.start);

        let run = f.store.get_latest_run(f.project_id, 7).await.unwrap().unwrap();
        let snapshots = f.store.list_run_snapshot_tasks(run.run_id).await.unwrap();
        assert_eq!(snapshots[0].task.state, RunningState::Started);

        // Moving forward still works afterwards.
        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Success, None))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Success);
    }

    #[tokio::test]
    async fn test_unknown_state_is_recorded_as_failure() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Started, None))
            .await
            .unwrap();
        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Unknown, None))
            .await
            .unwrap();

        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Failed);
        assert_eq!(task.progress, Some(1.0));
        assert!(task.end.is_some());
        let errors = task.errors.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].msg, "task state unknown on backend");

        let run = f.store.get_latest_run(f.project_id, 7).await.unwrap().unwrap();
        let snapshots = f.store.list_run_snapshot_tasks(run.run_id).await.unwrap();
        assert_eq!(snapshots[0].task.state, RunningState::Failed);
        assert!(snapshots[0].task.end.is_some());
    }

    #[tokio::test]
    async fn test_unknown_state_keeps_backend_message() {
        let f = fixture().await;

        f.recorder
            .on_task_state(state_event(&f.job_id, RunningState::Unknown, Some("worker lost")))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Failed);
        assert_eq!(task.errors.unwrap()[0].msg, "worker lost");
    }

    #[tokio::test]
    async fn test_progress_promotes_to_started() {
        let f = fixture().await;

        f.recorder
            .on_task_progress(TaskProgressEvent {
                job_id: f.job_id.clone(),
                progress: 1.7,
            })
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Started);
        assert_eq!(task.progress, Some(1.0));
        assert!(task.start.is_some());
        assert!(task.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_event_without_run_is_dropped() {
        let f = fixture().await;
        let other_user_job = generate_job_id(KEY, "1.0.0", 99, f.project_id, f.node_id);

        f.recorder
            .on_task_state(state_event(&other_user_job, RunningState::Started, None))
            .await
            .unwrap();
        let task = f.store.get_task(f.project_id, f.node_id).await.unwrap();
        assert_eq!(task.state, RunningState::Published);
    }

    #[tokio::test]
    async fn test_malformed_job_id_is_an_error() {
        let f = fixture().await;
        let err = f
            .recorder
            .on_task_state(state_event("not-a-job", RunningState::Started, None))
            .await
            .unwrap_err();
        assert!(matches!(err, simcore_comp_core::SchedulerError::Configuration { .. }));
    }
}
