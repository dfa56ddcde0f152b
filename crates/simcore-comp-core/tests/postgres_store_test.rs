// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL task store tests. Run with TEST_COMP_SCHEDULER_DATABASE_URL set.

use chrono::Utc;
use serde_json::{Map, json};
use simcore_comp_core::models::{HardwareInfo, Image, NodeSchema};
use simcore_comp_core::{
    NewCompTask, NodeClass, NodeId, PostgresTaskStore, ProjectId, RunningState, SchedulerError,
    TaskStore, TaskUpdate, migrations,
};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_COMP_SCHEDULER_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_COMP_SCHEDULER_DATABASE_URL not set");
            return;
        }
    };
}

async fn test_store() -> Option<PostgresTaskStore> {
    let database_url = std::env::var("TEST_COMP_SCHEDULER_DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .ok()?;
    migrations::run_postgres(&pool).await.ok()?;
    Some(PostgresTaskStore::new(pool))
}

fn new_task(
    project_id: ProjectId,
    node_id: NodeId,
    internal_id: i32,
    node_class: NodeClass,
    state: RunningState,
) -> NewCompTask {
    NewCompTask {
        project_id,
        node_id,
        internal_id,
        schema: NodeSchema::default(),
        inputs: Map::new(),
        outputs: Map::new(),
        image: Image::new("simcore/services/comp/itis/sleeper", "2.1.6"),
        state,
        progress: None,
        node_class,
        submit: Utc::now(),
        pricing_info: None,
        hardware_info: HardwareInfo::default(),
    }
}

fn pipeline(project_id: ProjectId, nodes: &[NodeId], published: &[NodeId]) -> Vec<NewCompTask> {
    nodes
        .iter()
        .enumerate()
        .map(|(i, n)| {
            let state = if published.contains(n) {
                RunningState::Published
            } else {
                RunningState::NotStarted
            };
            new_task(project_id, *n, i as i32 + 1, NodeClass::Computational, state)
        })
        .collect()
}

#[tokio::test]
async fn test_publish_and_republish() {
    skip_if_no_db!();
    let Some(store) = test_store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };

    let project_id = Uuid::new_v4();
    let nodes: Vec<NodeId> = (0..3).map(|_| Uuid::new_v4()).collect();

    let stored = store
        .upsert_tasks_from_project(project_id, &nodes, &pipeline(project_id, &nodes, &[]), &[])
        .await
        .expect("Failed to publish pipeline");
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|t| t.state == RunningState::NotStarted));

    let run = store
        .create_run(project_id, 1, &Uuid::new_v4().to_string(), json!({}), false)
        .await
        .unwrap();
    store
        .update_task(
            project_id,
            nodes[0],
            run.run_id,
            TaskUpdate {
                state: Some(RunningState::Started),
                progress: Some(0.4),
                ..TaskUpdate::default()
            },
        )
        .await
        .unwrap();

    store
        .upsert_tasks_from_project(project_id, &nodes, &pipeline(project_id, &nodes, &[]), &[])
        .await
        .unwrap();
    let task = store.get_task(project_id, nodes[0]).await.unwrap();
    assert_eq!(task.state, RunningState::Started);
    assert_eq!(task.progress, Some(0.4));

    let published = [nodes[0]];
    store
        .upsert_tasks_from_project(
            project_id,
            &nodes,
            &pipeline(project_id, &nodes, &published),
            &published,
        )
        .await
        .unwrap();
    let task = store.get_task(project_id, nodes[0]).await.unwrap();
    assert_eq!(task.state, RunningState::Published);
    assert_eq!(task.progress, None);

    store.delete_tasks_from_project(project_id).await.unwrap();
    assert_eq!(store.delete_tasks_from_project(project_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_abort_updates_live_and_snapshot_rows() {
    skip_if_no_db!();
    let Some(store) = test_store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };

    let project_id = Uuid::new_v4();
    let nodes: Vec<NodeId> = (0..2).map(|_| Uuid::new_v4()).collect();
    store
        .upsert_tasks_from_project(
            project_id,
            &nodes,
            &pipeline(project_id, &nodes, &nodes),
            &nodes,
        )
        .await
        .unwrap();

    let run = store
        .create_run(project_id, 1, &Uuid::new_v4().to_string(), json!({}), true)
        .await
        .unwrap();
    store
        .create_snapshot_tasks(project_id, run.run_id)
        .await
        .unwrap();
    store
        .update_task(
            project_id,
            nodes[1],
            run.run_id,
            TaskUpdate::state(RunningState::Started),
        )
        .await
        .unwrap();

    let aborted = store
        .mark_project_published_waiting_for_cluster_tasks_as_aborted(project_id, run.run_id)
        .await
        .unwrap();
    assert_eq!(aborted, 1);
    assert_eq!(
        store
            .mark_project_published_waiting_for_cluster_tasks_as_aborted(project_id, run.run_id)
            .await
            .unwrap(),
        0
    );

    let snapshots = store.list_run_snapshot_tasks(run.run_id).await.unwrap();
    assert_eq!(snapshots[0].task.state, RunningState::Aborted);
    assert_eq!(snapshots[0].task.progress, Some(1.0));
    assert_eq!(snapshots[1].task.state, RunningState::Started);

    let err = store
        .get_outputs_from_tasks(project_id, &[nodes[0], Uuid::new_v4()])
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::OutputsIncomplete { .. }));

    store.delete_tasks_from_project(project_id).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_runs_get_distinct_iterations() {
    skip_if_no_db!();
    let Some(store) = test_store().await else {
        eprintln!("Skipping test: failed to connect to database");
        return;
    };
    let project_id = Uuid::new_v4();

    let runs = futures::future::join_all((0..3).map(|i| {
        let store = store.clone();
        async move {
            store
                .create_run(project_id, 1, &format!("collection-{i}"), json!({}), false)
                .await
        }
    }))
    .await;

    let mut iterations: Vec<i64> = runs.into_iter().map(|r| r.unwrap().iteration).collect();
    iterations.sort_unstable();
    assert_eq!(iterations, vec![1, 2, 3]);
}
