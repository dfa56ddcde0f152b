// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Computational task core of the pipeline scheduler.
//!
//! This crate holds what the scheduler needs to reason about and persist
//! computational tasks, independently of how they are executed:
//!
//! - [`error`]: the error taxonomy shared by every scheduler component.
//! - [`models`]: task, run and image models plus the task state machine.
//! - [`persistence`]: the [`TaskStore`] trait with PostgreSQL and SQLite
//!   backends over the live `comp_tasks` table and the per-run
//!   `comp_run_snapshot_tasks` table.
//! - [`migrations`]: embedded schema migrations for both backends.
//!
//! # Task lifecycle
//!
//! ```text
//!   NOT_STARTED ──publish──▶ PUBLISHED ──▶ WAITING_FOR_RESOURCES / WAITING_FOR_CLUSTER
//!                                │                         │
//!                                │ abort                   ▼
//!                                ▼                      PENDING ──▶ STARTED
//!                             ABORTED ◀──────────────────────────────┤
//!                                                       SUCCESS ◀────┤
//!                                                        FAILED ◀────┘
//! ```
//!
//! `UNKNOWN` is never written: the persistence layer stores it as `FAILED`.
//!
//! # Example
//!
//! ```ignore
//! use simcore_comp_core::persistence::{SqliteTaskStore, TaskStore};
//!
//! let store = SqliteTaskStore::from_path(".data/tasks.db").await?;
//! let tasks = store.list_computational_tasks(project_id).await?;
//! ```

#![deny(missing_docs)]

pub mod error;
pub mod migrations;
pub mod models;
pub mod persistence;

pub use error::{ErrorKind, Result, SchedulerError};
pub use models::{
    COMPLETED_STATES, ClusterId, CompRun, CompRunSnapshotTask, CompTask, DEFAULT_CLUSTER_ID,
    NewCompTask, NodeClass, NodeId, ProjectId, RunId, RunningState, TaskUpdate, UserId,
};
pub use persistence::{PostgresTaskStore, SqliteTaskStore, TaskStore, TaskUpdateReport};
