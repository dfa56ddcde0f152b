// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Computational pipeline scheduler.
//!
//! Connects the task store of `simcore-comp-core` to compute clusters:
//!
//! ```text
//! ┌──────────────────────┐   upsert    ┌──────────────────────┐
//! │  TaskGraphAssembler  │────────────▶│      TaskStore       │
//! │ (catalog, pricing,   │             │ (comp_tasks + run    │
//! │  hardware, image)    │             │  snapshots)          │
//! └──────────────────────┘             └──────────────────────┘
//!                                                 ▲
//!                                                 │ state / progress
//! ┌──────────────────────┐   events    ┌──────────┴───────────┐
//! │  ClusterClientPool   │────────────▶│  TaskEventRecorder   │
//! │  one ComputeClient   │             └──────────────────────┘
//! │  per cluster         │
//! └──────────┬───────────┘
//!            │ HTTP
//!            ▼
//!     cluster gateways
//! ```
//!
//! # Modules
//!
//! - [`compute`]: the [`ComputeClient`] trait, the HTTP gateway client and an
//!   in-memory backend for tests.
//! - [`pool`]: [`ClusterClientPool`], one shared client per cluster with
//!   eviction on connectivity failures.
//! - [`assembler`]: [`TaskGraphAssembler`] and the collaborator interfaces it
//!   needs.
//! - [`recorder`]: [`TaskEventRecorder`], applies backend push events.
//! - [`config`] and [`db`]: environment configuration and store setup.

pub mod assembler;
pub mod compute;
pub mod config;
pub mod db;
pub mod pool;
pub mod recorder;

pub use assembler::{Collaborators, ProjectTasksRequest, TaskGraphAssembler, WorkbenchNode};
pub use compute::{
    Cluster, ClusterAuthentication, ComputeClient, ComputeClientFactory, FileLinkType,
    GatewayClientFactory, TaskDefinition,
};
pub use config::{Config, ConfigError};
pub use db::connect_task_store;
pub use pool::{ClusterClientPool, PoolSettings};
pub use recorder::TaskEventRecorder;
