// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compute clients - sessions with the clusters that execute tasks.

pub mod events;
pub mod gateway;
pub mod mock;
mod traits;
pub mod utils;

pub use events::{
    EVENT_QUEUE_CAPACITY, forward_event, spawn_event_consumer, spawn_event_consumer_with_capacity,
};
pub use gateway::{GatewayClient, GatewayClientFactory, GatewaySettings};
pub use mock::{MockBackend, MockClientFactory, MockComputeClient};
pub use traits::*;
pub use utils::{
    JobIdParts, backend_state_to_running_state, check_before_submit, check_cluster_able_to_run,
    generate_job_id, node_requirements_to_resources, parse_job_id,
};
