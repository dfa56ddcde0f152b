// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helpers shared by compute client implementations.

use std::collections::BTreeMap;

use simcore_comp_core::models::NodeRequirements;
use simcore_comp_core::{ClusterId, NodeId, ProjectId, Result, RunningState, SchedulerError, UserId};
use uuid::Uuid;

use super::traits::{SchedulerInfo, SchedulerStatus};

/// Parts encoded in a job id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdParts {
    /// Service key.
    pub service_key: String,
    /// Service version.
    pub service_version: String,
    /// Owner of the run.
    pub user_id: UserId,
    /// Project of the task.
    pub project_id: ProjectId,
    /// Node of the task.
    pub node_id: NodeId,
}

/// Build a unique job id for a task submission.
pub fn generate_job_id(
    service_key: &str,
    service_version: &str,
    user_id: UserId,
    project_id: ProjectId,
    node_id: NodeId,
) -> String {
    format!(
        "{}:{}:userid_{}:projectid_{}:nodeid_{}:uuid_{}",
        service_key,
        service_version,
        user_id,
        project_id,
        node_id,
        Uuid::new_v4()
    )
}

/// Decode a job id produced by [`generate_job_id`].
pub fn parse_job_id(job_id: &str) -> Result<JobIdParts> {
    let invalid = || SchedulerError::Configuration {
        msg: format!("invalid job id '{}'", job_id),
    };

    // Service keys contain no ':', versions are semver.
    let parts: Vec<&str> = job_id.split(':').collect();
    let [key, version, user, project, node, unique] = parts.as_slice() else {
        return Err(invalid());
    };

    let user_id = user
        .strip_prefix("userid_")
        .and_then(|v| v.parse::<UserId>().ok())
        .ok_or_else(invalid)?;
    let project_id = project
        .strip_prefix("projectid_")
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(invalid)?;
    let node_id = node
        .strip_prefix("nodeid_")
        .and_then(|v| Uuid::parse_str(v).ok())
        .ok_or_else(invalid)?;
    if !unique.starts_with("uuid_") {
        return Err(invalid());
    }

    Ok(JobIdParts {
        service_key: key.to_string(),
        service_version: version.to_string(),
        user_id,
        project_id,
        node_id,
    })
}

/// Map a backend task state to a [`RunningState`].
pub fn backend_state_to_running_state(state: &str) -> RunningState {
    match state {
        "new" | "released" | "waiting" | "pending" => RunningState::Pending,
        "no-worker" => RunningState::WaitingForResources,
        "processing" => RunningState::Started,
        "memory" | "success" => RunningState::Success,
        "erred" => RunningState::Failed,
        "cancelled" | "aborted" => RunningState::Aborted,
        _ => RunningState::Unknown,
    }
}

/// Resources the backend must reserve for a task.
pub fn node_requirements_to_resources(requirements: &NodeRequirements) -> BTreeMap<String, f64> {
    let mut resources = BTreeMap::from([
        ("CPU".to_string(), requirements.cpu),
        ("RAM".to_string(), requirements.ram as f64),
    ]);
    if let Some(gpu) = requirements.gpu {
        resources.insert("GPU".to_string(), gpu);
    }
    if let Some(vram) = requirements.vram {
        resources.insert("VRAM".to_string(), vram as f64);
    }
    resources
}

/// Check that at least one worker of the cluster can run a task.
pub fn check_cluster_able_to_run(
    info: &SchedulerInfo,
    cluster_id: ClusterId,
    node_id: NodeId,
    task_resources: &BTreeMap<String, f64>,
) -> Result<()> {
    let fits = |worker: &BTreeMap<String, f64>| {
        task_resources
            .iter()
            .all(|(name, needed)| worker.get(name).is_some_and(|available| available >= needed))
    };
    if info.workers.values().any(|w| fits(&w.resources)) {
        return Ok(());
    }

    let mut cluster_resources: BTreeMap<String, f64> = BTreeMap::new();
    for worker in info.workers.values() {
        for (name, amount) in &worker.resources {
            *cluster_resources.entry(name.clone()).or_default() += amount;
        }
    }

    if task_resources
        .keys()
        .any(|name| !cluster_resources.contains_key(name))
    {
        return Err(SchedulerError::MissingComputationalResources {
            node_id,
            cluster_id,
            task_resources: task_resources.clone(),
        });
    }

    Err(SchedulerError::InsufficientComputationalResources {
        node_id,
        cluster_id,
        task_resources: task_resources.clone(),
        cluster_resources,
    })
}

/// Checks run before every submission.
///
/// `check_resources` is false for gateway clusters, which scale their
/// workers on demand.
pub fn check_before_submit(
    original_scheduler_id: &str,
    info: &SchedulerInfo,
    cluster_id: ClusterId,
    node_id: NodeId,
    task_resources: &BTreeMap<String, f64>,
    check_resources: bool,
) -> Result<()> {
    if info.scheduler_id != original_scheduler_id {
        return Err(SchedulerError::ComputationalSchedulerChanged {
            original_scheduler_id: original_scheduler_id.to_string(),
            current_scheduler_id: info.scheduler_id.clone(),
        });
    }
    if info.status != SchedulerStatus::Running {
        return Err(SchedulerError::ComputationalBackendNotConnected {
            msg: format!("scheduler of cluster {} is {:?}", cluster_id, info.status),
        });
    }
    if check_resources {
        check_cluster_able_to_run(info, cluster_id, node_id, task_resources)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::WorkerInfo;

    fn info(workers: &[&[(&str, f64)]]) -> SchedulerInfo {
        SchedulerInfo {
            scheduler_id: "sched-1".to_string(),
            status: SchedulerStatus::Running,
            workers: workers
                .iter()
                .enumerate()
                .map(|(i, resources)| {
                    let address = format!("tcp://10.0.0.{}:8786", i + 1);
                    (
                        address.clone(),
                        WorkerInfo {
                            id: address,
                            resources: resources
                                .iter()
                                .map(|(k, v)| (k.to_string(), *v))
                                .collect(),
                        },
                    )
                })
                .collect(),
        }
    }

    fn resources(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_job_id_roundtrip() {
        let project = Uuid::new_v4();
        let node = Uuid::new_v4();
        let job_id = generate_job_id("simcore/services/comp/itis/sleeper", "2.1.4", 42, project, node);

        let parts = parse_job_id(&job_id).unwrap();
        assert_eq!(parts.service_key, "simcore/services/comp/itis/sleeper");
        assert_eq!(parts.service_version, "2.1.4");
        assert_eq!(parts.user_id, 42);
        assert_eq!(parts.project_id, project);
        assert_eq!(parts.node_id, node);
    }

    #[test]
    fn test_job_ids_are_unique() {
        let project = Uuid::new_v4();
        let node = Uuid::new_v4();
        let a = generate_job_id("simcore/services/comp/x", "1.0.0", 1, project, node);
        let b = generate_job_id("simcore/services/comp/x", "1.0.0", 1, project, node);
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_job_id_rejects_garbage() {
        assert!(parse_job_id("not-a-job").is_err());
        assert!(parse_job_id("k:v:userid_x:projectid_y:nodeid_z:uuid_w").is_err());
    }

    #[test]
    fn test_backend_state_mapping() {
        assert_eq!(backend_state_to_running_state("waiting"), RunningState::Pending);
        assert_eq!(
            backend_state_to_running_state("no-worker"),
            RunningState::WaitingForResources
        );
        assert_eq!(backend_state_to_running_state("processing"), RunningState::Started);
        assert_eq!(backend_state_to_running_state("memory"), RunningState::Success);
        assert_eq!(backend_state_to_running_state("erred"), RunningState::Failed);
        assert_eq!(backend_state_to_running_state("cancelled"), RunningState::Aborted);
        assert_eq!(backend_state_to_running_state("lost"), RunningState::Unknown);
    }

    #[test]
    fn test_requirements_to_resources() {
        let req = NodeRequirements {
            cpu: 2.0,
            gpu: Some(1.0),
            ram: 1024,
            vram: None,
        };
        let res = node_requirements_to_resources(&req);
        assert_eq!(res, resources(&[("CPU", 2.0), ("GPU", 1.0), ("RAM", 1024.0)]));
    }

    #[test]
    fn test_single_worker_fits() {
        let info = info(&[&[("CPU", 1.0), ("RAM", 100.0)], &[("CPU", 8.0), ("RAM", 1000.0)]]);
        let task = resources(&[("CPU", 4.0), ("RAM", 500.0)]);
        assert!(check_cluster_able_to_run(&info, 0, Uuid::new_v4(), &task).is_ok());
    }

    #[test]
    fn test_missing_resource_kind() {
        let info = info(&[&[("CPU", 8.0), ("RAM", 1000.0)]]);
        let task = resources(&[("CPU", 1.0), ("GPU", 1.0)]);
        let err = check_cluster_able_to_run(&info, 3, Uuid::new_v4(), &task).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::MissingComputationalResources { cluster_id: 3, .. }
        ));
    }

    #[test]
    fn test_insufficient_reports_cluster_total() {
        // Together the workers have enough CPU, but no single one does.
        let info = info(&[&[("CPU", 2.0), ("RAM", 100.0)], &[("CPU", 2.0), ("RAM", 100.0)]]);
        let task = resources(&[("CPU", 3.0), ("RAM", 50.0)]);
        match check_cluster_able_to_run(&info, 0, Uuid::new_v4(), &task).unwrap_err() {
            SchedulerError::InsufficientComputationalResources {
                cluster_resources, ..
            } => {
                assert_eq!(cluster_resources, resources(&[("CPU", 4.0), ("RAM", 200.0)]));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_no_workers_is_missing() {
        let info = info(&[]);
        let task = resources(&[("CPU", 1.0)]);
        assert!(matches!(
            check_cluster_able_to_run(&info, 0, Uuid::new_v4(), &task),
            Err(SchedulerError::MissingComputationalResources { .. })
        ));
    }

    #[test]
    fn test_check_before_submit_order() {
        let mut current = info(&[&[("CPU", 1.0)]]);
        let task = resources(&[("CPU", 100.0)]);
        let node = Uuid::new_v4();

        current.scheduler_id = "sched-2".to_string();
        assert!(matches!(
            check_before_submit("sched-1", &current, 0, node, &task, true),
            Err(SchedulerError::ComputationalSchedulerChanged { .. })
        ));

        current.scheduler_id = "sched-1".to_string();
        current.status = SchedulerStatus::Closing;
        assert!(matches!(
            check_before_submit("sched-1", &current, 0, node, &task, true),
            Err(SchedulerError::ComputationalBackendNotConnected { .. })
        ));

        current.status = SchedulerStatus::Running;
        assert!(check_before_submit("sched-1", &current, 0, node, &task, true).is_err());
        // Gateways skip the resource check.
        assert!(check_before_submit("sched-1", &current, 0, node, &task, false).is_ok());
    }
}
