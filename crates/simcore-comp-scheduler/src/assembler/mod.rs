// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task graph assembly.
//!
//! Turns a project's workbench into task records: resolves each node's
//! service metadata, binds pricing and hardware when a wallet pays for the
//! run, enforces the credit gate and derives the image the task will run.
//! Nothing is persisted until every node has been assembled, so a failing
//! node (e.g. an empty wallet) leaves the live table untouched.

pub mod collaborators;
pub mod frontend;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simcore_comp_core::models::{BootMode, HardwareInfo, Image, NodeRequirements, NodeSchema, PricingInfo};
use simcore_comp_core::{
    COMPLETED_STATES, CompTask, NewCompTask, NodeClass, NodeId, ProjectId, Result, RunningState,
    SchedulerError, TaskStore, UserId,
};
use tracing::{debug, info, instrument, warn};

pub use collaborators::*;
use frontend::frontend_service;

const CPUS_SAFE_MARGIN: f64 = 0.1;
const RAM_SAFE_MARGIN_RATIO: f64 = 0.1;

/// Current state of a workbench node as seen by the frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    /// Last known state.
    pub current_status: RunningState,
    /// Last known progress.
    #[serde(default)]
    pub progress: Option<f64>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            current_status: RunningState::NotStarted,
            progress: None,
        }
    }
}

/// A node of a project's workbench.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbenchNode {
    /// Node identifier.
    pub node_id: NodeId,
    /// Service key.
    pub key: String,
    /// Service version.
    pub version: String,
    /// Input values.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Output values.
    #[serde(default)]
    pub outputs: Map<String, Value>,
    /// Node state.
    #[serde(default)]
    pub state: NodeState,
}

/// Everything needed to assemble the tasks of a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTasksRequest {
    /// Project.
    pub project_id: ProjectId,
    /// User running the pipeline.
    pub user_id: UserId,
    /// Product the project belongs to.
    pub product_name: String,
    /// Workbench nodes in pipeline order.
    pub workbench: Vec<WorkbenchNode>,
    /// Nodes being published for execution.
    #[serde(default)]
    pub published_nodes: Vec<NodeId>,
    /// Wallet paying for the run.
    #[serde(default)]
    pub wallet_id: Option<i64>,
}

/// Services the assembler talks to.
#[derive(Clone)]
pub struct Collaborators {
    /// Service catalog.
    pub catalog: Arc<dyn CatalogClient>,
    /// Director (service extras and labels).
    pub director: Arc<dyn DirectorClient>,
    /// Wallets.
    pub wallets: Arc<dyn WalletsClient>,
    /// Resource usage tracker (pricing).
    pub resource_usage_tracker: Arc<dyn ResourceUsageTrackerClient>,
    /// Clusters keeper (instance types).
    pub clusters_keeper: Arc<dyn ClustersKeeperClient>,
    /// Project nodes repository.
    pub project_nodes: Arc<dyn ProjectNodesRepo>,
}

struct NodeInfos {
    details: ServiceMetadata,
    extras: Option<ServiceExtras>,
    labels: Option<ServiceLabels>,
}

struct ResolvedPricing {
    info: PricingInfo,
    unit_cost: Decimal,
    hardware: HardwareInfo,
}

fn pricing_rpc_error(err: RpcError, unit: Option<(i64, i64)>) -> SchedulerError {
    match (err, unit) {
        (RpcError::Timeout | RpcError::MethodNotRegistered(_), _) => {
            SchedulerError::ClustersKeeperNotAvailable
        }
        (RpcError::NotFound(_), Some((pricing_plan_id, pricing_unit_id))) => {
            SchedulerError::PricingUnitNotFound {
                pricing_plan_id,
                pricing_unit_id,
            }
        }
        (other, _) => SchedulerError::Collaborator {
            service: "resource-usage-tracker".to_string(),
            details: other.to_string(),
        },
    }
}

/// Sum `min(limit, reservation)` of every resource over all images.
pub fn compute_node_requirements(resources: &ServiceResources) -> Result<NodeRequirements> {
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for image in resources.values() {
        for (name, value) in &image.resources {
            *totals.entry(name.as_str()).or_default() += value.limit.min(value.reservation);
        }
    }
    let required = |name: &str| {
        totals
            .get(name)
            .copied()
            .ok_or_else(|| SchedulerError::Configuration {
                msg: format!("service resources do not define {}", name),
            })
    };

    Ok(NodeRequirements {
        cpu: required("CPU")?,
        gpu: totals.get("GPU").copied(),
        ram: required("RAM")? as u64,
        vram: totals.get("VRAM").map(|v| *v as u64),
    })
}

/// Preferred boot mode of the first image.
pub fn compute_node_boot_mode(resources: &ServiceResources) -> BootMode {
    resources
        .values()
        .next()
        .and_then(|image| image.boot_modes.first().copied())
        .unwrap_or_default()
}

/// Container environment from the `env` settings label.
///
/// Only `KEY=VALUE` entries are kept.
pub fn compute_node_envs(labels: &ServiceLabels) -> BTreeMap<String, String> {
    labels
        .settings
        .iter()
        .filter(|setting| setting.name == "env")
        .filter_map(|setting| setting.value.as_array())
        .flatten()
        .filter_map(Value::as_str)
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split('=').collect();
            match parts.as_slice() {
                [key, value] => Some((key.to_string(), value.to_string())),
                _ => None,
            }
        })
        .collect()
}

/// Builds task records from project workbenches.
pub struct TaskGraphAssembler {
    services: Collaborators,
}

impl TaskGraphAssembler {
    /// Create an assembler over `services`.
    pub fn new(services: Collaborators) -> Self {
        Self { services }
    }

    async fn node_infos(
        &self,
        user_id: UserId,
        product_name: &str,
        key: &str,
        version: &str,
    ) -> Result<Option<NodeInfos>> {
        match NodeClass::from_service_key(key) {
            Some(NodeClass::Frontend) => Ok(frontend_service(key).map(|details| NodeInfos {
                details: details.clone(),
                extras: None,
                labels: None,
            })),
            Some(_) => {
                let (details, extras, labels) = futures::try_join!(
                    self.services
                        .catalog
                        .get_service(user_id, key, version, product_name),
                    self.services.director.get_service_extras(key, version),
                    self.services.director.get_service_labels(key, version),
                )?;
                Ok(details.map(|details| NodeInfos {
                    details,
                    extras: Some(extras),
                    labels: Some(labels),
                }))
            }
            None => {
                warn!(key, "Unsupported service key");
                Ok(None)
            }
        }
    }

    async fn resolve_pricing(
        &self,
        request: &ProjectTasksRequest,
        node: &WorkbenchNode,
    ) -> Result<ResolvedPricing> {
        let rut = &self.services.resource_usage_tracker;
        let repo = &self.services.project_nodes;

        let (pricing_plan_id, pricing_unit_id) =
            match repo.get_pricing_unit(request.project_id, node.node_id).await? {
                Some(binding) => binding,
                None => {
                    let default = rut
                        .get_default_pricing_and_hardware_info(
                            &request.product_name,
                            &node.key,
                            &node.version,
                        )
                        .await
                        .map_err(|e| pricing_rpc_error(e, None))?;
                    repo.connect_pricing_unit(
                        request.project_id,
                        node.node_id,
                        default.pricing_plan_id,
                        default.pricing_unit_id,
                    )
                    .await?;
                    debug!(
                        node_id = %node.node_id,
                        pricing_plan_id = default.pricing_plan_id,
                        pricing_unit_id = default.pricing_unit_id,
                        "Bound default pricing unit"
                    );
                    (default.pricing_plan_id, default.pricing_unit_id)
                }
            };

        let unit = rut
            .get_pricing_unit(&request.product_name, pricing_plan_id, pricing_unit_id)
            .await
            .map_err(|e| pricing_rpc_error(e, Some((pricing_plan_id, pricing_unit_id))))?;

        Ok(ResolvedPricing {
            info: PricingInfo {
                pricing_plan_id,
                pricing_unit_id,
                pricing_unit_cost_id: unit.current_cost_per_unit_id,
            },
            unit_cost: unit.current_cost_per_unit,
            hardware: HardwareInfo {
                aws_ec2_instances: unit.aws_ec2_instances,
            },
        })
    }

    /// Override the node's single-container resources with the selected
    /// instance type.
    async fn apply_hardware_info(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        hardware: &HardwareInfo,
    ) -> Result<()> {
        let Some(selected_name) = hardware.aws_ec2_instances.first() else {
            return Ok(());
        };
        let names: BTreeSet<String> = hardware.aws_ec2_instances.iter().cloned().collect();

        let instance_types = self
            .services
            .clusters_keeper
            .get_instance_type_details(&names)
            .await
            .map_err(|e| {
                warn!(error = %e, "Clusters keeper did not answer instance type query");
                SchedulerError::ClustersKeeperNotAvailable
            })?;
        let selected = instance_types
            .iter()
            .find(|t| &t.name == selected_name)
            .ok_or_else(|| SchedulerError::Configuration {
                msg: format!(
                    "invalid EC2 type name selected {:?}. TIP: adjust product configuration",
                    names
                ),
            })?;

        let repo = &self.services.project_nodes;
        let mut resources = repo.get_required_resources(project_id, node_id).await?;
        let Some(container) = resources.get_mut(DEFAULT_SINGLE_SERVICE_NAME) else {
            warn!(
                %node_id,
                "Resource override is not supported for multi-container services"
            );
            return Ok(());
        };

        let ram = selected.ram as f64;
        let zero = ResourceValue {
            limit: 0.0,
            reservation: 0.0,
        };
        container
            .resources
            .entry("CPU".to_string())
            .or_insert(zero)
            .set_value(f64::from(selected.cpus) - CPUS_SAFE_MARGIN);
        container
            .resources
            .entry("RAM".to_string())
            .or_insert(zero)
            .set_value((ram - RAM_SAFE_MARGIN_RATIO * ram).trunc());

        repo.update_required_resources(project_id, node_id, &resources)
            .await?;
        debug!(%node_id, instance_type = %selected.name, "Applied hardware override");
        Ok(())
    }

    async fn task_image(
        &self,
        request: &ProjectTasksRequest,
        node: &WorkbenchNode,
        infos: &NodeInfos,
    ) -> Result<Image> {
        let mut image = Image::new(&node.key, &node.version);

        let mut resources = self
            .services
            .project_nodes
            .get_required_resources(request.project_id, node.node_id)
            .await?;
        if resources.is_empty() {
            resources = self
                .services
                .catalog
                .get_service_resources(request.user_id, &node.key, &node.version)
                .await?;
        }
        if !resources.is_empty() {
            image.node_requirements = Some(compute_node_requirements(&resources)?);
            image.boot_mode = compute_node_boot_mode(&resources);
        }

        if let Some(labels) = &infos.labels {
            image.envs = compute_node_envs(labels);
        }
        if let Some(spec) = infos.extras.as_ref().and_then(|e| e.container_spec.as_ref()) {
            image.command = spec.command.clone();
        }
        Ok(image)
    }

    /// Assemble the task records of a project without persisting them.
    #[instrument(skip(self, request), fields(project_id = %request.project_id))]
    pub async fn generate_tasks(&self, request: &ProjectTasksRequest) -> Result<Vec<NewCompTask>> {
        let wallet = match request.wallet_id {
            Some(wallet_id) => Some(
                self.services
                    .wallets
                    .get_wallet_with_available_credits(
                        request.user_id,
                        &request.product_name,
                        wallet_id,
                    )
                    .await?,
            ),
            None => None,
        };

        let mut node_infos: HashMap<(&str, &str), Option<NodeInfos>> = HashMap::new();
        for node in &request.workbench {
            let key = (node.key.as_str(), node.version.as_str());
            if !node_infos.contains_key(&key) {
                let infos = self
                    .node_infos(request.user_id, &request.product_name, key.0, key.1)
                    .await?;
                node_infos.insert(key, infos);
            }
        }

        let mut tasks = Vec::with_capacity(request.workbench.len());
        for (position, node) in request.workbench.iter().enumerate() {
            let infos = node_infos
                .get(&(node.key.as_str(), node.version.as_str()))
                .and_then(Option::as_ref);
            let (Some(infos), Some(node_class)) = (infos, NodeClass::from_service_key(&node.key))
            else {
                debug!(node_id = %node.node_id, key = %node.key, "No service details, skipping node");
                continue;
            };

            let mut state = node.state.current_status;
            let progress = if COMPLETED_STATES.contains(&state) {
                node.state.progress
            } else {
                None
            };
            if node_class == NodeClass::Computational
                && request.published_nodes.contains(&node.node_id)
            {
                state = RunningState::Published;
            }

            let pricing = match &wallet {
                Some(_) if node_class != NodeClass::Frontend => {
                    Some(self.resolve_pricing(request, node).await?)
                }
                _ => None,
            };

            if let (Some(wallet), Some(pricing)) = (&wallet, &pricing)
                && pricing.unit_cost > Decimal::ZERO
                && wallet.wallet_credit_amount <= Decimal::ZERO
            {
                return Err(SchedulerError::WalletNotEnoughCredits {
                    wallet_name: wallet.wallet_name.clone(),
                    wallet_credit_amount: wallet.wallet_credit_amount,
                });
            }

            let (pricing_info, hardware_info) = match pricing {
                Some(p) => (Some(p.info), p.hardware),
                None => (None, HardwareInfo::default()),
            };
            if wallet.is_some() {
                self.apply_hardware_info(request.project_id, node.node_id, &hardware_info)
                    .await?;
            }

            let image = self.task_image(request, node, infos).await?;

            tasks.push(NewCompTask {
                project_id: request.project_id,
                node_id: node.node_id,
                internal_id: (position + 1) as i32,
                schema: NodeSchema {
                    inputs: infos.details.inputs.clone(),
                    outputs: infos.details.outputs.clone(),
                },
                inputs: node.inputs.clone(),
                outputs: node.outputs.clone(),
                image,
                state,
                progress,
                node_class,
                submit: Utc::now(),
                pricing_info,
                hardware_info,
            });
        }

        Ok(tasks)
    }

    /// Assemble the project's tasks and store them.
    pub async fn upsert_tasks_from_project(
        &self,
        store: &dyn TaskStore,
        request: &ProjectTasksRequest,
    ) -> Result<Vec<CompTask>> {
        let tasks = self.generate_tasks(request).await?;
        let workbench_node_ids: Vec<NodeId> =
            request.workbench.iter().map(|n| n.node_id).collect();

        let stored = store
            .upsert_tasks_from_project(
                request.project_id,
                &workbench_node_ids,
                &tasks,
                &request.published_nodes,
            )
            .await?;

        info!(
            project_id = %request.project_id,
            tasks = stored.len(),
            published = request.published_nodes.len(),
            "Project tasks upserted"
        );
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use simcore_comp_core::{SqliteTaskStore, migrations};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn dec(value: i64) -> Decimal {
        Decimal::from(value)
    }

    const COMP_KEY: &str = "simcore/services/comp/itis/sleeper";
    const PICKER_KEY: &str = "simcore/services/frontend/file-picker";
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

    fn container_resources(cpu: f64, ram: f64) -> ServiceResources {
        BTreeMap::from([(
            DEFAULT_SINGLE_SERVICE_NAME.to_string(),
            ImageResources {
                image: format!("{}:2.1.4", COMP_KEY),
                resources: BTreeMap::from([
                    (
                        "CPU".to_string(),
                        ResourceValue {
                            limit: cpu * 2.0,
                            reservation: cpu,
                        },
                    ),
                    (
                        "RAM".to_string(),
                        ResourceValue {
                            limit: ram,
                            reservation: ram,
                        },
                    ),
                ]),
                boot_modes: vec![BootMode::Gpu, BootMode::Cpu],
            },
        )])
    }

    struct Fake {
        known_services: Vec<String>,
        wallet_credits: Decimal,
        unit_cost: Decimal,
        unit_instances: Vec<String>,
        pricing_error: Option<RpcError>,
        instance_types: Vec<Ec2InstanceType>,
        keeper_error: Option<RpcError>,
        catalog_resources: ServiceResources,
        node_resources: Mutex<HashMap<NodeId, ServiceResources>>,
        node_pricing: Mutex<HashMap<NodeId, (i64, i64)>>,
        connect_calls: AtomicUsize,
        get_service_calls: AtomicUsize,
        rut_calls: AtomicUsize,
    }

    impl Default for Fake {
        fn default() -> Self {
            Self {
                known_services: vec![COMP_KEY.to_string()],
                wallet_credits: dec(100),
                unit_cost: dec(5),
                unit_instances: Vec::new(),
                pricing_error: None,
                instance_types: Vec::new(),
                keeper_error: None,
                catalog_resources: container_resources(1.0, GIB),
                node_resources: Mutex::new(HashMap::new()),
                node_pricing: Mutex::new(HashMap::new()),
                connect_calls: AtomicUsize::new(0),
                get_service_calls: AtomicUsize::new(0),
                rut_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CatalogClient for Fake {
        async fn get_service(
            &self,
            _user_id: UserId,
            key: &str,
            version: &str,
            _product_name: &str,
        ) -> Result<Option<ServiceMetadata>> {
            self.get_service_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .known_services
                .iter()
                .any(|k| k == key)
                .then(|| ServiceMetadata {
                    key: key.to_string(),
                    version: version.to_string(),
                    name: "sleeper".to_string(),
                    inputs: json!({"input_1": {"type": "number"}})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    outputs: json!({"output_1": {"type": "number"}})
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                }))
        }

        async fn get_service_resources(
            &self,
            _user_id: UserId,
            _key: &str,
            _version: &str,
        ) -> Result<ServiceResources> {
            Ok(self.catalog_resources.clone())
        }
    }

    #[async_trait]
    impl DirectorClient for Fake {
        async fn get_service_extras(&self, _key: &str, _version: &str) -> Result<ServiceExtras> {
            Ok(ServiceExtras {
                container_spec: Some(ContainerSpec {
                    command: vec!["run".to_string(), "--fast".to_string()],
                }),
            })
        }

        async fn get_service_labels(&self, _key: &str, _version: &str) -> Result<ServiceLabels> {
            Ok(ServiceLabels {
                settings: vec![
                    ServiceSetting {
                        name: "env".to_string(),
                        value: json!(["SIM_MODE=fast", "BROKEN", "A=B=C"]),
                    },
                    ServiceSetting {
                        name: "Resources".to_string(),
                        value: json!({"Limits": {}}),
                    },
                ],
            })
        }
    }

    #[async_trait]
    impl WalletsClient for Fake {
        async fn get_wallet_with_available_credits(
            &self,
            _user_id: UserId,
            _product_name: &str,
            wallet_id: i64,
        ) -> Result<WalletInfo> {
            Ok(WalletInfo {
                wallet_id,
                wallet_name: "team wallet".to_string(),
                wallet_credit_amount: self.wallet_credits,
            })
        }
    }

    #[async_trait]
    impl ResourceUsageTrackerClient for Fake {
        async fn get_default_pricing_and_hardware_info(
            &self,
            _product_name: &str,
            _service_key: &str,
            _service_version: &str,
        ) -> std::result::Result<DefaultPricing, RpcError> {
            self.rut_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = &self.pricing_error {
                return Err(e.clone());
            }
            Ok(DefaultPricing {
                pricing_plan_id: 1,
                pricing_unit_id: 10,
                pricing_unit_cost_id: 100,
                aws_ec2_instances: self.unit_instances.clone(),
            })
        }

        async fn get_pricing_unit(
            &self,
            _product_name: &str,
            _pricing_plan_id: i64,
            pricing_unit_id: i64,
        ) -> std::result::Result<PricingUnit, RpcError> {
            self.rut_calls.fetch_add(1, Ordering::SeqCst);
            Ok(PricingUnit {
                pricing_unit_id,
                current_cost_per_unit: self.unit_cost,
                current_cost_per_unit_id: 100,
                aws_ec2_instances: self.unit_instances.clone(),
            })
        }
    }

    #[async_trait]
    impl ClustersKeeperClient for Fake {
        async fn get_instance_type_details(
            &self,
            _instance_type_names: &BTreeSet<String>,
        ) -> std::result::Result<Vec<Ec2InstanceType>, RpcError> {
            match &self.keeper_error {
                Some(e) => Err(e.clone()),
                None => Ok(self.instance_types.clone()),
            }
        }
    }

    #[async_trait]
    impl ProjectNodesRepo for Fake {
        async fn get_required_resources(
            &self,
            _project_id: ProjectId,
            node_id: NodeId,
        ) -> Result<ServiceResources> {
            Ok(self
                .node_resources
                .lock()
                .unwrap()
                .get(&node_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn update_required_resources(
            &self,
            _project_id: ProjectId,
            node_id: NodeId,
            resources: &ServiceResources,
        ) -> Result<()> {
            self.node_resources
                .lock()
                .unwrap()
                .insert(node_id, resources.clone());
            Ok(())
        }

        async fn get_pricing_unit(
            &self,
            _project_id: ProjectId,
            node_id: NodeId,
        ) -> Result<Option<(i64, i64)>> {
            Ok(self.node_pricing.lock().unwrap().get(&node_id).copied())
        }

        async fn connect_pricing_unit(
            &self,
            _project_id: ProjectId,
            node_id: NodeId,
            pricing_plan_id: i64,
            pricing_unit_id: i64,
        ) -> Result<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            self.node_pricing
                .lock()
                .unwrap()
                .insert(node_id, (pricing_plan_id, pricing_unit_id));
            Ok(())
        }
    }

    fn assembler(fake: Arc<Fake>) -> TaskGraphAssembler {
        TaskGraphAssembler::new(Collaborators {
            catalog: fake.clone(),
            director: fake.clone(),
            wallets: fake.clone(),
            resource_usage_tracker: fake.clone(),
            clusters_keeper: fake.clone(),
            project_nodes: fake,
        })
    }

    fn node(key: &str, state: RunningState, progress: Option<f64>) -> WorkbenchNode {
        WorkbenchNode {
            node_id: Uuid::new_v4(),
            key: key.to_string(),
            version: if key == PICKER_KEY { "1.0.0" } else { "2.1.4" }.to_string(),
            inputs: Map::new(),
            outputs: Map::new(),
            state: NodeState {
                current_status: state,
                progress,
            },
        }
    }

    fn request(workbench: Vec<WorkbenchNode>, wallet_id: Option<i64>) -> ProjectTasksRequest {
        ProjectTasksRequest {
            project_id: Uuid::new_v4(),
            user_id: 3,
            product_name: "osparc".to_string(),
            published_nodes: Vec::new(),
            workbench,
            wallet_id,
        }
    }

    async fn sqlite_store() -> SqliteTaskStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrations::run_sqlite(&pool).await.unwrap();
        SqliteTaskStore::new(pool)
    }

    #[test]
    fn test_compute_node_requirements_takes_min_of_limit_and_reservation() {
        let mut resources = container_resources(2.0, GIB);
        resources.insert(
            "sidecar".to_string(),
            ImageResources {
                image: "sidecar:1".to_string(),
                resources: BTreeMap::from([
                    (
                        "CPU".to_string(),
                        ResourceValue {
                            limit: 0.5,
                            reservation: 1.0,
                        },
                    ),
                    (
                        "GPU".to_string(),
                        ResourceValue {
                            limit: 1.0,
                            reservation: 1.0,
                        },
                    ),
                ]),
                boot_modes: vec![BootMode::Cpu],
            },
        );

        let req = compute_node_requirements(&resources).unwrap();
        assert_eq!(req.cpu, 2.5);
        assert_eq!(req.ram, GIB as u64);
        assert_eq!(req.gpu, Some(1.0));
        assert_eq!(req.vram, None);
    }

    #[test]
    fn test_compute_node_requirements_needs_cpu_and_ram() {
        let resources = BTreeMap::from([(
            "container".to_string(),
            ImageResources {
                image: "x".to_string(),
                resources: BTreeMap::new(),
                boot_modes: vec![],
            },
        )]);
        assert!(matches!(
            compute_node_requirements(&resources),
            Err(SchedulerError::Configuration { .. })
        ));
        assert_eq!(compute_node_boot_mode(&resources), BootMode::Cpu);
    }

    #[test]
    fn test_compute_node_envs_keeps_key_value_pairs() {
        let labels = ServiceLabels {
            settings: vec![ServiceSetting {
                name: "env".to_string(),
                value: json!(["A=1", "NOPE", "B=2=3", "C="]),
            }],
        };
        let envs = compute_node_envs(&labels);
        assert_eq!(
            envs,
            BTreeMap::from([
                ("A".to_string(), "1".to_string()),
                ("C".to_string(), String::new()),
            ])
        );
    }

    #[tokio::test]
    async fn test_generate_tasks_without_wallet() {
        let fake = Arc::new(Fake::default());
        let assembler = assembler(fake.clone());

        let comp = node(COMP_KEY, RunningState::Success, Some(1.0));
        let running = node(COMP_KEY, RunningState::Started, Some(0.4));
        let picker = node(PICKER_KEY, RunningState::NotStarted, None);
        let unknown = node("simcore/services/comp/unknown", RunningState::NotStarted, None);
        let mut request = request(
            vec![comp.clone(), unknown.clone(), running.clone(), picker.clone()],
            None,
        );
        request.published_nodes = vec![running.node_id, picker.node_id];

        let tasks = assembler.generate_tasks(&request).await.unwrap();
        assert_eq!(tasks.len(), 3);

        // Metadata is fetched once per service key and version.
        assert_eq!(fake.get_service_calls.load(Ordering::SeqCst), 2);
        assert_eq!(fake.rut_calls.load(Ordering::SeqCst), 0);

        let first = &tasks[0];
        assert_eq!(first.internal_id, 1);
        assert_eq!(first.state, RunningState::Success);
        assert_eq!(first.progress, Some(1.0));
        assert!(first.pricing_info.is_none());
        assert!(first.hardware_info.aws_ec2_instances.is_empty());
        assert!(first.schema.inputs.contains_key("input_1"));
        assert_eq!(first.image.command, vec!["run", "--fast"]);
        assert_eq!(first.image.boot_mode, BootMode::Gpu);
        assert_eq!(first.image.envs.get("SIM_MODE").map(String::as_str), Some("fast"));
        assert_eq!(first.image.envs.len(), 1);
        let requirements = first.image.node_requirements.as_ref().unwrap();
        assert_eq!(requirements.cpu, 1.0);
        assert_eq!(requirements.ram, GIB as u64);

        let second = &tasks[1];
        assert_eq!(second.node_id, running.node_id);
        assert_eq!(second.internal_id, 3);
        assert_eq!(second.state, RunningState::Published);
        assert_eq!(second.progress, None);

        let third = &tasks[2];
        assert_eq!(third.node_class, NodeClass::Frontend);
        assert_eq!(third.state, RunningState::NotStarted);
        assert_eq!(third.image.command, vec!["run"]);
        assert!(third.schema.outputs.contains_key("outFile"));
    }

    #[tokio::test]
    async fn test_credit_gate_blocks_before_persisting() {
        let fake = Arc::new(Fake {
            wallet_credits: Decimal::ZERO,
            unit_cost: dec(5),
            ..Fake::default()
        });
        let assembler = assembler(fake);
        let store = sqlite_store().await;
        let request = request(vec![node(COMP_KEY, RunningState::NotStarted, None)], Some(9));

        let err = assembler
            .upsert_tasks_from_project(&store, &request)
            .await
            .unwrap_err();
        match err {
            SchedulerError::WalletNotEnoughCredits {
                wallet_name,
                wallet_credit_amount,
            } => {
                assert_eq!(wallet_name, "team wallet");
                assert_eq!(wallet_credit_amount, Decimal::ZERO);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(store.list_tasks(request.project_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_free_unit_passes_credit_gate() {
        let fake = Arc::new(Fake {
            wallet_credits: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            ..Fake::default()
        });
        let tasks = assembler(fake)
            .generate_tasks(&request(vec![node(COMP_KEY, RunningState::NotStarted, None)], Some(9)))
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_default_pricing_is_bound_once() {
        let fake = Arc::new(Fake::default());
        let assembler = assembler(fake.clone());
        let workbench = vec![
            node(COMP_KEY, RunningState::NotStarted, None),
            node(PICKER_KEY, RunningState::NotStarted, None),
        ];
        let request = request(workbench, Some(9));

        let tasks = assembler.generate_tasks(&request).await.unwrap();
        assert_eq!(
            tasks[0].pricing_info,
            Some(PricingInfo {
                pricing_plan_id: 1,
                pricing_unit_id: 10,
                pricing_unit_cost_id: 100,
            })
        );
        // Frontend nodes carry no pricing.
        assert!(tasks[1].pricing_info.is_none());
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), 1);

        assembler.generate_tasks(&request).await.unwrap();
        assert_eq!(fake.connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pricing_rpc_timeout_means_keeper_unavailable() {
        let fake = Arc::new(Fake {
            pricing_error: Some(RpcError::Timeout),
            ..Fake::default()
        });
        let err = assembler(fake)
            .generate_tasks(&request(vec![node(COMP_KEY, RunningState::NotStarted, None)], Some(9)))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ClustersKeeperNotAvailable));
    }

    #[tokio::test]
    async fn test_hardware_override_adjusts_resources() {
        let fake = Arc::new(Fake {
            unit_instances: vec!["g4dn.xlarge".to_string(), "t2.micro".to_string()],
            instance_types: vec![
                Ec2InstanceType {
                    name: "t2.micro".to_string(),
                    cpus: 1,
                    ram: 1_000_000_000,
                },
                Ec2InstanceType {
                    name: "g4dn.xlarge".to_string(),
                    cpus: 4,
                    ram: 16_000_000_000,
                },
            ],
            ..Fake::default()
        });
        let comp = node(COMP_KEY, RunningState::NotStarted, None);
        fake.node_resources
            .lock()
            .unwrap()
            .insert(comp.node_id, container_resources(1.0, GIB));

        let tasks = assembler(fake.clone())
            .generate_tasks(&request(vec![comp.clone()], Some(9)))
            .await
            .unwrap();

        let stored = fake.node_resources.lock().unwrap()[&comp.node_id].clone();
        let container = &stored[DEFAULT_SINGLE_SERVICE_NAME];
        assert_eq!(container.resources["CPU"].limit, 3.9);
        assert_eq!(container.resources["CPU"].reservation, 3.9);
        assert_eq!(container.resources["RAM"].reservation, 14_400_000_000.0);

        let requirements = tasks[0].image.node_requirements.as_ref().unwrap();
        assert_eq!(requirements.cpu, 3.9);
        assert_eq!(requirements.ram, 14_400_000_000);
        assert_eq!(
            tasks[0].hardware_info.aws_ec2_instances,
            vec!["g4dn.xlarge".to_string(), "t2.micro".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_type_is_configuration_error() {
        let fake = Arc::new(Fake {
            unit_instances: vec!["x1.huge".to_string()],
            instance_types: vec![Ec2InstanceType {
                name: "t2.micro".to_string(),
                cpus: 1,
                ram: 1_000_000_000,
            }],
            ..Fake::default()
        });
        let err = assembler(fake)
            .generate_tasks(&request(vec![node(COMP_KEY, RunningState::NotStarted, None)], Some(9)))
            .await
            .unwrap_err();
        match err {
            SchedulerError::Configuration { msg } => {
                assert!(msg.contains("x1.huge"));
                assert!(msg.contains("TIP: adjust product configuration"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_keeper_rpc_failure_means_keeper_unavailable() {
        for error in [
            RpcError::Timeout,
            RpcError::MethodNotRegistered("get_instance_type_details".to_string()),
            RpcError::Server("boom".to_string()),
        ] {
            let fake = Arc::new(Fake {
                unit_instances: vec!["t2.micro".to_string()],
                keeper_error: Some(error),
                ..Fake::default()
            });
            let err = assembler(fake)
                .generate_tasks(&request(vec![node(COMP_KEY, RunningState::NotStarted, None)], Some(9)))
                .await
                .unwrap_err();
            assert!(matches!(err, SchedulerError::ClustersKeeperNotAvailable));
        }
    }

    #[tokio::test]
    async fn test_multi_container_services_keep_their_resources() {
        let fake = Arc::new(Fake {
            unit_instances: vec!["t2.micro".to_string()],
            instance_types: vec![Ec2InstanceType {
                name: "t2.micro".to_string(),
                cpus: 1,
                ram: 1_000_000_000,
            }],
            ..Fake::default()
        });
        let comp = node(COMP_KEY, RunningState::NotStarted, None);
        let mut resources = container_resources(0.5, GIB);
        if let Some(image) = resources.remove(DEFAULT_SINGLE_SERVICE_NAME) {
            resources.insert("solver".to_string(), image);
        }
        fake.node_resources
            .lock()
            .unwrap()
            .insert(comp.node_id, resources.clone());

        let tasks = assembler(fake.clone())
            .generate_tasks(&request(vec![comp.clone()], Some(9)))
            .await
            .unwrap();
        assert_eq!(fake.node_resources.lock().unwrap()[&comp.node_id], resources);
        assert_eq!(tasks[0].image.node_requirements.as_ref().unwrap().cpu, 0.5);
    }

    #[tokio::test]
    async fn test_upsert_keeps_backend_state_of_unpublished_nodes() {
        let fake = Arc::new(Fake::default());
        let assembler = assembler(fake);
        let store = sqlite_store().await;
        let comp = node(COMP_KEY, RunningState::NotStarted, None);
        let mut request = request(vec![comp.clone()], None);
        request.published_nodes = vec![comp.node_id];

        let stored = assembler
            .upsert_tasks_from_project(&store, &request)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, RunningState::Published);

        // Re-assembling without publishing must not reset the stored state.
        request.published_nodes.clear();
        let stored = assembler
            .upsert_tasks_from_project(&store, &request)
            .await
            .unwrap();
        assert_eq!(stored[0].state, RunningState::Published);
    }
}
