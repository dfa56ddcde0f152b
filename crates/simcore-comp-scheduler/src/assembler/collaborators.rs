// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interfaces of the services the assembler depends on.
//!
//! Catalog, director, wallets and project nodes are request/response
//! services; resource usage tracker and clusters keeper are reached over a
//! message bus and fail with [`RpcError`].

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simcore_comp_core::models::BootMode;
use simcore_comp_core::{NodeId, ProjectId, Result, UserId};
use thiserror::Error;

/// Name of the resource entry of single-container services.
pub const DEFAULT_SINGLE_SERVICE_NAME: &str = "container";

/// Failure of a bus-based remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No answer within the deadline.
    #[error("RPC timed out")]
    Timeout,
    /// Nobody serves the method.
    #[error("RPC method '{0}' is not registered")]
    MethodNotRegistered(String),
    /// The remote side does not know the requested entity.
    #[error("RPC target not found: {0}")]
    NotFound(String),
    /// The remote handler failed.
    #[error("RPC server error: {0}")]
    Server(String),
}

/// Published metadata of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceMetadata {
    /// Service key.
    pub key: String,
    /// Service version.
    pub version: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Input port schema.
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Output port schema.
    #[serde(default)]
    pub outputs: Map<String, Value>,
}

/// Limit and reservation of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceValue {
    /// Upper bound.
    pub limit: f64,
    /// Amount reserved on the worker.
    pub reservation: f64,
}

impl ResourceValue {
    /// Set both limit and reservation.
    pub fn set_value(&mut self, value: f64) {
        self.limit = value;
        self.reservation = value;
    }
}

/// Resources of one image of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageResources {
    /// Image name.
    pub image: String,
    /// Resources keyed by name (`CPU`, `RAM`, ...).
    pub resources: BTreeMap<String, ResourceValue>,
    /// Supported boot modes, preferred first.
    #[serde(default = "default_boot_modes")]
    pub boot_modes: Vec<BootMode>,
}

fn default_boot_modes() -> Vec<BootMode> {
    vec![BootMode::Cpu]
}

/// Resources of every image of a service, keyed by container name.
pub type ServiceResources = BTreeMap<String, ImageResources>;

/// Container specification overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Command replacing the image default.
    pub command: Vec<String>,
}

/// Extra information the director knows about a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceExtras {
    /// Container overrides, if any.
    #[serde(default)]
    pub container_spec: Option<ContainerSpec>,
}

/// One `simcore.service.settings` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSetting {
    /// Setting name (`env`, `Resources`, ...).
    pub name: String,
    /// Setting payload.
    pub value: Value,
}

/// Image labels of a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceLabels {
    /// Service settings.
    #[serde(default)]
    pub settings: Vec<ServiceSetting>,
}

/// A wallet and its available credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletInfo {
    /// Wallet identifier.
    pub wallet_id: i64,
    /// Wallet name.
    pub wallet_name: String,
    /// Available credits.
    pub wallet_credit_amount: Decimal,
}

/// Default pricing of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultPricing {
    /// Pricing plan.
    pub pricing_plan_id: i64,
    /// Pricing unit.
    pub pricing_unit_id: i64,
    /// Current cost entry of the unit.
    pub pricing_unit_cost_id: i64,
    /// Instance types bound to the unit.
    #[serde(default)]
    pub aws_ec2_instances: Vec<String>,
}

/// A pricing unit with its live cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingUnit {
    /// Pricing unit.
    pub pricing_unit_id: i64,
    /// Cost per unit of time.
    pub current_cost_per_unit: Decimal,
    /// Identifier of the current cost entry.
    pub current_cost_per_unit_id: i64,
    /// Instance types bound to the unit.
    #[serde(default)]
    pub aws_ec2_instances: Vec<String>,
}

/// An EC2 instance type known to the fleet manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ec2InstanceType {
    /// Type name, e.g. `t2.medium`.
    pub name: String,
    /// Number of CPUs.
    pub cpus: u32,
    /// RAM in bytes.
    pub ram: u64,
}

#[allow(missing_docs)]
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Metadata of a service, `None` when the catalog does not know it.
    async fn get_service(
        &self,
        user_id: UserId,
        key: &str,
        version: &str,
        product_name: &str,
    ) -> Result<Option<ServiceMetadata>>;

    async fn get_service_resources(
        &self,
        user_id: UserId,
        key: &str,
        version: &str,
    ) -> Result<ServiceResources>;
}

#[allow(missing_docs)]
#[async_trait]
pub trait DirectorClient: Send + Sync {
    async fn get_service_extras(&self, key: &str, version: &str) -> Result<ServiceExtras>;

    async fn get_service_labels(&self, key: &str, version: &str) -> Result<ServiceLabels>;
}

#[allow(missing_docs)]
#[async_trait]
pub trait WalletsClient: Send + Sync {
    async fn get_wallet_with_available_credits(
        &self,
        user_id: UserId,
        product_name: &str,
        wallet_id: i64,
    ) -> Result<WalletInfo>;
}

#[allow(missing_docs)]
#[async_trait]
pub trait ResourceUsageTrackerClient: Send + Sync {
    async fn get_default_pricing_and_hardware_info(
        &self,
        product_name: &str,
        service_key: &str,
        service_version: &str,
    ) -> std::result::Result<DefaultPricing, RpcError>;

    async fn get_pricing_unit(
        &self,
        product_name: &str,
        pricing_plan_id: i64,
        pricing_unit_id: i64,
    ) -> std::result::Result<PricingUnit, RpcError>;
}

#[allow(missing_docs)]
#[async_trait]
pub trait ClustersKeeperClient: Send + Sync {
    /// Details of the named instance types, in no particular order.
    async fn get_instance_type_details(
        &self,
        instance_type_names: &BTreeSet<String>,
    ) -> std::result::Result<Vec<Ec2InstanceType>, RpcError>;
}

/// Per-node data stored alongside the project.
#[allow(missing_docs)]
#[async_trait]
pub trait ProjectNodesRepo: Send + Sync {
    /// Required resources of the node; empty when none were stored.
    async fn get_required_resources(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<ServiceResources>;

    async fn update_required_resources(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        resources: &ServiceResources,
    ) -> Result<()>;

    /// Pricing plan and unit bound to the node, if any.
    async fn get_pricing_unit(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
    ) -> Result<Option<(i64, i64)>>;

    async fn connect_pricing_unit(
        &self,
        project_id: ProjectId,
        node_id: NodeId,
        pricing_plan_id: i64,
        pricing_unit_id: i64,
    ) -> Result<()>;
}
