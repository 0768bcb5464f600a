use std::{collections::BTreeMap, fmt::Display};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::{
    component::{JobDefinition, NodePoolDefinition, ServiceDefinition},
    path::TreePath,
};

use super::{container_build::ContainerBuildArtifacts, node_pool::NodePoolState, service::ServiceState};

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "System",
    namespaced,
    status = "SystemStatus",
    derive = "Default"
)]
pub struct SystemSpec {
    /// git URL of the system definition
    pub definition_url: String,
    /// definition version the services were deployed from
    pub version: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<TreePath, SystemServiceSpec>,
    #[serde(default)]
    pub jobs: BTreeMap<TreePath, SystemJobSpec>,
    /// node pools shared between the services, keyed by their `/path:name`
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolDefinition>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceSpec {
    pub definition: ServiceDefinition,
    /// artifacts of the service's containers, keyed by the container name
    #[serde(default)]
    pub artifacts: BTreeMap<String, ContainerBuildArtifacts>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemJobSpec {
    pub definition: JobDefinition,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ContainerBuildArtifacts>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub observed_generation: Option<i64>,
    pub state: SystemState,
    pub message: Option<String>,
    #[serde(default)]
    pub services: BTreeMap<TreePath, SystemServiceStatus>,
    #[serde(default)]
    pub node_pools: BTreeMap<String, SystemNodePoolStatus>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SystemNodePoolStatus {
    pub name: String,
    pub state: NodePoolState,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SystemState {
    #[default]
    Pending,
    Stable,
    Degraded,
    Updating,
    Deleting,
    Failed,
}

impl Display for SystemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SystemState::Pending => f.write_str("system is waiting to be processed"),
            SystemState::Stable => f.write_str("all services are stable"),
            SystemState::Degraded => f.write_str("at least one service has failed"),
            SystemState::Updating => f.write_str("services are being updated"),
            SystemState::Deleting => f.write_str("system is being deleted"),
            SystemState::Failed => f.write_str("system couldn't be reconciled"),
        }
    }
}
