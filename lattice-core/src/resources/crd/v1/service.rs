use std::{collections::BTreeMap, fmt::Display};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::{
    component::{PortProtocol, ServiceDefinition},
    path::TreePath,
};

use super::container_build::ContainerBuildArtifacts;

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Service",
    namespaced,
    status = "ServiceStatus",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct ServiceSpec {
    pub path: TreePath,
    pub definition: ServiceDefinition,
    /// artifacts of the service's containers, keyed by the container name
    #[serde(default)]
    pub artifacts: BTreeMap<String, ContainerBuildArtifacts>,
    pub num_instances: i32,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    /// shared node pool the service runs on, in the `/path:name` form
    pub shared_node_pool: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    pub name: String,
    pub port: i32,
    pub protocol: PortProtocol,
    pub public: bool,
}

impl ServiceSpec {
    pub fn from_definition(
        path: TreePath,
        definition: ServiceDefinition,
        artifacts: BTreeMap<String, ContainerBuildArtifacts>,
    ) -> Self {
        let ports = definition
            .containers()
            .flat_map(|(_, container)| container.ports.iter())
            .map(|(name, port)| ServicePort {
                name: name.to_owned(),
                port: port.port,
                protocol: port.protocol,
                public: port.public,
            })
            .collect();

        Self {
            path,
            num_instances: definition.num_instances(),
            shared_node_pool: definition.shared_node_pool.clone(),
            definition,
            artifacts,
            ports,
        }
    }

    pub fn public_ports(&self) -> impl Iterator<Item = &ServicePort> {
        self.ports.iter().filter(|port| port.public)
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub observed_generation: Option<i64>,
    pub state: ServiceState,
    pub message: Option<String>,
    #[serde(default)]
    pub updated_instances: i32,
    #[serde(default)]
    pub stale_instances: i32,
    #[serde(default)]
    pub ready_instances: i32,
    /// service port to the address it's reachable at
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    pub workload: Option<String>,
    pub address: Option<String>,
    pub node_pool: Option<String>,
    pub node_pool_epoch: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Pending,
    Scaling,
    Stable,
    Updating,
    Deleting,
    Failed,
}

impl ServiceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServiceState::Stable | ServiceState::Failed)
    }
}

impl Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Pending => f.write_str("service is waiting for its dependencies"),
            ServiceState::Scaling => f.write_str("service's node pool is scaling"),
            ServiceState::Stable => f.write_str("service is running at the desired state"),
            ServiceState::Updating => f.write_str("service's workload is rolling out"),
            ServiceState::Deleting => f.write_str("service is being deleted"),
            ServiceState::Failed => f.write_str("service failed"),
        }
    }
}
