use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, ContainerPort as KubeContainerPort, EnvVar, HTTPGetAction, NodeAffinity,
    NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Probe, Toleration,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::definition::component::ContainerDefinition;

use super::{
    crd::v1::container_build::ContainerBuildArtifacts,
    labels::{NODE_POOL_EPOCH_LABEL, NODE_POOL_ID_LABEL},
    ResourceGenerationError,
};

pub mod build_job;
pub mod deployment;
pub mod job_run;

/// Node pool and epoch a workload is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolPlacement {
    pub name: String,
    pub epoch: u64,
}

impl NodePoolPlacement {
    pub fn new(name: &str, epoch: u64) -> Self {
        Self {
            name: name.to_owned(),
            epoch,
        }
    }

    pub fn generate_affinity(&self) -> Affinity {
        Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![NodeSelectorTerm {
                        match_expressions: Some(vec![
                            NodeSelectorRequirement {
                                key: NODE_POOL_ID_LABEL.to_owned(),
                                operator: "In".to_owned(),
                                values: Some(vec![self.name.to_owned()]),
                            },
                            NodeSelectorRequirement {
                                key: NODE_POOL_EPOCH_LABEL.to_owned(),
                                operator: "In".to_owned(),
                                values: Some(vec![self.epoch.to_string()]),
                            },
                        ]),
                        ..Default::default()
                    }],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn generate_tolerations(&self) -> Vec<Toleration> {
        vec![Toleration {
            key: Some(NODE_POOL_ID_LABEL.to_owned()),
            operator: Some("Equal".to_owned()),
            value: Some(self.name.to_owned()),
            effect: Some("NoSchedule".to_owned()),
            ..Default::default()
        }]
    }
}

pub fn generate_env(env: &BTreeMap<String, String>) -> Option<Vec<EnvVar>> {
    if env.is_empty() {
        return None;
    }

    Some(
        env.iter()
            .map(|(name, value)| EnvVar {
                name: name.to_owned(),
                value: Some(value.to_owned()),
                ..Default::default()
            })
            .collect(),
    )
}

/// Turns a container of a definition into a pod container running the built image.
pub fn generate_container(
    name: &str,
    definition: &ContainerDefinition,
    artifacts: &BTreeMap<String, ContainerBuildArtifacts>,
) -> Result<Container, ResourceGenerationError> {
    let image = artifacts
        .get(name)
        .filter(|artifacts| !artifacts.is_empty())
        .ok_or_else(|| ResourceGenerationError::MissingArtifacts(name.to_owned()))?
        .docker_image_fqn
        .to_owned();

    let ports = definition
        .ports
        .iter()
        .map(|(port_name, port)| KubeContainerPort {
            name: Some(port_name.to_owned()),
            container_port: port.port,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        })
        .collect::<Vec<_>>();

    let readiness_probe = match &definition.health_check {
        Some(health_check) => Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some(health_check.path.to_owned()),
                port: IntOrString::String(health_check.port.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        None => None,
    };

    Ok(Container {
        name: name.to_owned(),
        image: Some(image),
        image_pull_policy: Some("IfNotPresent".to_owned()),
        command: definition.command.clone(),
        env: generate_env(&definition.env),
        ports: (!ports.is_empty()).then_some(ports),
        readiness_probe,
        ..Default::default()
    })
}
