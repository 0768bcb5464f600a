use std::{collections::BTreeMap, fmt::Display};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use super::DefinitionError;

pub const MAIN_CONTAINER_NAME: &str = "main";

/// Node of a system definition tree as it's stored in the definition repository.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum ComponentDefinition {
    #[serde(rename = "v1/system")]
    System(SystemDefinition),
    #[serde(rename = "v1/service")]
    Service(ServiceDefinition),
    #[serde(rename = "v1/job")]
    Job(JobDefinition),
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SystemDefinition {
    pub description: Option<String>,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentDefinition>,
    /// node pools shared by the components of this system
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolDefinition>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDefinition {
    pub description: Option<String>,
    pub container: ContainerDefinition,
    #[serde(default)]
    pub sidecars: BTreeMap<String, ContainerDefinition>,
    /// static number of instances, defaults to 1
    pub num_instances: Option<i32>,
    /// node pool dedicated to this service
    pub node_pool: Option<NodePoolDefinition>,
    /// reference to a node pool declared by a system, in the `/path:name` form
    pub shared_node_pool: Option<String>,
}

impl ServiceDefinition {
    pub fn containers(&self) -> impl Iterator<Item = (&str, &ContainerDefinition)> {
        std::iter::once((MAIN_CONTAINER_NAME, &self.container)).chain(
            self.sidecars
                .iter()
                .map(|(name, container)| (name.as_str(), container)),
        )
    }

    pub fn num_instances(&self) -> i32 {
        self.num_instances.unwrap_or(1)
    }

    /// All ports exposed by the main container and its sidecars.
    pub fn ports(&self) -> BTreeMap<i32, ContainerPort> {
        self.containers()
            .flat_map(|(_, container)| container.ports.values())
            .map(|port| (port.port, port.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.node_pool.is_some() && self.shared_node_pool.is_some() {
            return Err(DefinitionError::Invalid(
                "a service can't use both a dedicated and a shared node pool".into(),
            ));
        }

        if let Some(num_instances) = self.num_instances {
            if num_instances < 0 {
                return Err(DefinitionError::Invalid(
                    "numInstances can't be negative".into(),
                ));
            }
        }

        if let Some(node_pool) = &self.node_pool {
            node_pool.validate()?;
        }

        if self.sidecars.contains_key(MAIN_CONTAINER_NAME) {
            return Err(DefinitionError::Invalid(
                format!("sidecar can't be named '{MAIN_CONTAINER_NAME}'").into(),
            ));
        }

        let mut seen_ports = BTreeMap::new();
        for (name, container) in self.containers() {
            container.validate()?;

            for port in container.ports.values() {
                if let Some(other) = seen_ports.insert(port.port, name) {
                    return Err(DefinitionError::Invalid(
                        format!(
                            "port {} is exposed by both '{other}' and '{name}' containers",
                            port.port
                        )
                        .into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobDefinition {
    pub description: Option<String>,
    pub container: ContainerDefinition,
    #[serde(default)]
    pub sidecars: BTreeMap<String, ContainerDefinition>,
    pub node_pool: Option<NodePoolDefinition>,
    pub shared_node_pool: Option<String>,
}

impl JobDefinition {
    pub fn containers(&self) -> impl Iterator<Item = (&str, &ContainerDefinition)> {
        std::iter::once((MAIN_CONTAINER_NAME, &self.container)).chain(
            self.sidecars
                .iter()
                .map(|(name, container)| (name.as_str(), container)),
        )
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.node_pool.is_some() && self.shared_node_pool.is_some() {
            return Err(DefinitionError::Invalid(
                "a job can't use both a dedicated and a shared node pool".into(),
            ));
        }

        if let Some(node_pool) = &self.node_pool {
            node_pool.validate()?;
        }

        for (_, container) in self.containers() {
            container.validate()?;
        }

        Ok(())
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolDefinition {
    pub instance_type: String,
    pub num_instances: Option<i32>,
    pub autoscaling: Option<NodePoolAutoscaling>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolAutoscaling {
    pub min: i32,
    pub max: i32,
}

impl NodePoolDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.instance_type.is_empty() {
            return Err(DefinitionError::Invalid(
                "node pool instanceType can't be empty".into(),
            ));
        }

        match (self.num_instances, self.autoscaling) {
            (Some(num_instances), None) if num_instances >= 0 => Ok(()),
            (None, Some(autoscaling)) if autoscaling.min >= 0 && autoscaling.min <= autoscaling.max => {
                Ok(())
            }
            (None, Some(_)) => Err(DefinitionError::Invalid(
                "node pool autoscaling bounds are inverted".into(),
            )),
            _ => Err(DefinitionError::Invalid(
                "node pool needs exactly one of numInstances or autoscaling".into(),
            )),
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    pub build: ContainerBuildDefinition,
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: BTreeMap<String, ContainerPort>,
    pub health_check: Option<HttpHealthCheck>,
}

impl ContainerDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        self.build.validate()?;

        for (name, port) in &self.ports {
            if !(1..=65535).contains(&port.port) {
                return Err(DefinitionError::Invalid(
                    format!("port '{name}' ({}) is out of range", port.port).into(),
                ));
            }
        }

        if let Some(health_check) = &self.health_check {
            if !self.ports.contains_key(&health_check.port) {
                return Err(DefinitionError::Invalid(
                    format!("health check uses unknown port '{}'", health_check.port).into(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub port: i32,
    #[serde(default)]
    pub protocol: PortProtocol,
    #[serde(default)]
    pub public: bool,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum PortProtocol {
    #[default]
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "TCP")]
    Tcp,
}

impl Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortProtocol::Http => f.write_str("HTTP"),
            PortProtocol::Tcp => f.write_str("TCP"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpHealthCheck {
    pub path: String,
    /// name of the container port to probe
    pub port: String,
}

/// How to produce the image of a container, exactly one of the fields is set.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildDefinition {
    pub docker_image: Option<DockerImage>,
    pub command_build: Option<CommandBuild>,
}

impl ContainerBuildDefinition {
    pub fn validate(&self) -> Result<(), DefinitionError> {
        match (&self.docker_image, &self.command_build) {
            (Some(_), None) => Ok(()),
            (None, Some(build)) if build.command.is_empty() => Err(DefinitionError::Invalid(
                "commandBuild needs at least one command".into(),
            )),
            (None, Some(_)) => Ok(()),
            _ => Err(DefinitionError::Invalid(
                "container build needs exactly one of dockerImage or commandBuild".into(),
            )),
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerImage {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
}

impl Display for DockerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.registry {
            Some(registry) => write!(f, "{registry}/{}:{}", self.repository, self.tag),
            None => write!(f, "{}:{}", self.repository, self.tag),
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandBuild {
    pub base_image: DockerImage,
    pub source: Option<GitRepository>,
    pub command: Vec<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GitRepository {
    pub url: String,
    pub commit: Option<String>,
    pub tag: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_build() -> ContainerBuildDefinition {
        ContainerBuildDefinition {
            docker_image: Some(DockerImage {
                registry: None,
                repository: "library/nginx".to_owned(),
                tag: "1.25".to_owned(),
            }),
            command_build: None,
        }
    }

    fn container(ports: &[(&str, i32)]) -> ContainerDefinition {
        ContainerDefinition {
            build: image_build(),
            ports: ports
                .iter()
                .map(|(name, port)| {
                    (
                        name.to_string(),
                        ContainerPort {
                            port: *port,
                            protocol: PortProtocol::Http,
                            public: false,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn container_build_requires_exactly_one_source() {
        assert!(image_build().validate().is_ok());
        assert!(ContainerBuildDefinition::default().validate().is_err());

        let both = ContainerBuildDefinition {
            command_build: Some(CommandBuild {
                base_image: DockerImage::default(),
                source: None,
                command: vec!["make".to_owned()],
            }),
            ..image_build()
        };
        assert!(both.validate().is_err());
    }

    #[test]
    fn service_rejects_ports_shared_between_containers() {
        let service = ServiceDefinition {
            container: container(&[("http", 8080)]),
            sidecars: BTreeMap::from([("proxy".to_owned(), container(&[("admin", 8080)]))]),
            ..Default::default()
        };

        assert!(service.validate().is_err());
    }

    #[test]
    fn service_collects_ports_of_all_containers() {
        let service = ServiceDefinition {
            container: container(&[("http", 8080)]),
            sidecars: BTreeMap::from([("metrics".to_owned(), container(&[("prom", 9090)]))]),
            ..Default::default()
        };

        assert!(service.validate().is_ok());
        assert_eq!(
            service.ports().keys().copied().collect::<Vec<_>>(),
            vec![8080, 9090]
        );
        assert_eq!(service.num_instances(), 1);
    }

    #[test]
    fn node_pool_needs_a_single_sizing_mode() {
        let mut pool = NodePoolDefinition {
            instance_type: "m5.large".to_owned(),
            num_instances: Some(2),
            autoscaling: None,
        };
        assert!(pool.validate().is_ok());

        pool.autoscaling = Some(NodePoolAutoscaling { min: 1, max: 3 });
        assert!(pool.validate().is_err());

        pool.num_instances = None;
        assert!(pool.validate().is_ok());

        pool.autoscaling = Some(NodePoolAutoscaling { min: 4, max: 3 });
        assert!(pool.validate().is_err());
    }

    #[test]
    fn component_definitions_are_tagged_by_type() {
        let raw = r#"{
            "type": "v1/system",
            "components": {
                "api": {
                    "type": "v1/service",
                    "container": {
                        "build": { "dockerImage": { "repository": "api", "tag": "v1" } },
                        "ports": { "http": { "port": 8080, "public": true } }
                    }
                }
            }
        }"#;

        let component: ComponentDefinition = serde_json::from_str(raw).unwrap();
        let ComponentDefinition::System(system) = component else {
            panic!("expected a system");
        };
        let Some(ComponentDefinition::Service(service)) = system.components.get("api") else {
            panic!("expected a service");
        };

        assert_eq!(service.container.ports["http"].protocol, PortProtocol::Http);
        assert!(service.container.ports["http"].public);
    }
}
