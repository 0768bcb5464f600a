use ipnet::Ipv4Net;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use thiserror::Error;

pub const SERVICE_MESH_ENVOY: &str = "envoy";
pub const CLOUD_PROVIDER_LOCAL: &str = "local";
pub const CLOUD_PROVIDER_AWS: &str = "aws";
pub const NETWORKING_PROVIDER_FLANNEL: &str = "flannel";
pub const NETWORKING_PROVIDER_NONE: &str = "none";
pub const TERRAFORM_BACKEND_S3: &str = "s3";
pub const TERRAFORM_BACKEND_NONE: &str = "none";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("No {} is configured!", .0)]
    MissingKind(&'static str),
    #[error("More than one {} is configured!", .0)]
    AmbiguousKind(&'static str),
}

/// Lattice-wide configuration, a single instance is watched by the controller manager.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Config",
    namespaced,
    derive = "Default",
    derive = "PartialEq"
)]
pub struct ConfigSpec {
    pub component_build: ComponentBuildConfig,
    pub service_mesh: ServiceMeshConfig,
    pub cloud_provider: CloudProviderConfig,
    #[serde(default)]
    pub networking_provider: NetworkingProviderConfig,
    pub terraform: Option<TerraformConfig>,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentBuildConfig {
    pub builder: BuilderConfig,
    pub artifact: DockerArtifactConfig,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuilderConfig {
    pub image: String,
    /// docker API version of the build nodes' daemons
    pub docker_api_version: String,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DockerArtifactConfig {
    /// registry used to tag images
    pub registry: String,
    /// if true every image gets its own repository, otherwise images share
    /// `repository` and are told apart by their tags
    #[serde(default)]
    pub repository_per_image: bool,
    pub repository: Option<String>,
    #[serde(default)]
    pub push: bool,
    /// selects how the builder authenticates against the registry
    pub registry_auth_type: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMeshConfig {
    pub envoy: Option<EnvoyConfig>,
}

impl ServiceMeshConfig {
    pub fn kind(&self) -> Result<&'static str, ConfigError> {
        match &self.envoy {
            Some(_) => Ok(SERVICE_MESH_ENVOY),
            None => Err(ConfigError::MissingKind("service mesh")),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvoyConfig {
    pub prepare_image: String,
    pub image: String,
    /// traffic to this block is redirected into the proxy
    pub redirect_cidr_block: Ipv4Net,
    pub xds_api_image: String,
    pub xds_api_port: i32,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CloudProviderConfig {
    pub local: Option<LocalCloudProviderConfig>,
    pub aws: Option<AwsCloudProviderConfig>,
}

impl CloudProviderConfig {
    pub fn kind(&self) -> Result<&'static str, ConfigError> {
        match (&self.local, &self.aws) {
            (Some(_), None) => Ok(CLOUD_PROVIDER_LOCAL),
            (None, Some(_)) => Ok(CLOUD_PROVIDER_AWS),
            (None, None) => Err(ConfigError::MissingKind("cloud provider")),
            _ => Err(ConfigError::AmbiguousKind("cloud provider")),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalCloudProviderConfig {
    /// address of the local DNS server
    pub ip: String,
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AwsCloudProviderConfig {
    pub region: String,
    pub account_id: String,
    pub vpc_id: String,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    pub master_node_security_group_id: String,
    pub base_node_ami_id: String,
    pub key_name: String,
    /// hosted zone the public records are created in
    pub dns_zone: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingProviderConfig {
    pub flannel: Option<FlannelConfig>,
}

impl NetworkingProviderConfig {
    pub fn kind(&self) -> &'static str {
        match &self.flannel {
            Some(_) => NETWORKING_PROVIDER_FLANNEL,
            None => NETWORKING_PROVIDER_NONE,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlannelConfig {
    pub network_cidr_block: Ipv4Net,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformConfig {
    #[serde(default)]
    pub backend: TerraformBackendConfig,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformBackendConfig {
    pub s3: Option<TerraformS3BackendConfig>,
}

impl TerraformBackendConfig {
    pub fn kind(&self) -> &'static str {
        match &self.s3 {
            Some(_) => TERRAFORM_BACKEND_S3,
            None => TERRAFORM_BACKEND_NONE,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformS3BackendConfig {
    pub bucket: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloud_provider_kind_requires_exactly_one_provider() {
        let mut config = CloudProviderConfig::default();
        assert_eq!(
            config.kind(),
            Err(ConfigError::MissingKind("cloud provider"))
        );

        config.local = Some(LocalCloudProviderConfig {
            ip: "172.16.0.1".to_owned(),
        });
        assert_eq!(config.kind(), Ok(CLOUD_PROVIDER_LOCAL));

        config.aws = Some(AwsCloudProviderConfig::default());
        assert_eq!(
            config.kind(),
            Err(ConfigError::AmbiguousKind("cloud provider"))
        );
    }

    #[test]
    fn optional_providers_default_to_none() {
        assert_eq!(
            NetworkingProviderConfig::default().kind(),
            NETWORKING_PROVIDER_NONE
        );
        assert_eq!(
            TerraformBackendConfig::default().kind(),
            TERRAFORM_BACKEND_NONE
        );
    }

    #[test]
    fn spec_deserializes_from_camel_case() {
        let raw = r#"{
            "componentBuild": {
                "builder": { "image": "lattice/builder:1", "dockerApiVersion": "1.41" },
                "artifact": { "registry": "registry.local", "repositoryPerImage": true }
            },
            "serviceMesh": {
                "envoy": {
                    "prepareImage": "lattice/prepare-envoy:1",
                    "image": "envoyproxy/envoy:v1.27",
                    "redirectCidrBlock": "172.16.0.0/16",
                    "xdsApiImage": "lattice/xds-api:1",
                    "xdsApiPort": 8080
                }
            },
            "cloudProvider": { "local": { "ip": "172.17.0.1" } }
        }"#;

        let spec: ConfigSpec = serde_json::from_str(raw).unwrap();

        assert_eq!(spec.service_mesh.kind(), Ok(SERVICE_MESH_ENVOY));
        assert!(spec.component_build.artifact.repository_per_image);
        assert!(!spec.component_build.artifact.push);
        assert_eq!(spec.networking_provider.kind(), NETWORKING_PROVIDER_NONE);
    }
}
