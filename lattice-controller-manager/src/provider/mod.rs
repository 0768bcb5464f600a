use std::{borrow::Cow, net::Ipv4Addr, sync::Arc, time::Duration};

use k8s_openapi::api::apps::v1::DeploymentSpec;
use kube::Client;
use lattice_core::{
    ip::lease::LeaseError,
    resources::crd::v1::config::{
        ConfigError, ConfigSpec, CLOUD_PROVIDER_AWS, CLOUD_PROVIDER_LOCAL,
        NETWORKING_PROVIDER_FLANNEL, NETWORKING_PROVIDER_NONE, SERVICE_MESH_ENVOY,
    },
};
use log::info;
use thiserror::Error;

use crate::config::{ConfigStore, ConfigStoreError};

use self::{
    cloud::{aws::AwsCloudProvider, local::LocalCloudProvider, CloudProvider},
    mesh::{envoy::EnvoyServiceMesh, ServiceMesh},
    networking::{flannel::FlannelNetworkingProvider, none::NoneNetworkingProvider, NetworkingProvider},
    resolver::ComponentResolver,
};

pub mod cloud;
pub mod mesh;
pub mod networking;
pub mod resolver;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider '{}' is not supported!", .0)]
    UnknownKind(String),
    #[error("Provider is misconfigured! {}", .0)]
    Misconfigured(Cow<'static, str>),
    #[error("Provider rejected the request! {}", .0)]
    Rejected(Cow<'static, str>),
    #[error("Provider is missing required data ({})!", .0)]
    MissingData(Cow<'static, str>),
    #[error("Provider couldn't reach the kubernetes API! {}", .0)]
    KubeApiError(#[from] kube::Error),
    #[error("Provider couldn't read the config! {}", .0)]
    Config(#[from] ConfigStoreError),
    #[error("Provider couldn't (de)serialize data! {}", .0)]
    Serialization(#[from] serde_json::Error),
    #[error("Provider couldn't lease an address! {}", .0)]
    AddressLease(#[from] LeaseError<Ipv4Addr>),
}

impl ProviderError {
    /// Terminal errors won't go away by retrying, a human has to step in.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProviderError::Rejected(_) | ProviderError::UnknownKind(_) | ProviderError::Misconfigured(_)
        )
    }
}

impl From<ConfigError> for ProviderError {
    fn from(value: ConfigError) -> Self {
        ProviderError::Misconfigured(value.to_string().into())
    }
}

/// Result of comparing a live deployment spec with the desired one.
/// `spec` is the live spec with the comparing provider's own changes undone,
/// so the next comparison in the chain sees a spec without them.
#[derive(Debug, Clone)]
pub struct SpecComparison {
    pub up_to_date: bool,
    pub reason: Option<String>,
    pub spec: DeploymentSpec,
}

impl SpecComparison {
    pub fn up_to_date(spec: DeploymentSpec) -> Self {
        Self {
            up_to_date: true,
            reason: None,
            spec,
        }
    }

    pub fn outdated(reason: impl Into<String>, spec: DeploymentSpec) -> Self {
        Self {
            up_to_date: false,
            reason: Some(reason.into()),
            spec,
        }
    }
}

/// Requeue hint returned by long running provider operations.
pub type RetryAfter = Option<Duration>;

/// Provider implementations picked for the observed config.
#[derive(Clone)]
pub struct Providers {
    pub cloud: Arc<dyn CloudProvider>,
    pub mesh: Arc<dyn ServiceMesh>,
    pub resolver: Arc<dyn ComponentResolver>,
}

impl Providers {
    pub fn from_config(
        client: &Client,
        config: &ConfigSpec,
        config_store: Arc<ConfigStore>,
        internal_namespace: &str,
        resolver: Arc<dyn ComponentResolver>,
    ) -> Result<Self, ProviderError> {
        let cloud_kind = config.cloud_provider.kind()?;
        let mesh_kind = config.service_mesh.kind()?;

        info!("Using '{cloud_kind}' cloud provider and '{mesh_kind}' service mesh...");

        Ok(Self {
            cloud: get_cloud_provider(cloud_kind, client, config_store.clone(), internal_namespace)?,
            mesh: get_service_mesh(mesh_kind, client, config_store)?,
            resolver,
        })
    }
}

pub fn get_cloud_provider(
    kind: &str,
    client: &Client,
    config_store: Arc<ConfigStore>,
    internal_namespace: &str,
) -> Result<Arc<dyn CloudProvider>, ProviderError> {
    match kind {
        CLOUD_PROVIDER_LOCAL => Ok(Arc::new(LocalCloudProvider::new(
            client.clone(),
            config_store,
            internal_namespace,
        ))),
        CLOUD_PROVIDER_AWS => Ok(Arc::new(AwsCloudProvider::new(
            client.clone(),
            config_store,
            internal_namespace,
        ))),
        other => Err(ProviderError::UnknownKind(other.to_owned())),
    }
}

pub fn get_service_mesh(
    kind: &str,
    client: &Client,
    config_store: Arc<ConfigStore>,
) -> Result<Arc<dyn ServiceMesh>, ProviderError> {
    match kind {
        SERVICE_MESH_ENVOY => Ok(Arc::new(EnvoyServiceMesh::new(client.clone(), config_store))),
        other => Err(ProviderError::UnknownKind(other.to_owned())),
    }
}

pub fn get_networking_provider(kind: &str) -> Result<Arc<dyn NetworkingProvider>, ProviderError> {
    match kind {
        NETWORKING_PROVIDER_FLANNEL => Ok(Arc::new(FlannelNetworkingProvider)),
        NETWORKING_PROVIDER_NONE => Ok(Arc::new(NoneNetworkingProvider)),
        other => Err(ProviderError::UnknownKind(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_networking_provider_is_rejected() {
        assert!(get_networking_provider(NETWORKING_PROVIDER_NONE).is_ok());
        assert!(matches!(
            get_networking_provider("calico"),
            Err(ProviderError::UnknownKind(kind)) if kind == "calico"
        ));
    }

    #[test]
    fn rejections_are_terminal() {
        assert!(ProviderError::Rejected("bad instance type".into()).is_terminal());
        assert!(!ProviderError::MissingData("load balancer".into()).is_terminal());
    }
}
