use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{Service as KubeService, ServicePort as KubeServicePort, ServiceSpec as KubeServiceSpec, Volume},
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
use kube::{core::ObjectMeta, Resource, ResourceExt};
use lattice_core::{
    helpers::RequireMetadata,
    resources::{
        crd::v1::{
            address::Address,
            node_pool::{NodePool, NodePoolSpec, NodePoolState},
        },
        meta::get_load_balancer_name,
    },
};

use super::{ProviderError, RetryAfter, SpecComparison};

pub mod aws;
pub mod local;

/// Port exposed through a load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerPort {
    pub name: String,
    /// port the load balancer listens on
    pub port: i32,
    /// port on the workload the traffic is sent to
    pub target_port: i32,
}

/// Load balancer fronting the workload of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerRequest {
    pub selector: BTreeMap<String, String>,
    pub ports: Vec<LoadBalancerPort>,
}

/// Observed shape of a node pool epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolProvisioning {
    pub state: NodePoolState,
    pub message: Option<String>,
    pub retry_after: RetryAfter,
}

impl NodePoolProvisioning {
    pub fn stable() -> Self {
        Self {
            state: NodePoolState::Stable,
            message: None,
            retry_after: None,
        }
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Applies the provider's changes to a workload that's about to be created or updated.
    async fn transform_deployment_spec(
        &self,
        spec: DeploymentSpec,
    ) -> Result<DeploymentSpec, ProviderError>;

    /// Checks the provider's own changes on the live spec against the desired
    /// ones, then undoes them so the remaining comparison can work on `untransformed`.
    async fn is_deployment_spec_updated(
        &self,
        current: &DeploymentSpec,
        desired: &DeploymentSpec,
        untransformed: &DeploymentSpec,
    ) -> Result<SpecComparison, ProviderError>;

    /// Returns the external address of every port, or `None` while the load balancer isn't ready.
    async fn ensure_load_balancer(
        &self,
        address: &Address,
        request: &LoadBalancerRequest,
    ) -> Result<Option<BTreeMap<String, String>>, ProviderError>;

    async fn destroy_load_balancer(&self, address: &Address) -> Result<(), ProviderError>;

    async fn ensure_dns_record(&self, address: &Address, ip: &str) -> Result<(), ProviderError>;

    async fn destroy_dns_record(&self, address: &Address) -> Result<(), ProviderError>;

    async fn provision_node_pool(
        &self,
        node_pool: &NodePool,
        epoch: u64,
        spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError>;

    /// Returns a requeue hint while the epoch's nodes are still going away.
    async fn deprovision_node_pool(
        &self,
        node_pool: &NodePool,
        epoch: u64,
    ) -> Result<RetryAfter, ProviderError>;

    async fn node_pool_state(
        &self,
        node_pool: &NodePool,
        epoch: u64,
        spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError>;

    /// Volume the container builder uses as its work directory.
    async fn build_work_directory(&self, job_name: &str) -> Result<Volume, ProviderError>;
}

/// DNS name an address is published under, `<address>.<namespace>`.
pub fn get_address_dns_name(address: &Address) -> String {
    format!(
        "{}.{}",
        address.name_any(),
        address.namespace().unwrap_or_default()
    )
}

/// Kubernetes Service exposing the workload of an address outside of the cluster.
pub fn generate_load_balancer_service(
    address: &Address,
    request: &LoadBalancerRequest,
    service_type: &str,
    annotations: BTreeMap<String, String>,
) -> Result<KubeService, ProviderError> {
    let name = address
        .require_name_or(ProviderError::MissingData("address name".into()))?;
    let namespace = address
        .require_namespace_or(ProviderError::MissingData("address namespace".into()))?;
    let owner_reference = address
        .controller_owner_ref(&())
        .ok_or(ProviderError::MissingData("address uid".into()))?;
    let ports = request
        .ports
        .iter()
        .map(|port| KubeServicePort {
            name: Some(port.name.to_owned()),
            port: port.port,
            target_port: Some(IntOrString::Int(port.target_port)),
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        })
        .collect();

    Ok(KubeService {
        metadata: ObjectMeta {
            name: Some(get_load_balancer_name(name)),
            namespace: Some(namespace.to_owned()),
            labels: Some(address.labels().clone()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: Some(KubeServiceSpec {
            type_: Some(service_type.to_owned()),
            selector: Some(request.selector.clone()),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use lattice_core::{definition::path::TreePath, resources::crd::v1::address::AddressSpec};

    pub(crate) fn address() -> Address {
        let mut address = Address::new(
            "b.a",
            AddressSpec {
                service: TreePath::new("/a/b").unwrap(),
            },
        );
        address.metadata.namespace = Some("lattice-system-shop".to_owned());
        address.metadata.uid = Some("3f0c7d2e".to_owned());

        address
    }

    pub(crate) fn request() -> LoadBalancerRequest {
        LoadBalancerRequest {
            selector: BTreeMap::from([("service.lattice.dev/path".to_owned(), "b.a".to_owned())]),
            ports: vec![LoadBalancerPort {
                name: "http".to_owned(),
                port: 80,
                target_port: 10000,
            }],
        }
    }

    #[test]
    fn dns_name_appends_the_namespace() {
        assert_eq!(get_address_dns_name(&address()), "b.a.lattice-system-shop");
    }

    #[test]
    fn load_balancer_service_targets_the_workload() {
        let service =
            generate_load_balancer_service(&address(), &request(), "NodePort", BTreeMap::new())
                .unwrap();
        let spec = service.spec.unwrap();
        let port = &spec.ports.unwrap()[0];

        assert_eq!(service.metadata.name.as_deref(), Some("lattice-lb-b-a"));
        assert_eq!(spec.type_.as_deref(), Some("NodePort"));
        assert_eq!(port.target_port, Some(IntOrString::Int(10000)));
        assert!(service.metadata.annotations.is_none());
        assert_eq!(
            service.metadata.owner_references.unwrap()[0].uid,
            "3f0c7d2e"
        );
    }
}
