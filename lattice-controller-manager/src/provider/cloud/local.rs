use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::DeploymentSpec,
    core::v1::{
        ConfigMap, HostPathVolumeSource, PodDNSConfig, PodSpec, Service as KubeService, Volume,
    },
};
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Client, ResourceExt,
};
use lattice_core::{
    kubernetes::{
        operations::{apply_resource, create_or_get_resource, try_get_resource, try_remove_resource},
        GetApi,
    },
    resources::{
        crd::v1::{
            address::Address,
            config::LocalCloudProviderConfig,
            node_pool::{NodePool, NodePoolSpec},
        },
        meta::get_load_balancer_name,
        workload::build_job::WORK_DIRECTORY_VOLUME_NAME,
    },
    FIELD_MANAGER,
};
use log::debug;
use serde_json::json;

use crate::{
    config::ConfigStore,
    provider::{ProviderError, RetryAfter, SpecComparison},
};

use super::{
    generate_load_balancer_service, get_address_dns_name, CloudProvider, LoadBalancerRequest,
    NodePoolProvisioning,
};

pub const LOCAL_DNS_CONFIGMAP_NAME: &str = "lattice-local-dns";
pub const LOCAL_WORK_DIRECTORY_ROOT: &str = "/data/component-builder";

const LOCAL_DNS_POLICY: &str = "None";
const LOCAL_DNS_SEARCHES: [&str; 2] = ["svc.cluster.local", "cluster.local"];

/// Cloud provider for single machine clusters: no node groups, NodePort load
/// balancers and a ConfigMap the local DNS server reads its records from.
pub struct LocalCloudProvider {
    client: Client,
    config_store: Arc<ConfigStore>,
    internal_namespace: String,
}

impl LocalCloudProvider {
    pub fn new(client: Client, config_store: Arc<ConfigStore>, internal_namespace: &str) -> Self {
        Self {
            client,
            config_store,
            internal_namespace: internal_namespace.to_owned(),
        }
    }

    async fn config(&self) -> Result<LocalCloudProviderConfig, ProviderError> {
        self.config_store
            .current()
            .await?
            .cloud_provider
            .local
            .clone()
            .ok_or(ProviderError::Misconfigured(
                "local cloud provider isn't configured".into(),
            ))
    }

    async fn ensure_dns_configmap(&self) -> Result<ConfigMap, ProviderError> {
        let configmap = ConfigMap {
            metadata: ObjectMeta {
                name: Some(LOCAL_DNS_CONFIGMAP_NAME.to_owned()),
                namespace: Some(self.internal_namespace.to_owned()),
                ..Default::default()
            },
            ..Default::default()
        };

        Ok(create_or_get_resource(&self.client, &configmap).await?)
    }

    async fn patch_dns_record(&self, record: &str, ip: Option<&str>) -> Result<(), ProviderError> {
        let patch = json!({
            "data": {
                record: ip,
            }
        });

        self.client
            .namespaced_api::<ConfigMap>(&self.internal_namespace)
            .patch(
                LOCAL_DNS_CONFIGMAP_NAME,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl CloudProvider for LocalCloudProvider {
    async fn transform_deployment_spec(
        &self,
        spec: DeploymentSpec,
    ) -> Result<DeploymentSpec, ProviderError> {
        let config = self.config().await?;

        Ok(transform_local_spec(spec, &config.ip))
    }

    async fn is_deployment_spec_updated(
        &self,
        current: &DeploymentSpec,
        desired: &DeploymentSpec,
        untransformed: &DeploymentSpec,
    ) -> Result<SpecComparison, ProviderError> {
        Ok(compare_local_spec(current, desired, untransformed))
    }

    async fn ensure_load_balancer(
        &self,
        address: &Address,
        request: &LoadBalancerRequest,
    ) -> Result<Option<BTreeMap<String, String>>, ProviderError> {
        let config = self.config().await?;
        let service =
            generate_load_balancer_service(address, request, "NodePort", BTreeMap::new())?;
        let service = apply_resource(
            &self.client,
            &service,
            &PatchParams::apply(FIELD_MANAGER).force(),
        )
        .await?;

        Ok(get_node_port_addresses(&service, &config.ip))
    }

    async fn destroy_load_balancer(&self, address: &Address) -> Result<(), ProviderError> {
        try_remove_resource::<KubeService>(
            &self.client,
            &get_load_balancer_name(&address.name_any()),
            &address.namespace().unwrap_or_default(),
            &DeleteParams::default(),
        )
        .await?;

        Ok(())
    }

    async fn ensure_dns_record(&self, address: &Address, ip: &str) -> Result<(), ProviderError> {
        let record = get_address_dns_name(address);
        let configmap = self.ensure_dns_configmap().await?;

        if get_dns_record(&configmap, &record) == Some(ip) {
            return Ok(());
        }

        debug!("Pointing '{record}' local DNS record at {ip}...");

        self.patch_dns_record(&record, Some(ip)).await
    }

    async fn destroy_dns_record(&self, address: &Address) -> Result<(), ProviderError> {
        let record = get_address_dns_name(address);
        let configmap = try_get_resource::<ConfigMap>(
            &self.client,
            LOCAL_DNS_CONFIGMAP_NAME,
            &self.internal_namespace,
        )
        .await?;

        match configmap {
            Some(configmap) if get_dns_record(&configmap, &record).is_some() => {
                self.patch_dns_record(&record, None).await
            }
            _ => Ok(()),
        }
    }

    async fn provision_node_pool(
        &self,
        _node_pool: &NodePool,
        _epoch: u64,
        _spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError> {
        Ok(NodePoolProvisioning::stable())
    }

    async fn deprovision_node_pool(
        &self,
        _node_pool: &NodePool,
        _epoch: u64,
    ) -> Result<RetryAfter, ProviderError> {
        Ok(None)
    }

    async fn node_pool_state(
        &self,
        _node_pool: &NodePool,
        _epoch: u64,
        _spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError> {
        Ok(NodePoolProvisioning::stable())
    }

    async fn build_work_directory(&self, job_name: &str) -> Result<Volume, ProviderError> {
        Ok(Volume {
            name: WORK_DIRECTORY_VOLUME_NAME.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: format!("{LOCAL_WORK_DIRECTORY_ROOT}/{job_name}"),
                type_: Some("DirectoryOrCreate".to_owned()),
            }),
            ..Default::default()
        })
    }
}

/// Every workload resolves names through the local DNS server first and
/// may run on the only node there is.
fn transform_local_spec(mut spec: DeploymentSpec, dns_ip: &str) -> DeploymentSpec {
    if let Some(pod_spec) = spec.template.spec.as_mut() {
        pod_spec.affinity = None;
        pod_spec.tolerations = None;
        pod_spec.dns_policy = Some(LOCAL_DNS_POLICY.to_owned());
        pod_spec.dns_config = Some(PodDNSConfig {
            nameservers: Some(vec![dns_ip.to_owned()]),
            searches: Some(LOCAL_DNS_SEARCHES.iter().map(|s| s.to_string()).collect()),
            options: None,
        });
    }

    spec
}

fn compare_local_spec(
    current: &DeploymentSpec,
    desired: &DeploymentSpec,
    untransformed: &DeploymentSpec,
) -> SpecComparison {
    let current_pod = current.template.spec.as_ref();
    let desired_pod = desired.template.spec.as_ref();
    let dns_nameservers = |pod: Option<&PodSpec>| {
        pod.and_then(|pod| pod.dns_config.as_ref())
            .and_then(|dns| dns.nameservers.clone())
            .unwrap_or_default()
    };
    let dns_policy = |pod: Option<&PodSpec>| {
        pod.and_then(|pod| pod.dns_policy.clone())
    };

    let mut spec = current.clone();
    let untransformed_pod = untransformed.template.spec.as_ref();

    if let Some(pod_spec) = spec.template.spec.as_mut() {
        pod_spec.affinity = untransformed_pod.and_then(|pod| pod.affinity.clone());
        pod_spec.tolerations = untransformed_pod.and_then(|pod| pod.tolerations.clone());
        pod_spec.dns_policy = dns_policy(untransformed_pod);
        pod_spec.dns_config = untransformed_pod.and_then(|pod| pod.dns_config.clone());
    }

    if dns_policy(current_pod) != dns_policy(desired_pod) {
        return SpecComparison::outdated("DNS policy differs", spec);
    }

    if dns_nameservers(current_pod) != dns_nameservers(desired_pod) {
        return SpecComparison::outdated("DNS nameservers differ", spec);
    }

    SpecComparison::up_to_date(spec)
}

fn get_node_port_addresses(service: &KubeService, ip: &str) -> Option<BTreeMap<String, String>> {
    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .map(|port| {
            Some((
                port.name.clone().unwrap_or_else(|| port.port.to_string()),
                format!("{ip}:{}", port.node_port?),
            ))
        })
        .collect()
}

fn get_dns_record<'a>(configmap: &'a ConfigMap, record: &str) -> Option<&'a str> {
    configmap.data.as_ref()?.get(record).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        Affinity, ServicePort as KubeServicePort, ServiceSpec as KubeServiceSpec,
        Toleration,
    };

    use super::*;

    fn pinned_spec() -> DeploymentSpec {
        let mut spec = DeploymentSpec::default();
        spec.template.spec = Some(PodSpec {
            affinity: Some(Affinity::default()),
            tolerations: Some(vec![Toleration::default()]),
            ..Default::default()
        });

        spec
    }

    #[test]
    fn transform_strips_placement_and_points_dns_at_local_server() {
        let spec = transform_local_spec(pinned_spec(), "172.17.0.1");
        let pod = spec.template.spec.unwrap();

        assert!(pod.affinity.is_none());
        assert!(pod.tolerations.is_none());
        assert_eq!(pod.dns_policy.as_deref(), Some("None"));
        assert_eq!(
            pod.dns_config.unwrap().nameservers,
            Some(vec!["172.17.0.1".to_owned()])
        );
    }

    #[test]
    fn comparison_restores_untransformed_placement() {
        let untransformed = pinned_spec();
        let desired = transform_local_spec(untransformed.clone(), "172.17.0.1");
        let comparison = compare_local_spec(&desired, &desired, &untransformed);

        assert!(comparison.up_to_date);
        assert_eq!(comparison.spec, untransformed);
    }

    #[test]
    fn changed_dns_server_is_outdated() {
        let untransformed = pinned_spec();
        let current = transform_local_spec(untransformed.clone(), "172.17.0.1");
        let desired = transform_local_spec(untransformed.clone(), "172.17.0.2");
        let comparison = compare_local_spec(&current, &desired, &untransformed);

        assert!(!comparison.up_to_date);
        assert!(comparison.reason.is_some());
    }

    #[test]
    fn node_ports_are_published_once_assigned() {
        let mut service = KubeService {
            spec: Some(KubeServiceSpec {
                ports: Some(vec![KubeServicePort {
                    name: Some("http".to_owned()),
                    port: 80,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(get_node_port_addresses(&service, "172.17.0.1"), None);

        if let Some(ports) = service.spec.as_mut().and_then(|spec| spec.ports.as_mut()) {
            ports[0].node_port = Some(31080);
        }

        assert_eq!(
            get_node_port_addresses(&service, "172.17.0.1"),
            Some(BTreeMap::from([(
                "http".to_owned(),
                "172.17.0.1:31080".to_owned()
            )]))
        );
    }
}
