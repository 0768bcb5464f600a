use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::DeploymentSpec,
    core::v1::{ConfigMap, EmptyDirVolumeSource, Node, Service as KubeService, Volume},
};
use kube::{
    api::{DeleteParams, Patch, PatchParams},
    core::ObjectMeta,
    Client, ResourceExt,
};
use lattice_core::{
    helpers::RequireMetadata,
    kubernetes::{
        is_not_found,
        operations::{apply_resource, try_remove_resource},
        GetApi,
    },
    resources::{
        crd::v1::{
            address::Address,
            config::{AwsCloudProviderConfig, ConfigSpec},
            node_pool::{NodePool, NodePoolSpec, NodePoolState},
        },
        labels::{get_node_pool_epoch_listparams, get_node_pool_labels, MANAGED_BY_LABEL, MANAGED_BY_VALUE},
        meta::{get_load_balancer_name, get_node_pool_id},
        workload::build_job::WORK_DIRECTORY_VOLUME_NAME,
    },
    FIELD_MANAGER,
};
use log::debug;
use regex::Regex;
use serde_json::json;

use crate::{
    config::ConfigStore,
    provider::{ProviderError, RetryAfter, SpecComparison},
};

use super::{
    generate_load_balancer_service, get_address_dns_name, CloudProvider, LoadBalancerRequest,
    NodePoolProvisioning,
};

pub const LOAD_BALANCER_TYPE_ANNOTATION: &str = "service.beta.kubernetes.io/aws-load-balancer-type";
pub const EXTERNAL_DNS_HOSTNAME_ANNOTATION: &str = "external-dns.alpha.kubernetes.io/hostname";

const INSTANCE_TYPE_PATTERN: &str = "^[a-z][a-z0-9-]*[0-9][a-z0-9-]*\\.[0-9]*[a-z][a-z0-9]*$";
const NODE_POOL_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Cloud provider for EKS clusters. Node groups are described by desired
/// state ConfigMaps picked up by the terraform runner, DNS is delegated to
/// external-dns.
pub struct AwsCloudProvider {
    client: Client,
    config_store: Arc<ConfigStore>,
    internal_namespace: String,
}

impl AwsCloudProvider {
    pub fn new(client: Client, config_store: Arc<ConfigStore>, internal_namespace: &str) -> Self {
        Self {
            client,
            config_store,
            internal_namespace: internal_namespace.to_owned(),
        }
    }

    async fn config(&self) -> Result<(Arc<ConfigSpec>, AwsCloudProviderConfig), ProviderError> {
        let config = self.config_store.current().await?;
        let aws = config
            .cloud_provider
            .aws
            .clone()
            .ok_or(ProviderError::Misconfigured(
                "aws cloud provider isn't configured".into(),
            ))?;

        Ok((config, aws))
    }

    async fn patch_load_balancer_annotation(
        &self,
        address: &Address,
        value: Option<&str>,
    ) -> Result<(), ProviderError> {
        let patch = json!({
            "metadata": {
                "annotations": {
                    EXTERNAL_DNS_HOSTNAME_ANNOTATION: value,
                }
            }
        });

        self.client
            .namespaced_api::<KubeService>(&address.namespace().unwrap_or_default())
            .patch(
                &get_load_balancer_name(&address.name_any()),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;

        Ok(())
    }

    async fn count_ready_nodes(&self, node_pool_id: &str, epoch: u64) -> Result<(usize, usize), ProviderError> {
        let nodes = self
            .client
            .global_api::<Node>()
            .list(&get_node_pool_epoch_listparams(node_pool_id, epoch))
            .await?
            .items;
        let ready = nodes.iter().filter(|node| is_node_ready(node)).count();

        Ok((ready, nodes.len()))
    }
}

#[async_trait]
impl CloudProvider for AwsCloudProvider {
    async fn transform_deployment_spec(
        &self,
        spec: DeploymentSpec,
    ) -> Result<DeploymentSpec, ProviderError> {
        Ok(spec)
    }

    async fn is_deployment_spec_updated(
        &self,
        current: &DeploymentSpec,
        _desired: &DeploymentSpec,
        _untransformed: &DeploymentSpec,
    ) -> Result<SpecComparison, ProviderError> {
        Ok(SpecComparison::up_to_date(current.clone()))
    }

    async fn ensure_load_balancer(
        &self,
        address: &Address,
        request: &LoadBalancerRequest,
    ) -> Result<Option<BTreeMap<String, String>>, ProviderError> {
        let annotations = BTreeMap::from([(
            LOAD_BALANCER_TYPE_ANNOTATION.to_owned(),
            "nlb".to_owned(),
        )]);
        let service =
            generate_load_balancer_service(address, request, "LoadBalancer", annotations)?;
        let service = apply_resource(
            &self.client,
            &service,
            &PatchParams::apply(FIELD_MANAGER).force(),
        )
        .await?;

        Ok(get_load_balancer_addresses(&service))
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

    async fn ensure_dns_record(&self, address: &Address, _ip: &str) -> Result<(), ProviderError> {
        let (_, config) = self.config().await?;
        let Some(zone) = config.dns_zone else {
            debug!("No DNS zone configured, skipping the record of '{}'...", address.name_any());
            return Ok(());
        };
        let hostname = format!("{}.{zone}", get_address_dns_name(address));

        match self.patch_load_balancer_annotation(address, Some(&hostname)).await {
            Err(ProviderError::KubeApiError(error)) if is_not_found(&error) => Err(
                ProviderError::MissingData("load balancer the DNS record points at".into()),
            ),
            result => result,
        }
    }

    async fn destroy_dns_record(&self, address: &Address) -> Result<(), ProviderError> {
        match self.patch_load_balancer_annotation(address, None).await {
            Err(ProviderError::KubeApiError(error)) if is_not_found(&error) => Ok(()),
            result => result,
        }
    }

    async fn provision_node_pool(
        &self,
        node_pool: &NodePool,
        epoch: u64,
        spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError> {
        validate_instance_type(&spec.instance_type)?;

        let (config, aws) = self.config().await?;
        let node_pool_id = get_node_pool_id(
            node_pool.require_namespace_or(ProviderError::MissingData("node pool namespace".into()))?,
            node_pool.require_name_or(ProviderError::MissingData("node pool name".into()))?,
        );
        let desired_state = generate_node_group_configmap(
            &self.internal_namespace,
            &node_pool_id,
            epoch,
            spec,
            &config,
            &aws,
        )?;

        apply_resource(
            &self.client,
            &desired_state,
            &PatchParams::apply(FIELD_MANAGER).force(),
        )
        .await?;

        self.node_pool_state(node_pool, epoch, spec).await
    }

    async fn deprovision_node_pool(
        &self,
        node_pool: &NodePool,
        epoch: u64,
    ) -> Result<RetryAfter, ProviderError> {
        let node_pool_id = get_node_pool_id(
            &node_pool.namespace().unwrap_or_default(),
            &node_pool.name_any(),
        );

        try_remove_resource::<ConfigMap>(
            &self.client,
            &get_node_group_configmap_name(&node_pool_id, epoch),
            &self.internal_namespace,
            &DeleteParams::default(),
        )
        .await?;

        let (_, remaining) = self.count_ready_nodes(&node_pool_id, epoch).await?;

        Ok((remaining > 0).then_some(NODE_POOL_POLL_INTERVAL))
    }

    async fn node_pool_state(
        &self,
        node_pool: &NodePool,
        epoch: u64,
        spec: &NodePoolSpec,
    ) -> Result<NodePoolProvisioning, ProviderError> {
        let node_pool_id = get_node_pool_id(
            &node_pool.namespace().unwrap_or_default(),
            &node_pool.name_any(),
        );
        let (ready, _) = self.count_ready_nodes(&node_pool_id, epoch).await?;

        Ok(get_node_group_provisioning(ready, spec.num_instances))
    }

    async fn build_work_directory(&self, _job_name: &str) -> Result<Volume, ProviderError> {
        Ok(Volume {
            name: WORK_DIRECTORY_VOLUME_NAME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        })
    }
}

/// Instance types look like `m5.large` or `t3a.2xlarge`, anything else is rejected
/// before it reaches the AWS API.
fn validate_instance_type(instance_type: &str) -> Result<(), ProviderError> {
    let pattern = Regex::new(INSTANCE_TYPE_PATTERN)
        .map_err(|error| ProviderError::Misconfigured(error.to_string().into()))?;

    match pattern.is_match(instance_type) {
        true => Ok(()),
        false => Err(ProviderError::Rejected(
            format!("'{instance_type}' is not a valid EC2 instance type").into(),
        )),
    }
}

fn get_node_group_configmap_name(node_pool_id: &str, epoch: u64) -> String {
    format!("lattice-node-group-{}-{epoch}", node_pool_id.replace('.', "-"))
}

fn generate_node_group_configmap(
    namespace: &str,
    node_pool_id: &str,
    epoch: u64,
    spec: &NodePoolSpec,
    config: &ConfigSpec,
    aws: &AwsCloudProviderConfig,
) -> Result<ConfigMap, ProviderError> {
    let mut labels = get_node_pool_labels(node_pool_id, epoch);
    let node_labels = serde_json::to_string(&labels)?;
    let (min_instances, max_instances) = match spec.autoscaling {
        Some(autoscaling) => (autoscaling.min, autoscaling.max),
        None => (spec.num_instances, spec.num_instances),
    };
    let mut data = BTreeMap::from([
        ("instanceType".to_owned(), spec.instance_type.to_owned()),
        ("desiredInstances".to_owned(), spec.num_instances.to_string()),
        ("minInstances".to_owned(), min_instances.to_string()),
        ("maxInstances".to_owned(), max_instances.to_string()),
        ("region".to_owned(), aws.region.to_owned()),
        ("accountId".to_owned(), aws.account_id.to_owned()),
        ("vpcId".to_owned(), aws.vpc_id.to_owned()),
        ("subnetIds".to_owned(), aws.subnet_ids.join(",")),
        (
            "masterNodeSecurityGroupId".to_owned(),
            aws.master_node_security_group_id.to_owned(),
        ),
        ("amiId".to_owned(), aws.base_node_ami_id.to_owned()),
        ("keyName".to_owned(), aws.key_name.to_owned()),
        ("nodeLabels".to_owned(), node_labels),
        ("nodeTaint".to_owned(), format!("{node_pool_id}:NoSchedule")),
    ]);

    if let Some(terraform) = &config.terraform {
        data.insert(
            "terraformBackend".to_owned(),
            terraform.backend.kind().to_owned(),
        );

        if let Some(s3) = &terraform.backend.s3 {
            data.insert("terraformBucket".to_owned(), s3.bucket.to_owned());
        }
    }

    labels.insert(MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned());

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(get_node_group_configmap_name(node_pool_id, epoch)),
            namespace: Some(namespace.to_owned()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

fn get_node_group_provisioning(ready: usize, desired: i32) -> NodePoolProvisioning {
    let desired = desired.max(0) as usize;
    let message = Some(format!("{ready}/{desired} nodes are ready"));

    match ready {
        ready if ready >= desired => NodePoolProvisioning {
            state: NodePoolState::Stable,
            message: None,
            retry_after: None,
        },
        0 => NodePoolProvisioning {
            state: NodePoolState::Pending,
            message,
            retry_after: Some(NODE_POOL_POLL_INTERVAL),
        },
        _ => NodePoolProvisioning {
            state: NodePoolState::Scaling,
            message,
            retry_after: Some(NODE_POOL_POLL_INTERVAL),
        },
    }
}

fn get_load_balancer_addresses(service: &KubeService) -> Option<BTreeMap<String, String>> {
    let ingress = service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    let host = ingress.hostname.as_ref().or(ingress.ip.as_ref())?;

    service
        .spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .map(|port| {
            Some((
                port.name.clone().unwrap_or_else(|| port.port.to_string()),
                format!("{host}:{}", port.port),
            ))
        })
        .collect()
}

fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, ServicePort as KubeServicePort,
        ServiceSpec as KubeServiceSpec, ServiceStatus as KubeServiceStatus,
    };
    use lattice_core::resources::{
        crd::v1::config::{TerraformBackendConfig, TerraformConfig, TerraformS3BackendConfig},
        labels::{NODE_POOL_EPOCH_LABEL, NODE_POOL_ID_LABEL},
    };

    use super::*;

    #[test]
    fn instance_types_are_validated() {
        assert!(validate_instance_type("m5.large").is_ok());
        assert!(validate_instance_type("t3a.2xlarge").is_ok());
        assert!(validate_instance_type("c6gn.metal").is_ok());

        for invalid in ["", "large", "m5.", "M5.large", "m5 large"] {
            assert!(
                matches!(validate_instance_type(invalid), Err(ProviderError::Rejected(_))),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn node_group_configmap_describes_the_epoch() {
        let spec = NodePoolSpec {
            instance_type: "m5.large".to_owned(),
            num_instances: 3,
            autoscaling: None,
        };
        let config = ConfigSpec {
            terraform: Some(TerraformConfig {
                backend: TerraformBackendConfig {
                    s3: Some(TerraformS3BackendConfig {
                        bucket: "lattice-state".to_owned(),
                    }),
                },
            }),
            ..Default::default()
        };
        let aws = AwsCloudProviderConfig {
            subnet_ids: vec!["subnet-a".to_owned(), "subnet-b".to_owned()],
            ..Default::default()
        };

        let configmap = generate_node_group_configmap(
            "lattice-internal",
            "svc-b.a.lattice-system-shop",
            2,
            &spec,
            &config,
            &aws,
        )
        .unwrap();
        let data = configmap.data.unwrap();
        let labels = configmap.metadata.labels.unwrap();

        assert_eq!(
            configmap.metadata.name.as_deref(),
            Some("lattice-node-group-svc-b-a-lattice-system-shop-2")
        );
        assert_eq!(data["minInstances"], "3");
        assert_eq!(data["subnetIds"], "subnet-a,subnet-b");
        assert_eq!(data["terraformBucket"], "lattice-state");
        assert_eq!(labels[NODE_POOL_EPOCH_LABEL], "2");
        assert_eq!(labels[NODE_POOL_ID_LABEL], "svc-b.a.lattice-system-shop");
    }

    #[test]
    fn provisioning_state_follows_ready_nodes() {
        let pending = get_node_group_provisioning(0, 2);
        let scaling = get_node_group_provisioning(1, 2);
        let stable = get_node_group_provisioning(2, 2);

        assert_eq!(pending.state, NodePoolState::Pending);
        assert!(pending.retry_after.is_some());
        assert_eq!(scaling.state, NodePoolState::Scaling);
        assert_eq!(scaling.message.as_deref(), Some("1/2 nodes are ready"));
        assert_eq!(stable, NodePoolProvisioning::stable());
        assert_eq!(get_node_group_provisioning(0, 0).state, NodePoolState::Stable);
    }

    #[test]
    fn load_balancer_addresses_wait_for_ingress() {
        let mut service = KubeService {
            spec: Some(KubeServiceSpec {
                ports: Some(vec![KubeServicePort {
                    name: Some("https".to_owned()),
                    port: 443,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(get_load_balancer_addresses(&service), None);

        service.status = Some(KubeServiceStatus {
            load_balancer: Some(LoadBalancerStatus {
                ingress: Some(vec![LoadBalancerIngress {
                    hostname: Some("lb-123.elb.amazonaws.com".to_owned()),
                    ..Default::default()
                }]),
            }),
            ..Default::default()
        });

        assert_eq!(
            get_load_balancer_addresses(&service),
            Some(BTreeMap::from([(
                "https".to_owned(),
                "lb-123.elb.amazonaws.com:443".to_owned()
            )]))
        );
    }
}
