use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::Arc,
};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use itertools::Itertools;
use k8s_openapi::api::{
    apps::v1::DeploymentSpec,
    core::v1::{
        Capabilities, Container, ContainerPort as KubeContainerPort, EmptyDirVolumeSource, EnvVar,
        PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
    },
};
use kube::{api::ListParams, Client, ResourceExt};
use lattice_core::{
    definition::component::PortProtocol,
    helpers::RequireMetadata,
    ip::lease::{Ipv4LeaseManager, Ipv4Leases},
    kubernetes::GetApi,
    resources::{
        annotations::{
            SERVICE_MESH_ADMIN_PORT_ANNOTATION, SERVICE_MESH_EGRESS_PORT_ANNOTATION,
            SERVICE_MESH_IP_LEASE_ANNOTATION, SERVICE_MESH_PORTS_ANNOTATION,
        },
        crd::v1::{address::Address, config::EnvoyConfig, service::ServicePort},
    },
};
use log::{info, warn};
use tokio::sync::OnceCell;

use crate::{
    config::ConfigStore,
    provider::{ProviderError, SpecComparison},
};

use super::{MeshPortAssignment, ServiceMesh, WorkloadIp};

pub const ENVOY_CONTAINER_NAME: &str = "lattice-envoy";
pub const PREPARE_ENVOY_CONTAINER_NAME: &str = "lattice-prepare-envoy";
pub const ENVOY_CONFIG_VOLUME_NAME: &str = "lattice-envoy-config";
pub const ENVOY_CONFIG_PATH: &str = "/etc/envoy";

pub const IP_LEASE_DEDICATED: &str = "dedicated";
pub const IP_LEASE_SHARED: &str = "shared";

const MESH_ANNOTATIONS: [&str; 3] = [
    SERVICE_MESH_ADMIN_PORT_ANNOTATION,
    SERVICE_MESH_EGRESS_PORT_ANNOTATION,
    SERVICE_MESH_PORTS_ANNOTATION,
];

/// Envoy sidecar mesh. Traffic to the redirect CIDR block is captured by the
/// sidecar, HTTP workloads share the block's network address while TCP
/// workloads get a leased address of their own.
pub struct EnvoyServiceMesh {
    client: Client,
    config_store: Arc<ConfigStore>,
    lease_manager: OnceCell<Ipv4LeaseManager>,
}

impl EnvoyServiceMesh {
    pub fn new(client: Client, config_store: Arc<ConfigStore>) -> Self {
        Self {
            client,
            config_store,
            lease_manager: OnceCell::new(),
        }
    }

    async fn config(&self) -> Result<EnvoyConfig, ProviderError> {
        self.config_store
            .current()
            .await?
            .service_mesh
            .envoy
            .clone()
            .ok_or(ProviderError::Misconfigured("envoy mesh isn't configured".into()))
    }

    /// Lease manager rebuilt from the addresses already in the cluster.
    async fn leases(&self, range: Ipv4Net) -> Result<&Ipv4LeaseManager, ProviderError> {
        self.lease_manager
            .get_or_try_init(|| async {
                info!("Rebuilding workload IP leases in {range}...");

                let addresses = self
                    .client
                    .global_api::<Address>()
                    .list(&ListParams::default())
                    .await?
                    .items;

                Ok(restore_leases(range, &addresses).into())
            })
            .await
    }
}

#[async_trait]
impl ServiceMesh for EnvoyServiceMesh {
    fn workload_annotations(
        &self,
        ports: &BTreeSet<i32>,
        existing: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, ProviderError> {
        let previous = MeshPortAssignment::from_annotations(existing);

        if previous.covers(ports) {
            return previous.to_annotations();
        }

        MeshPortAssignment::assign(ports, &previous).to_annotations()
    }

    fn service_mesh_ports(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<i32, i32>, ProviderError> {
        let assignment = MeshPortAssignment::from_annotations(annotations);

        match assignment.admin.and(assignment.egress) {
            Some(_) => Ok(assignment.ports),
            None => Err(ProviderError::MissingData("service mesh port annotations".into())),
        }
    }

    fn workload_port(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
        port: i32,
    ) -> Result<i32, ProviderError> {
        self.service_mesh_ports(annotations)?
            .get(&port)
            .copied()
            .ok_or_else(|| ProviderError::MissingData(format!("mesh port of port {port}").into()))
    }

    async fn transform_pod_template(
        &self,
        template: PodTemplateSpec,
        annotations: &BTreeMap<String, String>,
    ) -> Result<PodTemplateSpec, ProviderError> {
        let config = self.config().await?;
        let assignment = MeshPortAssignment::from_annotations(Some(annotations));

        inject_envoy(template, &config, &assignment)
    }

    fn is_deployment_spec_updated(
        &self,
        current: &DeploymentSpec,
        desired: &DeploymentSpec,
        _untransformed: &DeploymentSpec,
    ) -> SpecComparison {
        compare_envoy_spec(current, desired)
    }

    async fn workload_ip(
        &self,
        address: &Address,
        ports: &[ServicePort],
    ) -> Result<WorkloadIp, ProviderError> {
        let config = self.config().await?;
        let uid = address.require_uid_or(ProviderError::MissingData("address uid".into()))?;
        let leases = self.leases(config.redirect_cidr_block).await?;

        if ports.iter().any(|port| port.protocol == PortProtocol::Tcp) {
            let ip = leases.get_or_lease(uid).await?;

            return Ok(WorkloadIp {
                ip,
                annotations: BTreeMap::from([(
                    SERVICE_MESH_IP_LEASE_ANNOTATION.to_owned(),
                    IP_LEASE_DEDICATED.to_owned(),
                )]),
            });
        }

        // the service may have dropped its last TCP port
        leases.release(uid).await;

        Ok(WorkloadIp {
            ip: config.redirect_cidr_block.network(),
            annotations: BTreeMap::from([(
                SERVICE_MESH_IP_LEASE_ANNOTATION.to_owned(),
                IP_LEASE_SHARED.to_owned(),
            )]),
        })
    }

    async fn release_workload_ip(&self, address: &Address) -> Result<(), ProviderError> {
        let Some(uid) = address.uid() else {
            return Ok(());
        };
        let config = self.config().await?;

        self.leases(config.redirect_cidr_block)
            .await?
            .release(&uid)
            .await;

        Ok(())
    }
}

fn restore_leases(range: Ipv4Net, addresses: &[Address]) -> Ipv4Leases {
    let mut leases = Ipv4Leases::new(range);

    for address in addresses {
        let lease = address.uid().zip(
            address
                .status
                .as_ref()
                .and_then(|status| status.ip.as_ref())
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok()),
        );

        let Some((uid, ip)) = lease else {
            continue;
        };

        if ip == range.network() {
            continue;
        }

        if let Err(error) = leases.try_insert(&uid, ip) {
            warn!(
                "Dropping the lease of '{}' address in '{}' namespace, it will be leased again! {error}",
                address.name_any(),
                address.namespace().unwrap_or_default()
            );
        }
    }

    leases
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn inject_envoy(
    mut template: PodTemplateSpec,
    config: &EnvoyConfig,
    assignment: &MeshPortAssignment,
) -> Result<PodTemplateSpec, ProviderError> {
    let (Some(admin), Some(egress)) = (assignment.admin, assignment.egress) else {
        return Err(ProviderError::MissingData(
            "service mesh admin and egress ports".into(),
        ));
    };
    let service_ports = assignment
        .ports
        .iter()
        .map(|(port, mesh_port)| format!("{port}:{mesh_port}"))
        .join(",");
    let config_mount = VolumeMount {
        name: ENVOY_CONFIG_VOLUME_NAME.to_owned(),
        mount_path: ENVOY_CONFIG_PATH.to_owned(),
        ..Default::default()
    };
    let mesh_env = vec![
        env("ENVOY_ADMIN_PORT", admin),
        env("ENVOY_EGRESS_PORT", egress),
        env("ENVOY_SERVICE_PORTS", &service_ports),
        env("REDIRECT_CIDR_BLOCK", config.redirect_cidr_block),
        env("XDS_API_PORT", config.xds_api_port),
    ];

    let prepare_envoy = Container {
        name: PREPARE_ENVOY_CONTAINER_NAME.to_owned(),
        image: Some(config.prepare_image.to_owned()),
        env: Some(mesh_env.clone()),
        volume_mounts: Some(vec![config_mount.clone()]),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_owned()]),
                drop: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let envoy = Container {
        name: ENVOY_CONTAINER_NAME.to_owned(),
        image: Some(config.image.to_owned()),
        args: Some(vec![
            "--config-path".to_owned(),
            format!("{ENVOY_CONFIG_PATH}/envoy.json"),
        ]),
        env: Some(mesh_env),
        ports: Some(vec![KubeContainerPort {
            name: Some("envoy-admin".to_owned()),
            container_port: admin,
            protocol: Some("TCP".to_owned()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![config_mount]),
        ..Default::default()
    };

    let metadata = template.metadata.get_or_insert_with(Default::default);
    let annotations = metadata.annotations.get_or_insert_with(Default::default);
    annotations.extend(assignment.to_annotations()?);

    let pod_spec = template.spec.get_or_insert_with(PodSpec::default);
    pod_spec
        .init_containers
        .get_or_insert_with(Vec::new)
        .push(prepare_envoy);
    pod_spec.containers.push(envoy);
    pod_spec.volumes.get_or_insert_with(Vec::new).push(Volume {
        name: ENVOY_CONFIG_VOLUME_NAME.to_owned(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    Ok(template)
}

fn find_container<'a>(containers: Option<&'a Vec<Container>>, name: &str) -> Option<&'a Container> {
    containers?.iter().find(|container| container.name == name)
}

fn container_differs(current: Option<&Container>, desired: Option<&Container>) -> bool {
    match (current, desired) {
        (Some(current), Some(desired)) => {
            current.image != desired.image
                || current.args != desired.args
                || current.env != desired.env
        }
        (None, None) => false,
        _ => true,
    }
}

fn mesh_annotations(template: &PodTemplateSpec) -> BTreeMap<&str, &str> {
    template
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.annotations.as_ref())
        .map(|annotations| {
            annotations
                .iter()
                .filter(|(key, _)| MESH_ANNOTATIONS.contains(&key.as_str()))
                .map(|(key, value)| (key.as_str(), value.as_str()))
                .collect()
        })
        .unwrap_or_default()
}

fn strip_envoy(mut spec: DeploymentSpec) -> DeploymentSpec {
    if let Some(annotations) = spec
        .template
        .metadata
        .as_mut()
        .and_then(|metadata| metadata.annotations.as_mut())
    {
        annotations.retain(|key, _| !MESH_ANNOTATIONS.contains(&key.as_str()));
    }

    if let Some(pod_spec) = spec.template.spec.as_mut() {
        pod_spec
            .containers
            .retain(|container| container.name != ENVOY_CONTAINER_NAME);

        if let Some(init_containers) = pod_spec.init_containers.as_mut() {
            init_containers.retain(|container| container.name != PREPARE_ENVOY_CONTAINER_NAME);
        }

        if let Some(volumes) = pod_spec.volumes.as_mut() {
            volumes.retain(|volume| volume.name != ENVOY_CONFIG_VOLUME_NAME);
        }

        if pod_spec.init_containers.as_ref().is_some_and(Vec::is_empty) {
            pod_spec.init_containers = None;
        }

        if pod_spec.volumes.as_ref().is_some_and(Vec::is_empty) {
            pod_spec.volumes = None;
        }
    }

    spec
}

fn compare_envoy_spec(current: &DeploymentSpec, desired: &DeploymentSpec) -> SpecComparison {
    let current_pod = current.template.spec.as_ref();
    let desired_pod = desired.template.spec.as_ref();
    let spec = strip_envoy(current.clone());

    if container_differs(
        find_container(current_pod.map(|pod| &pod.containers), ENVOY_CONTAINER_NAME),
        find_container(desired_pod.map(|pod| &pod.containers), ENVOY_CONTAINER_NAME),
    ) {
        return SpecComparison::outdated("envoy sidecar differs", spec);
    }

    if container_differs(
        find_container(
            current_pod.and_then(|pod| pod.init_containers.as_ref()),
            PREPARE_ENVOY_CONTAINER_NAME,
        ),
        find_container(
            desired_pod.and_then(|pod| pod.init_containers.as_ref()),
            PREPARE_ENVOY_CONTAINER_NAME,
        ),
    ) {
        return SpecComparison::outdated("envoy init container differs", spec);
    }

    if mesh_annotations(&current.template) != mesh_annotations(&desired.template) {
        return SpecComparison::outdated("service mesh annotations differ", spec);
    }

    SpecComparison::up_to_date(spec)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lattice_core::{
        definition::path::TreePath,
        resources::crd::v1::address::{AddressSpec, AddressStatus},
    };

    use super::*;

    fn config() -> EnvoyConfig {
        EnvoyConfig {
            prepare_image: "lattice/prepare-envoy:1".to_owned(),
            image: "envoyproxy/envoy:v1.27".to_owned(),
            redirect_cidr_block: "172.16.0.0/24".parse().unwrap(),
            xds_api_image: "lattice/xds-api:1".to_owned(),
            xds_api_port: 8080,
        }
    }

    fn user_spec() -> DeploymentSpec {
        let mut spec = DeploymentSpec::default();
        spec.template.spec = Some(PodSpec {
            containers: vec![Container {
                name: "main".to_owned(),
                image: Some("api:v1".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        });

        spec
    }

    fn mesh_spec(ports: &[i32]) -> DeploymentSpec {
        let ports = ports.iter().copied().collect();
        let assignment = MeshPortAssignment::assign(&ports, &Default::default());
        let mut spec = user_spec();

        spec.template = inject_envoy(spec.template, &config(), &assignment).unwrap();

        spec
    }

    fn address(uid: &str, ip: Option<&str>) -> Address {
        let mut address = Address::new(
            uid,
            AddressSpec {
                service: TreePath::new("/a").unwrap(),
            },
        );
        address.metadata.uid = Some(uid.to_owned());
        address.status = Some(AddressStatus {
            ip: ip.map(str::to_owned),
            ..Default::default()
        });

        address
    }

    #[test]
    fn injection_adds_sidecar_init_container_and_volume() {
        let spec = mesh_spec(&[8080]);
        let pod = spec.template.spec.as_ref().unwrap();
        let prepare = &pod.init_containers.as_ref().unwrap()[0];

        assert_eq!(pod.containers.len(), 2);
        assert_eq!(pod.containers[1].name, ENVOY_CONTAINER_NAME);
        assert_eq!(
            prepare.security_context.as_ref().unwrap().capabilities.as_ref().unwrap().add,
            Some(vec!["NET_ADMIN".to_owned()])
        );
        assert_eq!(pod.volumes.as_ref().unwrap()[0].name, ENVOY_CONFIG_VOLUME_NAME);
        assert_eq!(mesh_annotations(&spec.template).len(), 3);
    }

    #[test]
    fn stripping_restores_the_user_spec() {
        let comparison = compare_envoy_spec(&mesh_spec(&[8080]), &mesh_spec(&[8080]));
        let mut expected = user_spec();
        expected.template.metadata = Some(ObjectMeta {
            annotations: Some(BTreeMap::new()),
            ..Default::default()
        });

        assert!(comparison.up_to_date);
        assert_eq!(comparison.spec, expected);
    }

    #[test]
    fn changed_ports_are_detected() {
        let comparison = compare_envoy_spec(&mesh_spec(&[8080]), &mesh_spec(&[8080, 9090]));

        assert!(!comparison.up_to_date);
    }

    #[test]
    fn missing_sidecar_is_detected() {
        let comparison = compare_envoy_spec(&user_spec(), &mesh_spec(&[8080]));

        assert!(!comparison.up_to_date);
        assert_eq!(comparison.reason.as_deref(), Some("envoy sidecar differs"));
    }

    #[test]
    fn injection_requires_assigned_ports() {
        assert!(inject_envoy(
            PodTemplateSpec::default(),
            &config(),
            &MeshPortAssignment::default()
        )
        .is_err());
    }

    #[test]
    fn leases_are_restored_from_address_statuses() {
        let range: Ipv4Net = "172.16.0.0/24".parse().unwrap();
        let addresses = vec![
            address("first", Some("172.16.0.5")),
            address("shared", Some("172.16.0.0")),
            address("conflicting", Some("172.16.0.5")),
            address("outside", Some("10.0.0.1")),
            address("pending", None),
        ];

        let leases = restore_leases(range, &addresses);

        assert_eq!(leases.get("first"), Some("172.16.0.5".parse().unwrap()));
        assert_eq!(leases.get("shared"), None);
        assert_eq!(leases.get("conflicting"), None);
        assert_eq!(leases.get("outside"), None);
        assert_eq!(leases.get("pending"), None);
    }
}
