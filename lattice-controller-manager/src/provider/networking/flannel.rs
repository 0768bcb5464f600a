use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{
            Capabilities, ConfigMap, ConfigMapVolumeSource, Container, EnvVar, EnvVarSource,
            HostPathVolumeSource, ObjectFieldSelector, PodSpec, PodTemplateSpec, SecurityContext,
            Toleration, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::core::ObjectMeta;
use lattice_core::resources::{
    crd::v1::config::ConfigSpec,
    labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE},
};
use serde_json::json;

use crate::provider::ProviderError;

use super::{BootstrapResources, NetworkingProvider};

pub const FLANNEL_NAMESPACE: &str = "kube-system";
pub const FLANNEL_CONFIGMAP_NAME: &str = "kube-flannel-cfg";
pub const FLANNEL_DAEMONSET_NAME: &str = "kube-flannel-ds";
pub const FLANNEL_IMAGE: &str = "docker.io/flannel/flannel:v0.22.3";
pub const FLANNEL_CNI_PLUGIN_IMAGE: &str = "docker.io/flannel/flannel-cni-plugin:v1.2.0";

const FLANNEL_SERVICE_ACCOUNT: &str = "flannel";
const FLANNEL_APP_LABEL: &str = "app";
const FLANNEL_APP_VALUE: &str = "flannel";
const CNI_CONFIG_KEY: &str = "cni-conf.json";
const NET_CONFIG_KEY: &str = "net-conf.json";
const CONFIG_VOLUME: &str = "flannel-cfg";
const RUN_VOLUME: &str = "run";
const CNI_VOLUME: &str = "cni";
const CNI_PLUGIN_VOLUME: &str = "cni-plugin";

/// Flannel overlay network spanning the pod CIDR block from the lattice config.
pub struct FlannelNetworkingProvider;

impl NetworkingProvider for FlannelNetworkingProvider {
    fn bootstrap_resources(&self, config: &ConfigSpec) -> Result<BootstrapResources, ProviderError> {
        let flannel = config
            .networking_provider
            .flannel
            .as_ref()
            .ok_or(ProviderError::Misconfigured(
                "flannel networking provider isn't configured".into(),
            ))?;

        let net_config = json!({
            "Network": flannel.network_cidr_block.to_string(),
            "Backend": {
                "Type": "vxlan"
            }
        });

        Ok(BootstrapResources {
            config_maps: vec![generate_flannel_configmap(serde_json::to_string_pretty(
                &net_config,
            )?)?],
            daemon_sets: vec![generate_flannel_daemonset()],
        })
    }
}

fn get_flannel_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (FLANNEL_APP_LABEL.to_owned(), FLANNEL_APP_VALUE.to_owned()),
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
    ])
}

fn generate_flannel_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_owned()),
        namespace: Some(FLANNEL_NAMESPACE.to_owned()),
        labels: Some(get_flannel_labels()),
        ..Default::default()
    }
}

fn generate_flannel_configmap(net_config: String) -> Result<ConfigMap, ProviderError> {
    let cni_config = json!({
        "name": "cbr0",
        "cniVersion": "0.3.1",
        "plugins": [
            {
                "type": "flannel",
                "delegate": {
                    "hairpinMode": true,
                    "isDefaultGateway": true
                }
            },
            {
                "type": "portmap",
                "capabilities": {
                    "portMappings": true
                }
            }
        ]
    });

    Ok(ConfigMap {
        metadata: generate_flannel_metadata(FLANNEL_CONFIGMAP_NAME),
        data: Some(BTreeMap::from([
            (
                CNI_CONFIG_KEY.to_owned(),
                serde_json::to_string_pretty(&cni_config)?,
            ),
            (NET_CONFIG_KEY.to_owned(), net_config),
        ])),
        ..Default::default()
    })
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_owned(),
        mount_path: path.to_owned(),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str, type_: Option<&str>) -> Volume {
    Volume {
        name: name.to_owned(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_owned(),
            type_: type_.map(str::to_owned),
        }),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn generate_flannel_daemonset() -> DaemonSet {
    let labels = get_flannel_labels();

    let install_cni_plugin = Container {
        name: "install-cni-plugin".to_owned(),
        image: Some(FLANNEL_CNI_PLUGIN_IMAGE.to_owned()),
        command: Some(vec!["cp".to_owned()]),
        args: Some(vec![
            "-f".to_owned(),
            "/flannel".to_owned(),
            "/opt/cni/bin/flannel".to_owned(),
        ]),
        volume_mounts: Some(vec![mount(CNI_PLUGIN_VOLUME, "/opt/cni/bin")]),
        ..Default::default()
    };

    let install_cni = Container {
        name: "install-cni".to_owned(),
        image: Some(FLANNEL_IMAGE.to_owned()),
        command: Some(vec!["cp".to_owned()]),
        args: Some(vec![
            "-f".to_owned(),
            format!("/etc/kube-flannel/{CNI_CONFIG_KEY}"),
            "/etc/cni/net.d/10-flannel.conflist".to_owned(),
        ]),
        volume_mounts: Some(vec![
            mount(CNI_VOLUME, "/etc/cni/net.d"),
            mount(CONFIG_VOLUME, "/etc/kube-flannel/"),
        ]),
        ..Default::default()
    };

    let flannel = Container {
        name: "kube-flannel".to_owned(),
        image: Some(FLANNEL_IMAGE.to_owned()),
        command: Some(vec!["/opt/bin/flanneld".to_owned()]),
        args: Some(vec!["--ip-masq".to_owned(), "--kube-subnet-mgr".to_owned()]),
        env: Some(vec![
            field_env("POD_NAME", "metadata.name"),
            field_env("POD_NAMESPACE", "metadata.namespace"),
            EnvVar {
                name: "EVENT_QUEUE_DEPTH".to_owned(),
                value: Some("5000".to_owned()),
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_owned(), "NET_RAW".to_owned()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            mount(RUN_VOLUME, "/run/flannel"),
            mount(CONFIG_VOLUME, "/etc/kube-flannel/"),
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: generate_flannel_metadata(FLANNEL_DAEMONSET_NAME),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    host_network: Some(true),
                    priority_class_name: Some("system-node-critical".to_owned()),
                    service_account_name: Some(FLANNEL_SERVICE_ACCOUNT.to_owned()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_owned()),
                        effect: Some("NoSchedule".to_owned()),
                        ..Default::default()
                    }]),
                    init_containers: Some(vec![install_cni_plugin, install_cni]),
                    containers: vec![flannel],
                    volumes: Some(vec![
                        host_path_volume(RUN_VOLUME, "/run/flannel", None),
                        host_path_volume(CNI_PLUGIN_VOLUME, "/opt/cni/bin", None),
                        host_path_volume(CNI_VOLUME, "/etc/cni/net.d", None),
                        Volume {
                            name: CONFIG_VOLUME.to_owned(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: FLANNEL_CONFIGMAP_NAME.to_owned(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::resources::crd::v1::config::FlannelConfig;

    use super::*;

    #[test]
    fn missing_flannel_config_is_a_misconfiguration() {
        let result = FlannelNetworkingProvider.bootstrap_resources(&ConfigSpec::default());

        assert!(matches!(result, Err(ProviderError::Misconfigured(_))));
    }

    #[test]
    fn net_config_carries_the_network_block() {
        let mut config = ConfigSpec::default();
        config.networking_provider.flannel = Some(FlannelConfig {
            network_cidr_block: "10.244.0.0/16".parse().unwrap(),
        });

        let resources = FlannelNetworkingProvider
            .bootstrap_resources(&config)
            .unwrap();
        let net_config = resources.config_maps[0].data.as_ref().unwrap()[NET_CONFIG_KEY].clone();
        let net_config: serde_json::Value = serde_json::from_str(&net_config).unwrap();

        assert_eq!(net_config["Network"], "10.244.0.0/16");
        assert_eq!(net_config["Backend"]["Type"], "vxlan");
        assert_eq!(resources.daemon_sets.len(), 1);
        assert_eq!(
            resources.daemon_sets[0].metadata.namespace.as_deref(),
            Some(FLANNEL_NAMESPACE)
        );
    }
}
