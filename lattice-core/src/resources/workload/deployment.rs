use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec, Probe},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{core::ObjectMeta, Resource};

use crate::{
    helpers::RequireMetadata,
    resources::{
        crd::v1::service::Service,
        labels::{get_service_labels, get_service_selector_labels},
        meta::ServiceMeta,
        ResourceGenerationError,
    },
};

use super::{generate_container, NodePoolPlacement};

/// Generates the Deployment of a service before any provider transformations.
pub fn generate_service_deployment(
    service: &Service,
    system: &str,
    placement: &NodePoolPlacement,
) -> Result<Deployment, ResourceGenerationError> {
    let namespace = service
        .require_namespace_or(ResourceGenerationError::DependentMissingMetadataNamespace)?
        .to_owned();
    let owner_reference = service
        .controller_owner_ref(&())
        .ok_or(ResourceGenerationError::DependentMissingMetadataName)?;
    let labels = get_service_labels(system, &service.spec.path);
    let containers = service
        .spec
        .definition
        .containers()
        .map(|(name, container)| generate_container(name, container, &service.spec.artifacts))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(service.get_deployment_name()),
            namespace: Some(namespace),
            labels: Some(labels.to_owned()),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(service.spec.num_instances),
            selector: LabelSelector {
                match_expressions: None,
                match_labels: Some(get_service_selector_labels(&service.spec.path)),
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    affinity: Some(placement.generate_affinity()),
                    tolerations: Some(placement.generate_tolerations()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Readiness summary of a deployment's rollout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentRollout {
    pub updated: i32,
    pub stale: i32,
    pub ready: i32,
    pub available: bool,
    pub failed: bool,
    pub observed: bool,
}

impl DeploymentRollout {
    pub fn from_deployment(deployment: &Deployment) -> Self {
        let generation = deployment.meta().generation;
        let Some(status) = deployment.status.as_ref() else {
            return Self::default();
        };
        let total = status.replicas.unwrap_or_default();
        let updated = status.updated_replicas.unwrap_or_default();
        let desired = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        let conditions = status.conditions.as_deref().unwrap_or_default();
        let has_condition = |type_: &str, status: &str, reason: Option<&str>| {
            conditions.iter().any(|condition| {
                condition.type_ == type_
                    && condition.status == status
                    && reason.map_or(true, |reason| condition.reason.as_deref() == Some(reason))
            })
        };

        Self {
            updated,
            stale: (total - updated).max(0),
            ready: status.ready_replicas.unwrap_or_default(),
            available: updated == desired
                && total == desired
                && status.available_replicas.unwrap_or_default() == desired,
            failed: has_condition("Progressing", "False", Some("ProgressDeadlineExceeded"))
                || has_condition("ReplicaFailure", "True", None),
            observed: generation.is_some() && status.observed_generation == generation,
        }
    }
}

/// Compares the fields lattice sets on a deployment and describes the first
/// difference found. Fields defaulted by the API server are ignored, missing
/// and empty lists are treated the same.
pub fn get_deployment_spec_drift(current: &DeploymentSpec, desired: &DeploymentSpec) -> Option<String> {
    if current.replicas.unwrap_or(1) != desired.replicas.unwrap_or(1) {
        return Some("replica count differs".to_owned());
    }

    if current.selector != desired.selector {
        return Some("selector differs".to_owned());
    }

    let labels = |template: &PodTemplateSpec| {
        template
            .metadata
            .as_ref()
            .and_then(|meta| meta.labels.clone())
            .unwrap_or_default()
    };
    let current_labels = labels(&current.template);
    let missing_label = labels(&desired.template)
        .into_iter()
        .find(|(key, value)| current_labels.get(key) != Some(value));

    if let Some((key, _)) = missing_label {
        return Some(format!("pod label '{key}' differs"));
    }

    let default_pod = PodSpec::default();
    let current_pod = current.template.spec.as_ref().unwrap_or(&default_pod);
    let desired_pod = desired.template.spec.as_ref().unwrap_or(&default_pod);

    if current_pod.affinity != desired_pod.affinity {
        return Some("affinity differs".to_owned());
    }

    if non_empty(&current_pod.tolerations) != non_empty(&desired_pod.tolerations) {
        return Some("tolerations differ".to_owned());
    }

    if current_pod.containers.len() != desired_pod.containers.len() {
        return Some("number of containers differs".to_owned());
    }

    for desired_container in &desired_pod.containers {
        let current_container = current_pod
            .containers
            .iter()
            .find(|container| container.name == desired_container.name);

        let Some(current_container) = current_container else {
            return Some(format!("container '{}' is missing", desired_container.name));
        };

        if let Some(field) = get_container_drift(current_container, desired_container) {
            return Some(format!(
                "container '{}' {field} differs",
                desired_container.name
            ));
        }
    }

    None
}

fn non_empty<T>(list: &Option<Vec<T>>) -> &[T] {
    list.as_deref().unwrap_or_default()
}

fn get_container_drift(current: &Container, desired: &Container) -> Option<&'static str> {
    if current.image != desired.image {
        return Some("image");
    }

    if non_empty(&current.command) != non_empty(&desired.command) {
        return Some("command");
    }

    let env = |container: &Container| {
        non_empty(&container.env)
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect::<Vec<_>>()
    };
    if env(current) != env(desired) {
        return Some("env");
    }

    let ports = |container: &Container| {
        non_empty(&container.ports)
            .iter()
            .map(|port| (port.name.clone(), port.container_port))
            .collect::<Vec<_>>()
    };
    if ports(current) != ports(desired) {
        return Some("ports");
    }

    let probe = |probe: &Option<Probe>| {
        probe
            .as_ref()
            .and_then(|probe| probe.http_get.as_ref())
            .map(|http| (http.path.clone(), http.port.clone()))
    };
    if probe(&current.readiness_probe) != probe(&desired.readiness_probe) {
        return Some("readiness probe");
    }

    None
}
