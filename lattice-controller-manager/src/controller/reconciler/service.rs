use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use kube::{
    core::ObjectMeta,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Resource, ResourceExt,
};
use lattice_core::{
    helpers::RequireMetadata,
    kubernetes::{
        operations::{apply_resource, apply_resource_status, merge_annotations, try_get_resource},
        GetApi,
    },
    resources::{
        annotations::{
            get_json_annotation, to_json_annotation, ServiceNodePoolEpochs,
            SERVICE_NODE_POOLS_ANNOTATION,
        },
        crd::v1::{
            address::{Address, AddressSpec, AddressState},
            node_pool::{NodePool, NodePoolState},
            service::{Service, ServiceState, ServiceStatus},
        },
        labels::get_service_labels,
        meta::{
            get_address_name, get_dedicated_node_pool_name, ServiceMeta, SERVICE_FINALIZER,
        },
        workload::{
            deployment::{generate_service_deployment, get_deployment_spec_drift, DeploymentRollout},
            NodePoolPlacement,
        },
    },
};
use log::{info, warn};

use crate::controller::{
    events::{REASON_INVARIANT_VIOLATED, REASON_STATE_CHANGED},
    requeue_with_jitter,
};

use super::{
    apply_node_pool, apply_params, context::ReconcilerContext, error::ReconcilerError,
    get_node_pool_availability, get_workload_node_pool_name, remove_and_check,
    warn_on_status_error, NodePoolAvailability, DELETION_REQUEUE, PROGRESS_REQUEUE, SUCCESS_REQUEUE,
};

pub async fn reconcile_service(
    object: Arc<Service>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api = context.namespaced_api::<Service>(namespace);

    finalizer(&api, SERVICE_FINALIZER, object, |event| async {
        match event {
            FinalizerEvent::Apply(service) => match try_reconcile(&service, &context).await {
                Err(error) if !error.is_transient() => {
                    let current = service.status.clone().unwrap_or_default();
                    let status = ServiceStatus {
                        state: error.failure_state(current.state, ServiceState::Failed),
                        message: Some(error.to_string()),
                        ..current.clone()
                    };
                    warn_on_status_error(
                        service.as_ref(),
                        update_status(&service, &current, status, &context).await,
                    );

                    Err(error)
                }
                result => result,
            },
            FinalizerEvent::Cleanup(service) => cleanup(&service, &context).await,
        }
    })
    .await
    .map_err(ReconcilerError::from)
}

async fn try_reconcile(service: &Service, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let namespace = service.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let system_id = context.system_id(namespace)?;
    let current = service.status.clone().unwrap_or_default();
    let path = &service.spec.path;
    let definition = &service.spec.definition;

    let node_pool_name = get_workload_node_pool_name(
        path,
        definition.node_pool.as_ref(),
        service.spec.shared_node_pool.as_deref(),
    )?
    .ok_or_else(|| {
        ReconcilerError::InvalidObjectData(
            format!("service '{path}' doesn't declare a node pool").into(),
        )
    })?;

    let mut status = ServiceStatus {
        observed_generation: service.metadata.generation,
        node_pool: Some(node_pool_name.clone()),
        ..current.clone()
    };

    let node_pool = match &definition.node_pool {
        Some(node_pool) => Some(
            apply_node_pool(&context.client, service, &node_pool_name, system_id, node_pool)
                .await?,
        ),
        None => try_get_resource::<NodePool>(&context.client, &node_pool_name, namespace).await?,
    };

    let availability = node_pool
        .as_ref()
        .map(|node_pool| get_node_pool_availability(namespace, node_pool))
        .unwrap_or(NodePoolAvailability::Waiting(NodePoolState::Pending));

    let placement = match availability {
        NodePoolAvailability::Ready(placement) => placement,
        NodePoolAvailability::Failed(message) => {
            status.state = ServiceState::Failed;
            status.message = Some(format!("node pool '{node_pool_name}' failed: {message}"));
            update_status(service, &current, status, context).await?;

            return Ok(Action::await_change());
        }
        NodePoolAvailability::Waiting(state) => {
            status.state = match state {
                NodePoolState::Scaling => ServiceState::Scaling,
                _ => ServiceState::Pending,
            };
            status.message = Some(format!("waiting for node pool '{node_pool_name}'"));
            update_status(service, &current, status, context).await?;

            return Ok(requeue_with_jitter(PROGRESS_REQUEUE));
        }
    };

    context.ensure_running()?;

    let address = apply_address(service, system_id, context).await?;

    context.ensure_running()?;

    let (deployment, update_reason) = ensure_deployment(service, system_id, &placement, context).await?;
    let rollout = DeploymentRollout::from_deployment(&deployment);
    let rollout_complete = update_reason.is_none()
        && rollout.observed
        && rollout.available
        && rollout.stale == 0;

    let previous_epochs = get_json_annotation::<ServiceNodePoolEpochs>(
        Some(service.annotations()),
        SERVICE_NODE_POOLS_ANNOTATION,
    )
    .and_then(Result::ok)
    .unwrap_or_default();
    let epochs = get_node_pool_epochs(&previous_epochs, &node_pool_name, placement.epoch, rollout_complete);

    // a service moved to a shared pool drops its dedicated one
    let dedicated_node_pool = get_dedicated_node_pool_name(path);

    if rollout_complete && node_pool_name != dedicated_node_pool {
        remove_and_check::<NodePool>(&context.client, &dedicated_node_pool, namespace).await?;
    }

    if epochs != previous_epochs {
        let annotations = BTreeMap::from([to_json_annotation(SERVICE_NODE_POOLS_ANNOTATION, &epochs)?]);

        merge_annotations(&context.client, service, &annotations).await?;
    }

    let address_state = address.status.as_ref().map(|status| status.state);

    status.workload = Some(deployment.name_any());
    status.address = Some(address.name_any());
    status.node_pool_epoch = Some(placement.epoch);
    status.updated_instances = rollout.updated;
    status.stale_instances = rollout.stale;
    status.ready_instances = rollout.ready;
    status.ports = address
        .status
        .as_ref()
        .map(|status| status.ports.clone())
        .unwrap_or_default();

    let (state, message) = get_service_state(&rollout, rollout_complete, address_state);
    status.state = state;
    status.message = message;

    update_status(service, &current, status, context).await?;

    Ok(match state {
        ServiceState::Stable | ServiceState::Failed => requeue_with_jitter(SUCCESS_REQUEUE),
        _ => requeue_with_jitter(PROGRESS_REQUEUE),
    })
}

async fn apply_address(
    service: &Service,
    system: &str,
    context: &ReconcilerContext,
) -> Result<Address, ReconcilerError> {
    let namespace = service.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let owner_reference = service
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;
    let address = Address {
        metadata: ObjectMeta {
            name: Some(get_address_name(&service.spec.path)),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_service_labels(system, &service.spec.path)),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: AddressSpec {
            service: service.spec.path.clone(),
        },
        status: None,
    };

    Ok(apply_resource(&context.client, &address, &apply_params()).await?)
}

/// Applies the workload when the live one drifted from the desired one and
/// returns it along with the reason it was updated.
async fn ensure_deployment(
    service: &Service,
    system: &str,
    placement: &NodePoolPlacement,
    context: &ReconcilerContext,
) -> Result<(Deployment, Option<String>), ReconcilerError> {
    let namespace = service.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let deployment_name = service.get_deployment_name();
    let mesh = &context.providers.mesh;
    let cloud = &context.providers.cloud;

    let current = try_get_resource::<Deployment>(&context.client, &deployment_name, namespace).await?;

    if let Some(current) = &current {
        if let Err(error) = check_ownership(service, current) {
            context
                .events
                .warning(
                    service,
                    REASON_INVARIANT_VIOLATED,
                    "ReconcileService",
                    error.to_string(),
                )
                .await;

            return Err(error);
        }
    }

    let current_spec = current.as_ref().and_then(|deployment| deployment.spec.as_ref());
    let existing_annotations = current_spec
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|metadata| metadata.annotations.as_ref());
    let ports = service
        .spec
        .ports
        .iter()
        .map(|port| port.port)
        .collect::<BTreeSet<_>>();
    let mesh_annotations = mesh.workload_annotations(&ports, existing_annotations)?;

    let mut desired = generate_service_deployment(service, system, placement)?;
    let generated = desired
        .spec
        .take()
        .ok_or_else(|| ReconcilerError::MissingObjectData("deployment spec".into()))?;
    let meshed = DeploymentSpec {
        template: mesh
            .transform_pod_template(generated.template.clone(), &mesh_annotations)
            .await?,
        ..generated.clone()
    };
    let transformed = cloud.transform_deployment_spec(meshed.clone()).await?;

    let update_reason = match (&current, current_spec) {
        (Some(_), Some(current_spec)) => {
            get_update_reason(current_spec, &transformed, &meshed, &generated, context).await?
        }
        _ => Some("workload doesn't exist".to_owned()),
    };

    let Some(reason) = update_reason else {
        return Ok((current.unwrap_or(desired), None));
    };

    info!(
        "Updating '{deployment_name}' workload in '{namespace}' namespace ({reason})..."
    );

    desired.spec = Some(transformed);

    let deployment = apply_resource(&context.client, &desired, &apply_params()).await?;

    Ok((deployment, Some(reason)))
}

/// Each layer compares its own changes and hands the rest of the spec down.
async fn get_update_reason(
    current: &DeploymentSpec,
    transformed: &DeploymentSpec,
    meshed: &DeploymentSpec,
    generated: &DeploymentSpec,
    context: &ReconcilerContext,
) -> Result<Option<String>, ReconcilerError> {
    let cloud = context
        .providers
        .cloud
        .is_deployment_spec_updated(current, transformed, meshed)
        .await?;

    if !cloud.up_to_date {
        return Ok(cloud.reason.or_else(|| Some("cloud provider changes differ".to_owned())));
    }

    let mesh = context
        .providers
        .mesh
        .is_deployment_spec_updated(&cloud.spec, meshed, generated);

    if !mesh.up_to_date {
        return Ok(mesh.reason.or_else(|| Some("service mesh changes differ".to_owned())));
    }

    Ok(get_deployment_spec_drift(&mesh.spec, generated))
}

fn check_ownership(service: &Service, deployment: &Deployment) -> Result<(), ReconcilerError> {
    let uid = service.uid();
    let owned = deployment
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && Some(&owner.uid) == uid.as_ref());

    match owned {
        true => Ok(()),
        false => Err(ReconcilerError::InvariantViolation(
            format!(
                "workload '{}' exists but isn't controlled by service '{}'",
                deployment.name_any(),
                service.name_any()
            )
            .into(),
        )),
    }
}

/// While a rollout is in progress pods may sit on any epoch the service used
/// so far, once it completes only the current one is kept.
fn get_node_pool_epochs(
    previous: &ServiceNodePoolEpochs,
    node_pool: &str,
    epoch: u64,
    rollout_complete: bool,
) -> ServiceNodePoolEpochs {
    if rollout_complete {
        return ServiceNodePoolEpochs::from([(node_pool.to_owned(), vec![epoch])]);
    }

    let mut epochs = previous.clone();
    let pool_epochs = epochs.entry(node_pool.to_owned()).or_default();

    if !pool_epochs.contains(&epoch) {
        pool_epochs.push(epoch);
        pool_epochs.sort_unstable();
    }

    epochs
}

fn get_service_state(
    rollout: &DeploymentRollout,
    rollout_complete: bool,
    address: Option<AddressState>,
) -> (ServiceState, Option<String>) {
    if rollout.failed {
        return (
            ServiceState::Failed,
            Some("workload rollout failed".to_owned()),
        );
    }

    match (rollout_complete, address) {
        (true, Some(AddressState::Stable)) => (ServiceState::Stable, None),
        (true, Some(AddressState::Failed)) => (
            ServiceState::Failed,
            Some("address couldn't be provisioned".to_owned()),
        ),
        (true, _) => (
            ServiceState::Updating,
            Some("waiting for the address".to_owned()),
        ),
        (false, _) => (
            ServiceState::Updating,
            Some(format!(
                "{} updated, {} stale, {} ready instances",
                rollout.updated, rollout.stale, rollout.ready
            )),
        ),
    }
}

async fn cleanup(service: &Service, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let name = service.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = service.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = service.status.clone().unwrap_or_default();
    let client = &context.client;

    if current.state != ServiceState::Deleting {
        let status = ServiceStatus {
            state: ServiceState::Deleting,
            message: None,
            ..current.clone()
        };
        update_status(service, &current, status, context).await?;
    }

    if !remove_and_check::<Deployment>(client, &service.get_deployment_name(), namespace).await? {
        return Err(ReconcilerError::RetryAfter(DELETION_REQUEUE));
    }

    if !remove_and_check::<Address>(client, &get_address_name(&service.spec.path), namespace).await? {
        return Err(ReconcilerError::RetryAfter(DELETION_REQUEUE));
    }

    let node_pool = get_dedicated_node_pool_name(&service.spec.path);

    if !remove_and_check::<NodePool>(client, &node_pool, namespace).await? {
        return Err(ReconcilerError::RetryAfter(DELETION_REQUEUE));
    }

    info!("Service '{name}' in '{namespace}' namespace was cleaned up!");

    Ok(Action::await_change())
}

async fn update_status(
    service: &Service,
    current: &ServiceStatus,
    status: ServiceStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    if status == *current {
        return Ok(());
    }

    let name = service.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = service.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;

    if status.state != current.state {
        if status.state == ServiceState::Failed {
            warn!("Service '{name}' in '{namespace}' namespace failed! {:?}", status.message);
        }

        context
            .events
            .normal(
                service,
                REASON_STATE_CHANGED,
                "ReconcileService",
                status.message.clone().unwrap_or_else(|| status.state.to_string()),
            )
            .await;
    }

    apply_resource_status::<Service, _>(&context.client, status, name, namespace, &apply_params())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use lattice_core::resources::crd::v1::service::ServiceSpec;

    use super::*;

    fn rollout(complete: bool) -> DeploymentRollout {
        DeploymentRollout {
            updated: 2,
            stale: if complete { 0 } else { 1 },
            ready: 2,
            available: complete,
            failed: false,
            observed: true,
        }
    }

    #[test]
    fn epochs_accumulate_until_the_rollout_completes() {
        let previous = ServiceNodePoolEpochs::from([("svc-api.shop".to_owned(), vec![1])]);

        let moving = get_node_pool_epochs(&previous, "svc-api.shop", 2, false);
        assert_eq!(moving["svc-api.shop"], vec![1, 2]);

        let switched = get_node_pool_epochs(&moving, "shared-general.shop", 1, false);
        assert_eq!(switched["svc-api.shop"], vec![1, 2]);
        assert_eq!(switched["shared-general.shop"], vec![1]);

        let settled = get_node_pool_epochs(&switched, "shared-general.shop", 1, true);
        assert_eq!(
            settled,
            ServiceNodePoolEpochs::from([("shared-general.shop".to_owned(), vec![1])])
        );
    }

    #[test]
    fn service_is_stable_once_rolled_out_and_addressed() {
        assert_eq!(
            get_service_state(&rollout(true), true, Some(AddressState::Stable)),
            (ServiceState::Stable, None)
        );
        assert_eq!(
            get_service_state(&rollout(true), true, Some(AddressState::Pending)).0,
            ServiceState::Updating
        );
        assert_eq!(
            get_service_state(&rollout(false), false, Some(AddressState::Stable)).0,
            ServiceState::Updating
        );
    }

    #[test]
    fn failed_rollout_fails_the_service() {
        let failed = DeploymentRollout {
            failed: true,
            ..rollout(false)
        };

        assert_eq!(
            get_service_state(&failed, false, Some(AddressState::Stable)).0,
            ServiceState::Failed
        );
    }

    #[test]
    fn foreign_workloads_are_an_invariant_violation() {
        let mut service = Service::new("api.shop", ServiceSpec::default());
        service.metadata.uid = Some("a1".to_owned());

        let mut deployment = Deployment::default();
        deployment.metadata.name = Some("api.shop".to_owned());
        deployment.metadata.owner_references = Some(vec![OwnerReference {
            uid: "b2".to_owned(),
            controller: Some(true),
            ..Default::default()
        }]);

        assert!(matches!(
            check_ownership(&service, &deployment),
            Err(ReconcilerError::InvariantViolation(_))
        ));

        deployment.metadata.owner_references = Some(vec![OwnerReference {
            uid: "a1".to_owned(),
            controller: Some(true),
            ..Default::default()
        }]);

        assert!(check_ownership(&service, &deployment).is_ok());
    }
}
