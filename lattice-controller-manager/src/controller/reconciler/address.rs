use std::{collections::BTreeMap, sync::Arc};

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    ResourceExt,
};
use lattice_core::{
    helpers::RequireMetadata,
    kubernetes::{
        operations::{apply_resource_status, merge_annotations, try_get_resource},
        GetApi,
    },
    resources::{
        crd::v1::{
            address::{Address, AddressState, AddressStatus},
            service::{Service, ServiceSpec},
        },
        labels::get_service_selector_labels,
        meta::{get_service_name, ADDRESS_FINALIZER},
    },
};
use log::{info, warn};

use crate::{
    controller::{
        events::{REASON_INVARIANT_VIOLATED, REASON_PROVIDER_REJECTED, REASON_STATE_CHANGED},
        requeue_with_jitter,
    },
    provider::{
        cloud::{LoadBalancerPort, LoadBalancerRequest},
        ProviderError,
    },
};

use super::{
    apply_params, context::ReconcilerContext, error::ReconcilerError, warn_on_status_error,
    PROGRESS_REQUEUE, SUCCESS_REQUEUE,
};

pub async fn reconcile_address(
    object: Arc<Address>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api = context.namespaced_api::<Address>(namespace);

    finalizer(&api, ADDRESS_FINALIZER, object, |event| async {
        match event {
            FinalizerEvent::Apply(address) => match try_reconcile(&address, &context).await {
                Err(error) if !error.is_transient() => {
                    warn!("Address '{}' can't be provisioned! {error}", address.name_any());

                    context
                        .events
                        .warning(
                            address.as_ref(),
                            error
                                .failure_state(REASON_INVARIANT_VIOLATED, REASON_PROVIDER_REJECTED),
                            "ReconcileAddress",
                            error.to_string(),
                        )
                        .await;

                    let current = address.status.clone().unwrap_or_default();
                    let status = AddressStatus {
                        state: error.failure_state(current.state, AddressState::Failed),
                        message: Some(error.to_string()),
                        ..current
                    };
                    warn_on_status_error(
                        address.as_ref(),
                        apply_status(&address, status, &context).await,
                    );

                    Err(error)
                }
                result => result,
            },
            FinalizerEvent::Cleanup(address) => cleanup(&address, &context).await,
        }
    })
    .await
    .map_err(ReconcilerError::from)
}

async fn try_reconcile(address: &Address, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let namespace = address.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = address.status.clone().unwrap_or_default();
    let service_name = get_service_name(&address.spec.service);

    let Some(service) = try_get_resource::<Service>(&context.client, &service_name, namespace).await? else {
        let status = AddressStatus {
            state: AddressState::Pending,
            message: Some(format!("waiting for service '{service_name}'")),
            ..current.clone()
        };
        update_status(address, &current, status, context).await?;

        return Ok(requeue_with_jitter(PROGRESS_REQUEUE));
    };

    let mesh = &context.providers.mesh;
    let cloud = &context.providers.cloud;

    context.ensure_running()?;

    let workload_ip = mesh.workload_ip(address, &service.spec.ports).await?;
    let has_annotations = workload_ip
        .annotations
        .iter()
        .all(|(key, value)| address.annotations().get(key) == Some(value));

    if !has_annotations {
        merge_annotations(&context.client, address, &workload_ip.annotations).await?;
    }

    let mut status = AddressStatus {
        observed_generation: address.metadata.generation,
        ip: Some(workload_ip.ip.to_string()),
        ..current.clone()
    };

    if service.spec.public_ports().next().is_none() {
        context.ensure_running()?;

        cloud.destroy_dns_record(address).await?;
        cloud.destroy_load_balancer(address).await?;

        update_status(address, &current, get_internal_status(status), context).await?;

        return Ok(requeue_with_jitter(SUCCESS_REQUEUE));
    }

    let deployment = try_get_resource::<Deployment>(&context.client, &service_name, namespace).await?;
    let template_annotations = deployment
        .as_ref()
        .and_then(|deployment| deployment.spec.as_ref())
        .and_then(|spec| spec.template.metadata.as_ref())
        .and_then(|metadata| metadata.annotations.as_ref());

    let Some(template_annotations) = template_annotations else {
        status.state = AddressState::Pending;
        status.message = Some(format!("waiting for the workload of service '{service_name}'"));
        update_status(address, &current, status, context).await?;

        return Ok(requeue_with_jitter(PROGRESS_REQUEUE));
    };

    let request = get_load_balancer_request(address, &service.spec, |port| {
        mesh.workload_port(Some(template_annotations), port)
    })?;

    context.ensure_running()?;

    let Some(external_ports) = cloud.ensure_load_balancer(address, &request).await? else {
        status.state = AddressState::Pending;
        status.message = Some("load balancer is being provisioned".to_owned());
        update_status(address, &current, status, context).await?;

        return Ok(requeue_with_jitter(PROGRESS_REQUEUE));
    };

    let dns_target = get_dns_target(&external_ports).unwrap_or_else(|| workload_ip.ip.to_string());

    cloud.ensure_dns_record(address, &dns_target).await?;

    status.state = AddressState::Stable;
    status.message = None;
    status.ports = external_ports;
    update_status(address, &current, status, context).await?;

    Ok(requeue_with_jitter(SUCCESS_REQUEUE))
}

async fn cleanup(address: &Address, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let cloud = &context.providers.cloud;

    info!("Releasing address '{}'...", address.name_any());

    cloud.destroy_dns_record(address).await?;
    cloud.destroy_load_balancer(address).await?;
    context.providers.mesh.release_workload_ip(address).await?;

    Ok(Action::await_change())
}

/// Addresses of services without public ports only keep their workload IP.
fn get_internal_status(status: AddressStatus) -> AddressStatus {
    AddressStatus {
        state: AddressState::Stable,
        message: None,
        ports: BTreeMap::new(),
        ..status
    }
}

/// Public ports of the service, each pointing at the mesh port of the workload.
fn get_load_balancer_request(
    address: &Address,
    service: &ServiceSpec,
    workload_port: impl Fn(i32) -> Result<i32, ProviderError>,
) -> Result<LoadBalancerRequest, ProviderError> {
    let ports = service
        .public_ports()
        .map(|port| {
            Ok(LoadBalancerPort {
                name: port.name.to_owned(),
                port: port.port,
                target_port: workload_port(port.port)?,
            })
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;

    Ok(LoadBalancerRequest {
        selector: get_service_selector_labels(&address.spec.service),
        ports,
    })
}

/// Host of the first external address, `host:port` or a bare host.
fn get_dns_target(external_ports: &BTreeMap<String, String>) -> Option<String> {
    let address = external_ports.values().next()?;
    let host = match address.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => address.as_str(),
    };

    (!host.is_empty()).then(|| host.to_owned())
}

async fn update_status(
    address: &Address,
    current: &AddressStatus,
    status: AddressStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    if status == *current {
        return Ok(());
    }

    if status.state != current.state {
        context
            .events
            .normal(
                address,
                REASON_STATE_CHANGED,
                "ReconcileAddress",
                status.state.to_string(),
            )
            .await;
    }

    apply_status(address, status, context).await
}

async fn apply_status(
    address: &Address,
    status: AddressStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    let name = address.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = address.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;

    apply_resource_status::<Address, _>(&context.client, status, name, namespace, &apply_params())
        .await?;

    Ok(())
}
