use std::{collections::BTreeMap, fmt::Debug, sync::Arc};

use itertools::Itertools;
use k8s_openapi::{
    serde::{de::DeserializeOwned, Serialize},
    NamespaceResourceScope,
};
use kube::{
    api::ListParams,
    core::ObjectMeta,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Client, Resource, ResourceExt,
};
use lattice_core::{
    definition::path::{NodePoolPath, TreePath},
    helpers::{Deleted, RequireMetadata},
    kubernetes::{
        operations::{apply_resource, apply_resource_status, list_resources, try_remove_resource},
        GetApi,
    },
    resources::{
        crd::v1::{
            build::Build,
            deploy::Deploy,
            job::{Job, JobSpec},
            node_pool::NodePool,
            service::{Service, ServiceSpec, ServiceState},
            system::{
                System, SystemJobSpec, SystemNodePoolStatus, SystemServiceSpec, SystemServiceStatus,
                SystemState, SystemStatus,
            },
            teardown::Teardown,
        },
        labels::{get_job_labels, get_service_labels},
        meta::{get_job_name, get_service_name, get_shared_node_pool_name, SYSTEM_FINALIZER},
    },
};
use log::info;

use crate::controller::{events::REASON_STATE_CHANGED, requeue_with_jitter};

use super::{
    apply_node_pool, apply_params, background_deletion, context::ReconcilerContext,
    error::ReconcilerError, warn_on_status_error, DELETION_REQUEUE, PROGRESS_REQUEUE,
    SUCCESS_REQUEUE,
};

pub async fn reconcile_system(
    object: Arc<System>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api = context.namespaced_api::<System>(namespace);

    finalizer(&api, SYSTEM_FINALIZER, object, |event| async {
        match event {
            FinalizerEvent::Apply(system) => match try_reconcile(&system, &context).await {
                Err(error) if !error.is_transient() => {
                    let current = system.status.clone().unwrap_or_default();
                    let status = SystemStatus {
                        state: error.failure_state(current.state, SystemState::Failed),
                        message: Some(error.to_string()),
                        ..current.clone()
                    };
                    warn_on_status_error(
                        system.as_ref(),
                        update_status(&system, &current, status, &context).await,
                    );

                    Err(error)
                }
                result => result,
            },
            FinalizerEvent::Cleanup(system) => cleanup(&system, &context).await,
        }
    })
    .await
    .map_err(ReconcilerError::from)
}

async fn try_reconcile(system: &System, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let system_id = context.system_id(namespace)?;

    if system_id != name {
        return Err(ReconcilerError::InvalidObjectData(
            format!("system '{name}' lives in the namespace of system '{system_id}'").into(),
        ));
    }

    let current = system.status.clone().unwrap_or_default();
    let client = &context.client;

    let node_pools = ensure_shared_node_pools(system, context).await?;

    context.ensure_running()?;

    let services = list_resources::<Service>(client, namespace, &ListParams::default()).await?;
    let diff = get_service_diff(&system.spec.services, &services);

    for (path, spec) in &diff.apply {
        context.ensure_running()?;

        info!("Applying '{path}' service of '{name}' system...");

        apply_service(system, path, spec.clone(), context).await?;
    }

    for service in &diff.delete {
        info!("Removing '{service}' service of '{name}' system...");

        try_remove_resource::<Service>(client, service, namespace, &background_deletion()).await?;
    }

    let jobs = list_resources::<Job>(client, namespace, &ListParams::default()).await?;
    let system_jobs = jobs
        .into_iter()
        .filter(|job| is_controlled_by(job, system))
        .collect::<Vec<_>>();
    let job_diff = get_job_diff(&system.spec.jobs, &system_jobs);

    for (path, spec) in &job_diff.apply {
        context.ensure_running()?;

        info!("Applying '{path}' job of '{name}' system...");

        apply_job(system, path, spec.clone(), context).await?;
    }

    for job in &job_diff.delete {
        info!("Removing '{job}' job of '{name}' system...");

        try_remove_resource::<Job>(client, job, namespace, &background_deletion()).await?;
    }

    let mut status = SystemStatus {
        observed_generation: system.metadata.generation,
        services: get_service_statuses(&system.spec.services, &services, &diff),
        node_pools: node_pools
            .iter()
            .map(|(path, node_pool)| {
                (
                    path.to_owned(),
                    SystemNodePoolStatus {
                        name: node_pool.name_any(),
                        state: node_pool
                            .status
                            .as_ref()
                            .map(|status| status.state)
                            .unwrap_or_default(),
                    },
                )
            })
            .collect(),
        ..current.clone()
    };

    let removing = !diff.delete.is_empty() || !job_diff.delete.is_empty();
    let (state, message) = aggregate_system_state(&status, removing);
    status.state = state;
    status.message = message;

    update_status(system, &current, status, context).await?;

    Ok(match state {
        SystemState::Stable => requeue_with_jitter(SUCCESS_REQUEUE),
        _ => requeue_with_jitter(PROGRESS_REQUEUE),
    })
}

/// Applies the node pools the system shares between its workloads and
/// removes the ones it no longer declares.
async fn ensure_shared_node_pools(
    system: &System,
    context: &ReconcilerContext,
) -> Result<BTreeMap<String, NodePool>, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let mut node_pools = BTreeMap::new();

    for (path, definition) in &system.spec.node_pools {
        let node_pool_path = path.parse::<NodePoolPath>().map_err(|error| {
            ReconcilerError::InvalidObjectData(format!("node pool '{path}': {error}").into())
        })?;
        let node_pool_name = get_shared_node_pool_name(&node_pool_path);
        let node_pool =
            apply_node_pool(&context.client, system, &node_pool_name, name, definition).await?;

        node_pools.insert(path.to_owned(), node_pool);
    }

    let existing = list_resources::<NodePool>(&context.client, namespace, &ListParams::default()).await?;
    let declared = node_pools.values().map(|node_pool| node_pool.name_any()).collect::<Vec<_>>();

    for node_pool in existing {
        let node_pool_name = node_pool.name_any();

        if is_controlled_by(&node_pool, system) && !declared.contains(&node_pool_name) && !node_pool.is_deleted() {
            info!("Removing '{node_pool_name}' shared node pool of '{name}' system...");

            try_remove_resource::<NodePool>(&context.client, &node_pool_name, namespace, &background_deletion())
                .await?;
        }
    }

    Ok(node_pools)
}

async fn apply_service(
    system: &System,
    path: &TreePath,
    spec: ServiceSpec,
    context: &ReconcilerContext,
) -> Result<Service, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let owner_reference = system
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;
    let service = Service {
        metadata: ObjectMeta {
            name: Some(get_service_name(path)),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_service_labels(name, path)),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec,
        status: None,
    };

    Ok(apply_resource(&context.client, &service, &apply_params()).await?)
}

async fn apply_job(
    system: &System,
    path: &TreePath,
    spec: JobSpec,
    context: &ReconcilerContext,
) -> Result<Job, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let owner_reference = system
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;
    let job = Job {
        metadata: ObjectMeta {
            name: Some(get_job_name(path)),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_job_labels(name, path)),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec,
        status: None,
    };

    Ok(apply_resource(&context.client, &job, &apply_params()).await?)
}

fn is_controlled_by<K: Resource>(resource: &K, system: &System) -> bool {
    let uid = system.uid();

    resource
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && Some(&owner.uid) == uid.as_ref())
}

#[derive(Debug)]
struct WorkloadDiff<S> {
    /// workloads that are missing or drifted, with their desired spec
    apply: BTreeMap<TreePath, S>,
    /// names of workloads the system no longer declares
    delete: Vec<String>,
}

type ServiceDiff = WorkloadDiff<ServiceSpec>;

fn get_service_diff(desired: &BTreeMap<TreePath, SystemServiceSpec>, existing: &[Service]) -> ServiceDiff {
    let existing_by_path = existing
        .iter()
        .map(|service| (&service.spec.path, service))
        .collect::<BTreeMap<_, _>>();

    let apply = desired
        .iter()
        .map(|(path, service)| {
            (
                path.clone(),
                ServiceSpec::from_definition(
                    path.clone(),
                    service.definition.clone(),
                    service.artifacts.clone(),
                ),
            )
        })
        .filter(|(path, spec)| {
            existing_by_path
                .get(path)
                .map_or(true, |service| service.spec != *spec)
        })
        .collect();

    let delete = existing
        .iter()
        .filter(|service| !desired.contains_key(&service.spec.path) && !service.is_deleted())
        .map(|service| service.name_any())
        .collect();

    ServiceDiff { apply, delete }
}

/// Only the definition and artifacts are compared, run parameters of a job
/// belong to whoever triggered it.
fn get_job_diff(desired: &BTreeMap<TreePath, SystemJobSpec>, existing: &[Job]) -> WorkloadDiff<JobSpec> {
    let existing_by_path = existing
        .iter()
        .map(|job| (&job.spec.path, job))
        .collect::<BTreeMap<_, _>>();

    let apply = desired
        .iter()
        .filter(|(path, job)| {
            existing_by_path.get(path).map_or(true, |existing| {
                existing.spec.definition != job.definition || existing.spec.artifacts != job.artifacts
            })
        })
        .map(|(path, job)| {
            (
                path.clone(),
                JobSpec::from_definition(path.clone(), job.definition.clone(), job.artifacts.clone()),
            )
        })
        .collect();

    let delete = existing
        .iter()
        .filter(|job| !desired.contains_key(&job.spec.path) && !job.is_deleted())
        .map(|job| job.name_any())
        .collect();

    WorkloadDiff { apply, delete }
}

/// Freshly applied services report their previous state until observed, so
/// they're pending here.
fn get_service_statuses(
    desired: &BTreeMap<TreePath, SystemServiceSpec>,
    existing: &[Service],
    diff: &ServiceDiff,
) -> BTreeMap<TreePath, SystemServiceStatus> {
    desired
        .keys()
        .map(|path| {
            let service = existing.iter().find(|service| service.spec.path == *path);
            let observed = service.and_then(|service| {
                let status = service.status.as_ref()?;

                (status.observed_generation == service.metadata.generation).then_some(status)
            });

            let status = match (diff.apply.contains_key(path), observed) {
                (false, Some(status)) => SystemServiceStatus {
                    name: get_service_name(path),
                    state: status.state,
                    message: status.message.clone(),
                },
                _ => SystemServiceStatus {
                    name: get_service_name(path),
                    state: ServiceState::Pending,
                    message: None,
                },
            };

            (path.clone(), status)
        })
        .collect()
}

fn aggregate_system_state(status: &SystemStatus, removing_services: bool) -> (SystemState, Option<String>) {
    let failed = status
        .services
        .iter()
        .filter(|(_, service)| service.state == ServiceState::Failed)
        .map(|(path, _)| path)
        .join(", ");

    if !failed.is_empty() {
        return (SystemState::Degraded, Some(format!("failed services: {failed}")));
    }

    let all_stable = status
        .services
        .values()
        .all(|service| service.state == ServiceState::Stable);

    match (all_stable, removing_services) {
        (true, false) => (SystemState::Stable, None),
        (true, true) => (
            SystemState::Updating,
            Some("removing services".to_owned()),
        ),
        (false, _) => (SystemState::Updating, None),
    }
}

async fn cleanup(system: &System, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = system.status.clone().unwrap_or_default();
    let client = &context.client;

    let status = SystemStatus {
        state: SystemState::Deleting,
        message: None,
        ..current.clone()
    };
    update_status(system, &current, status, context).await?;

    // lifecycle requests first so nothing gets deployed while draining
    let drained = drain::<Deploy>(client, namespace).await?
        && drain::<Teardown>(client, namespace).await?
        && drain::<Service>(client, namespace).await?
        && drain::<Job>(client, namespace).await?
        && drain::<Build>(client, namespace).await?
        && drain::<NodePool>(client, namespace).await?;

    if !drained {
        return Err(ReconcilerError::RetryAfter(DELETION_REQUEUE));
    }

    info!("System '{name}' was cleaned up!");

    Ok(Action::await_change())
}

/// Deletes every resource of a kind in the namespace, `true` once none are left.
async fn drain<T>(client: &Client, namespace: &str) -> Result<bool, ReconcilerError>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    let remaining = list_resources::<T>(client, namespace, &ListParams::default()).await?;

    for resource in remaining.iter().filter(|resource| !resource.is_deleted()) {
        try_remove_resource::<T>(client, &resource.name_any(), namespace, &background_deletion())
            .await?;
    }

    Ok(remaining.is_empty())
}

async fn update_status(
    system: &System,
    current: &SystemStatus,
    status: SystemStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    if status == *current {
        return Ok(());
    }

    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;

    if status.state != current.state {
        context
            .events
            .normal(
                system,
                REASON_STATE_CHANGED,
                "ReconcileSystem",
                status.message.clone().unwrap_or_else(|| status.state.to_string()),
            )
            .await;
    }

    apply_resource_status::<System, _>(&context.client, status, name, namespace, &apply_params())
        .await?;

    Ok(())
}
