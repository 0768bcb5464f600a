use std::{collections::BTreeSet, sync::Arc, time::Duration};

use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    ResourceExt,
};
use lattice_core::{
    helpers::RequireMetadata,
    kubernetes::{
        operations::{apply_resource_status, list_resources},
        GetApi,
    },
    resources::{
        annotations::{get_json_annotation, ServiceNodePoolEpochs, SERVICE_NODE_POOLS_ANNOTATION},
        crd::v1::{
            node_pool::{NodePool, NodePoolEpochStatus, NodePoolSpec, NodePoolState, NodePoolStatus},
            service::Service,
        },
        labels::get_node_pool_listparams,
        meta::{get_node_pool_id, NODE_POOL_FINALIZER},
        workload::job_run::get_active_run_epochs,
    },
};
use log::{info, warn};

use crate::{
    controller::{
        events::{REASON_DELETED, REASON_PROVIDER_REJECTED, REASON_STATE_CHANGED},
        requeue_with_jitter,
    },
    provider::cloud::NodePoolProvisioning,
};

use super::{
    apply_params, context::ReconcilerContext, error::ReconcilerError, PROGRESS_REQUEUE,
    SUCCESS_REQUEUE,
};

pub async fn reconcile_node_pool(
    object: Arc<NodePool>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api = context.namespaced_api::<NodePool>(namespace);

    finalizer(&api, NODE_POOL_FINALIZER, object, |event| async {
        match event {
            FinalizerEvent::Apply(node_pool) => try_reconcile(&node_pool, &context).await,
            FinalizerEvent::Cleanup(node_pool) => cleanup(&node_pool, &context).await,
        }
    })
    .await
    .map_err(ReconcilerError::from)
}

async fn try_reconcile(
    node_pool: &NodePool,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let name = node_pool.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = node_pool.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = node_pool.status.clone().unwrap_or_default();
    let plan = plan_epoch(&current, &node_pool.spec);
    let cloud = &context.providers.cloud;

    let provisioning = match plan.action {
        EpochAction::Hold => return Ok(Action::await_change()),
        EpochAction::Observe => {
            cloud
                .node_pool_state(node_pool, plan.epoch, &node_pool.spec)
                .await
        }
        EpochAction::Provision => {
            info!(
                "Provisioning epoch {} of '{name}' node pool in '{namespace}' namespace...",
                plan.epoch
            );

            cloud
                .provision_node_pool(node_pool, plan.epoch, &node_pool.spec)
                .await
        }
    };

    let provisioning = match provisioning {
        Ok(provisioning) => provisioning,
        Err(error) if error.is_terminal() => {
            warn!("Node pool '{name}' was rejected by the cloud provider! {error}");

            context
                .events
                .warning(
                    node_pool,
                    REASON_PROVIDER_REJECTED,
                    "ProvisionNodePool",
                    error.to_string(),
                )
                .await;

            NodePoolProvisioning {
                state: NodePoolState::Failed,
                message: Some(error.to_string()),
                retry_after: None,
            }
        }
        Err(error) => return Err(error.into()),
    };

    let mut status = current.clone();
    let mut retry_after = provisioning.retry_after;

    status.epochs.insert(
        plan.epoch,
        NodePoolEpochStatus {
            spec: node_pool.spec.clone(),
            state: provisioning.state,
            message: provisioning.message,
        },
    );

    if provisioning.state == NodePoolState::Stable && status.epochs.len() > 1 {
        let services = list_resources::<Service>(&context.client, namespace, &ListParams::default())
            .await?;
        let runs = list_resources::<BatchJob>(
            &context.client,
            namespace,
            &get_node_pool_listparams(&get_node_pool_id(namespace, name)),
        )
        .await?;
        let mut referenced = get_referenced_epochs(&services, name);
        referenced.extend(get_active_run_epochs(&runs));

        for epoch in get_retirable_epochs(&status, plan.epoch, &referenced) {
            context.ensure_running()?;

            info!("Retiring epoch {epoch} of '{name}' node pool...");

            let epoch_retry = cloud.deprovision_node_pool(node_pool, epoch).await?;
            retry_after = record_retirement(&mut status, epoch, epoch_retry, retry_after);
        }
    }

    let (state, message) = aggregate_node_pool_state(&status, plan.epoch);
    status.state = state;
    status.message = message;
    status.observed_generation = node_pool.metadata.generation;

    if status != current {
        if status.state != current.state {
            context
                .events
                .normal(
                    node_pool,
                    REASON_STATE_CHANGED,
                    "ReconcileNodePool",
                    status.state.to_string(),
                )
                .await;
        }

        apply_resource_status::<NodePool, _>(
            &context.client,
            status.clone(),
            name,
            namespace,
            &apply_params(),
        )
        .await?;
    }

    Ok(match (retry_after, status.state) {
        (Some(delay), _) => Action::requeue(delay),
        (None, NodePoolState::Failed) => Action::await_change(),
        (None, NodePoolState::Stable) => requeue_with_jitter(SUCCESS_REQUEUE),
        (None, _) => requeue_with_jitter(PROGRESS_REQUEUE),
    })
}

async fn cleanup(node_pool: &NodePool, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let name = node_pool.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = node_pool.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = node_pool.status.clone().unwrap_or_default();
    let mut status = current.clone();
    let mut retry_after = None;

    for epoch in current.epochs.keys().copied() {
        context.ensure_running()?;

        let epoch_retry = context
            .providers
            .cloud
            .deprovision_node_pool(node_pool, epoch)
            .await?;
        retry_after = record_retirement(&mut status, epoch, epoch_retry, retry_after);
    }

    let Some(delay) = retry_after else {
        context
            .events
            .normal(
                node_pool,
                REASON_DELETED,
                "DeprovisionNodePool",
                format!("Node pool '{name}' was deprovisioned"),
            )
            .await;

        return Ok(Action::await_change());
    };

    status.state = NodePoolState::Deleting;
    status.message = None;

    if status != current {
        apply_resource_status::<NodePool, _>(
            &context.client,
            status,
            name,
            namespace,
            &apply_params(),
        )
        .await?;
    }

    Err(ReconcilerError::RetryAfter(delay))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EpochAction {
    Provision,
    Observe,
    /// the epoch failed for good, only a spec change can help
    Hold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EpochPlan {
    epoch: u64,
    action: EpochAction,
}

/// Epoch the desired spec lives in. A new instance type needs new nodes and
/// opens the next epoch, anything else is applied to the current one.
fn plan_epoch(status: &NodePoolStatus, desired: &NodePoolSpec) -> EpochPlan {
    let Some((epoch, current)) = status.current_epoch() else {
        return EpochPlan {
            epoch: 1,
            action: EpochAction::Provision,
        };
    };

    if current.spec.requires_new_epoch(desired) {
        return EpochPlan {
            epoch: epoch + 1,
            action: EpochAction::Provision,
        };
    }

    let action = match (current.spec == *desired, current.state) {
        (false, _) => EpochAction::Provision,
        (true, NodePoolState::Failed) => EpochAction::Hold,
        (true, _) => EpochAction::Observe,
    };

    EpochPlan { epoch, action }
}

/// Epochs some service may still have pods on, read from the services' annotations.
fn get_referenced_epochs(services: &[Service], node_pool: &str) -> BTreeSet<u64> {
    services
        .iter()
        .filter_map(|service| {
            get_json_annotation::<ServiceNodePoolEpochs>(
                Some(service.annotations()),
                SERVICE_NODE_POOLS_ANNOTATION,
            )?
            .ok()
        })
        .filter_map(|mut epochs| epochs.remove(node_pool))
        .flatten()
        .collect()
}

fn get_retirable_epochs(status: &NodePoolStatus, target: u64, referenced: &BTreeSet<u64>) -> Vec<u64> {
    status
        .epochs
        .keys()
        .copied()
        .filter(|epoch| *epoch < target && !referenced.contains(epoch))
        .collect()
}

/// Drops a fully deprovisioned epoch, or marks it as deleting and keeps the
/// shortest requeue hint.
fn record_retirement(
    status: &mut NodePoolStatus,
    epoch: u64,
    epoch_retry: Option<Duration>,
    retry_after: Option<Duration>,
) -> Option<Duration> {
    match epoch_retry {
        None => {
            status.epochs.remove(&epoch);
            retry_after
        }
        Some(delay) => {
            if let Some(epoch_status) = status.epochs.get_mut(&epoch) {
                epoch_status.state = NodePoolState::Deleting;
            }

            Some(retry_after.map_or(delay, |retry_after| retry_after.min(delay)))
        }
    }
}

fn aggregate_node_pool_state(status: &NodePoolStatus, target: u64) -> (NodePoolState, Option<String>) {
    let Some(target_status) = status.epochs.get(&target) else {
        return (NodePoolState::Pending, None);
    };

    match target_status.state {
        NodePoolState::Failed => (NodePoolState::Failed, target_status.message.clone()),
        _ if status.epochs.len() > 1 => (
            NodePoolState::Scaling,
            Some(format!(
                "moving to epoch {target}, {} older epoch(s) left",
                status.epochs.len() - 1
            )),
        ),
        state => (state, target_status.message.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lattice_core::resources::{
        annotations::to_json_annotation, crd::v1::service::ServiceSpec,
    };

    use super::*;

    fn spec(instance_type: &str, num_instances: i32) -> NodePoolSpec {
        NodePoolSpec {
            instance_type: instance_type.to_owned(),
            num_instances,
            autoscaling: None,
        }
    }

    fn status(epochs: &[(u64, NodePoolSpec, NodePoolState)]) -> NodePoolStatus {
        NodePoolStatus {
            epochs: epochs
                .iter()
                .map(|(epoch, spec, state)| {
                    (
                        *epoch,
                        NodePoolEpochStatus {
                            spec: spec.clone(),
                            state: *state,
                            message: None,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    fn service(epochs: &[(&str, Vec<u64>)]) -> Service {
        let epochs = epochs
            .iter()
            .map(|(pool, epochs)| (pool.to_string(), epochs.clone()))
            .collect::<ServiceNodePoolEpochs>();
        let mut service = Service::new("api.shop", ServiceSpec::default());
        service.metadata.annotations = Some(BTreeMap::from([to_json_annotation(
            SERVICE_NODE_POOLS_ANNOTATION,
            &epochs,
        )
        .unwrap()]));

        service
    }

    #[test]
    fn first_epoch_is_provisioned() {
        assert_eq!(
            plan_epoch(&NodePoolStatus::default(), &spec("m5.large", 2)),
            EpochPlan {
                epoch: 1,
                action: EpochAction::Provision
            }
        );
    }

    #[test]
    fn resize_stays_in_the_epoch_and_retype_opens_a_new_one() {
        let current = status(&[(1, spec("m5.large", 2), NodePoolState::Stable)]);

        assert_eq!(
            plan_epoch(&current, &spec("m5.large", 2)),
            EpochPlan {
                epoch: 1,
                action: EpochAction::Observe
            }
        );
        assert_eq!(
            plan_epoch(&current, &spec("m5.large", 4)),
            EpochPlan {
                epoch: 1,
                action: EpochAction::Provision
            }
        );
        assert_eq!(
            plan_epoch(&current, &spec("m5.xlarge", 2)),
            EpochPlan {
                epoch: 2,
                action: EpochAction::Provision
            }
        );
    }

    #[test]
    fn failed_epoch_is_held_until_the_spec_changes() {
        let current = status(&[(1, spec("m5.huge", 2), NodePoolState::Failed)]);

        assert_eq!(plan_epoch(&current, &spec("m5.huge", 2)).action, EpochAction::Hold);
        assert_eq!(
            plan_epoch(&current, &spec("m5.large", 2)),
            EpochPlan {
                epoch: 2,
                action: EpochAction::Provision
            }
        );
    }

    #[test]
    fn only_unreferenced_older_epochs_are_retired() {
        let current = status(&[
            (1, spec("m5.large", 2), NodePoolState::Stable),
            (2, spec("m5.xlarge", 2), NodePoolState::Stable),
            (3, spec("m5.2xlarge", 2), NodePoolState::Stable),
        ]);
        let services = vec![
            service(&[("svc-api.shop", vec![2, 3])]),
            service(&[("svc-other.shop", vec![1])]),
        ];
        let referenced = get_referenced_epochs(&services, "svc-api.shop");

        assert_eq!(referenced, BTreeSet::from([2, 3]));
        assert_eq!(get_retirable_epochs(&current, 3, &referenced), vec![1]);
    }

    #[test]
    fn retirement_keeps_the_shortest_retry() {
        let mut current = status(&[
            (1, spec("m5.large", 2), NodePoolState::Stable),
            (2, spec("m5.xlarge", 2), NodePoolState::Stable),
            (3, spec("m5.2xlarge", 2), NodePoolState::Stable),
        ]);

        let retry = record_retirement(&mut current, 1, Some(Duration::from_secs(30)), None);
        let retry = record_retirement(&mut current, 2, None, retry);

        assert_eq!(retry, Some(Duration::from_secs(30)));
        assert_eq!(current.epochs[&1].state, NodePoolState::Deleting);
        assert!(!current.epochs.contains_key(&2));
        assert_eq!(
            aggregate_node_pool_state(&current, 3).0,
            NodePoolState::Scaling
        );
    }

    #[test]
    fn pool_state_follows_the_target_epoch() {
        let single = status(&[(1, spec("m5.large", 2), NodePoolState::Stable)]);
        let failed = status(&[
            (1, spec("m5.large", 2), NodePoolState::Stable),
            (2, spec("m5.huge", 2), NodePoolState::Failed),
        ]);

        assert_eq!(
            aggregate_node_pool_state(&single, 1),
            (NodePoolState::Stable, None)
        );
        assert_eq!(aggregate_node_pool_state(&failed, 2).0, NodePoolState::Failed);
        assert_eq!(
            aggregate_node_pool_state(&NodePoolStatus::default(), 1).0,
            NodePoolState::Pending
        );
    }
}
