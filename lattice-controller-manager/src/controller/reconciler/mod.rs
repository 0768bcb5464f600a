use std::{fmt::Debug, time::Duration};

use k8s_openapi::{
    serde::{de::DeserializeOwned, Serialize},
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, PatchParams, PropagationPolicy},
    core::ObjectMeta,
    Client, Resource,
};
use lattice_core::{
    definition::{
        component::NodePoolDefinition,
        path::{NodePoolPath, TreePath},
    },
    kubernetes::operations::{apply_resource, try_get_resource, try_remove_resource},
    resources::{
        crd::v1::node_pool::{NodePool, NodePoolSpec, NodePoolState},
        labels::get_system_labels,
        meta::{get_dedicated_node_pool_name, get_node_pool_id, get_shared_node_pool_name},
        workload::NodePoolPlacement,
    },
    FIELD_MANAGER,
};
use log::warn;

use self::error::ReconcilerError;

pub mod address;
pub mod build;
pub mod container_build;
pub mod context;
pub mod error;
pub mod job;
pub mod lifecycle;
pub mod node_pool;
pub mod service;
pub mod system;

pub const SUCCESS_REQUEUE: Duration = Duration::from_secs(60 * 5);
pub const PROGRESS_REQUEUE: Duration = Duration::from_secs(30);
pub const DELETION_REQUEUE: Duration = Duration::from_secs(5);

pub fn apply_params() -> PatchParams {
    PatchParams::apply(FIELD_MANAGER).force()
}

pub fn background_deletion() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

/// Failure statuses are written on a best effort basis, the reconcile error
/// is what goes back to the controller.
pub fn warn_on_status_error<K>(object: &K, result: Result<(), ReconcilerError>)
where
    K: Resource<DynamicType = ()>,
{
    if let Err(error) = result {
        warn!(
            "Couldn't record the failure of {} '{}' in its status! {error}",
            K::kind(&()).to_lowercase(),
            object.meta().name.as_deref().unwrap_or_default()
        );
    }
}

/// Deletes the resource and reports whether it's already gone.
pub async fn remove_and_check<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<bool, ReconcilerError>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    if try_get_resource::<T>(client, name, namespace).await?.is_none() {
        return Ok(true);
    }

    try_remove_resource::<T>(client, name, namespace, &background_deletion()).await?;

    Ok(try_get_resource::<T>(client, name, namespace)
        .await?
        .is_none())
}

/// Name of the node pool a workload runs on, if it asks for one.
pub fn get_workload_node_pool_name(
    path: &TreePath,
    dedicated: Option<&NodePoolDefinition>,
    shared: Option<&str>,
) -> Result<Option<String>, ReconcilerError> {
    match (dedicated, shared) {
        (Some(_), None) => Ok(Some(get_dedicated_node_pool_name(path))),
        (None, Some(shared)) => {
            let shared = shared.parse::<NodePoolPath>().map_err(|error| {
                ReconcilerError::InvalidObjectData(format!("shared node pool: {error}").into())
            })?;

            Ok(Some(get_shared_node_pool_name(&shared)))
        }
        (None, None) => Ok(None),
        (Some(_), Some(_)) => Err(ReconcilerError::InvalidObjectData(
            "workload can't use both a dedicated and a shared node pool".into(),
        )),
    }
}

/// Applies a node pool controlled by `owner`, a workload or the system sharing it.
/// Autoscaled pools keep the size they currently have.
pub async fn apply_node_pool<K>(
    client: &Client,
    owner: &K,
    name: &str,
    system: &str,
    definition: &NodePoolDefinition,
) -> Result<NodePool, ReconcilerError>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = owner
        .meta()
        .namespace
        .as_deref()
        .ok_or(ReconcilerError::MissingObjectMetadata)?;
    let owner_reference = owner
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;
    let existing = try_get_resource::<NodePool>(client, name, namespace).await?;
    let node_pool = NodePool {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            labels: Some(get_system_labels(system)),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: NodePoolSpec::from_definition(
            definition,
            existing.as_ref().map(|node_pool| &node_pool.spec),
        ),
        status: None,
    };

    Ok(apply_resource(client, &node_pool, &apply_params()).await?)
}

/// Whether a workload can be scheduled onto a node pool right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePoolAvailability {
    Ready(NodePoolPlacement),
    Waiting(NodePoolState),
    Failed(String),
}

/// Picks the newest epoch that accepts workloads. While a new epoch is being
/// provisioned workloads stay on the previous one.
pub fn get_node_pool_availability(namespace: &str, node_pool: &NodePool) -> NodePoolAvailability {
    let name = node_pool.metadata.name.as_deref().unwrap_or_default();
    let Some(status) = node_pool.status.as_ref() else {
        return NodePoolAvailability::Waiting(NodePoolState::Pending);
    };

    let usable = status
        .epochs
        .iter()
        .rev()
        .find(|(_, epoch)| epoch.state.is_usable());

    match (usable, status.state) {
        (Some((epoch, _)), _) => NodePoolAvailability::Ready(NodePoolPlacement::new(
            &get_node_pool_id(namespace, name),
            *epoch,
        )),
        (None, NodePoolState::Failed) => NodePoolAvailability::Failed(
            status
                .message
                .clone()
                .unwrap_or_else(|| NodePoolState::Failed.to_string()),
        ),
        (None, state) => NodePoolAvailability::Waiting(state),
    }
}

#[cfg(test)]
mod tests {
    use lattice_core::resources::crd::v1::node_pool::{
        NodePoolEpochStatus, NodePoolSpec, NodePoolStatus,
    };

    use super::*;

    fn pool(epochs: &[(u64, NodePoolState)], state: NodePoolState) -> NodePool {
        let mut pool = NodePool::new("svc-api.shop", NodePoolSpec::default());
        pool.status = Some(NodePoolStatus {
            state,
            message: Some("instance type rejected".to_owned()),
            epochs: epochs
                .iter()
                .map(|(epoch, state)| {
                    (
                        *epoch,
                        NodePoolEpochStatus {
                            state: *state,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
            ..Default::default()
        });

        pool
    }

    #[test]
    fn failed_status_writes_are_only_logged() {
        let pool = pool(&[], NodePoolState::Failed);

        warn_on_status_error(&pool, Ok(()));
        warn_on_status_error(&pool, Err(ReconcilerError::MissingObjectMetadata));
    }

    #[test]
    fn workloads_stay_on_the_old_epoch_until_the_new_one_is_usable() {
        let pool = pool(
            &[(1, NodePoolState::Stable), (2, NodePoolState::Pending)],
            NodePoolState::Scaling,
        );

        assert_eq!(
            get_node_pool_availability("lattice-system-demo", &pool),
            NodePoolAvailability::Ready(NodePoolPlacement::new(
                "svc-api.shop.lattice-system-demo",
                1
            ))
        );
    }

    #[test]
    fn failed_pool_without_usable_epochs_fails_the_workload() {
        let pool = pool(&[(1, NodePoolState::Failed)], NodePoolState::Failed);

        assert_eq!(
            get_node_pool_availability("lattice-system-demo", &pool),
            NodePoolAvailability::Failed("instance type rejected".to_owned())
        );
    }

    #[test]
    fn unprovisioned_pool_is_waited_for() {
        let mut unobserved = pool(&[], NodePoolState::Pending);
        unobserved.status = None;

        assert_eq!(
            get_node_pool_availability("lattice-system-demo", &unobserved),
            NodePoolAvailability::Waiting(NodePoolState::Pending)
        );
        assert_eq!(
            get_node_pool_availability(
                "lattice-system-demo",
                &pool(&[(1, NodePoolState::Pending)], NodePoolState::Pending)
            ),
            NodePoolAvailability::Waiting(NodePoolState::Pending)
        );
    }

    #[test]
    fn workload_pool_names_follow_the_pool_kind() {
        let path = TreePath::new("/shop/api").unwrap();

        assert_eq!(
            get_workload_node_pool_name(&path, Some(&NodePoolDefinition::default()), None)
                .unwrap()
                .as_deref(),
            Some("svc-api.shop")
        );
        assert_eq!(
            get_workload_node_pool_name(&path, None, Some("/shop:general"))
                .unwrap()
                .as_deref(),
            Some("shared-general.shop")
        );
        assert_eq!(get_workload_node_pool_name(&path, None, None).unwrap(), None);
        assert!(get_workload_node_pool_name(&path, None, Some("no-separator")).is_err());
    }
}
