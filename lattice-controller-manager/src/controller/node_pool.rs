use std::sync::Arc;

use futures::StreamExt;
use kube::{
    runtime::{reflector::ObjectRef, watcher::Config, Controller},
    ResourceExt,
};
use lattice_core::{
    kubernetes::GetApi,
    resources::{
        annotations::{get_json_annotation, ServiceNodePoolEpochs, SERVICE_NODE_POOLS_ANNOTATION},
        crd::v1::{node_pool::NodePool, service::Service},
    },
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded,
    reconciler::{context::ReconcilerContext, node_pool::reconcile_node_pool},
};

pub async fn start_node_pool_controller(context: Arc<ReconcilerContext>) {
    info!("Creating node pool controller...");

    let watcher_config = Config::default();
    let controller = Controller::new(context.global_api::<NodePool>(), watcher_config.clone())
        .watches(
            context.global_api::<Service>(),
            watcher_config,
            get_service_node_pools,
        )
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_node_pool),
            error_policy::<NodePool>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<NodePool, _>);

    info!("Node pool controller created!");

    controller.await;

    info!("Exiting node pool controller!");
}

/// Pools a service moved off of may be waiting to retire an epoch.
fn get_service_node_pools(service: Service) -> Vec<ObjectRef<NodePool>> {
    let Some(namespace) = service.namespace() else {
        return Vec::new();
    };

    get_json_annotation::<ServiceNodePoolEpochs>(
        Some(service.annotations()),
        SERVICE_NODE_POOLS_ANNOTATION,
    )
    .and_then(Result::ok)
    .unwrap_or_default()
    .into_keys()
    .map(|pool| ObjectRef::new(&pool).within(&namespace))
    .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lattice_core::resources::{
        annotations::to_json_annotation, crd::v1::service::ServiceSpec,
    };

    use super::*;

    #[test]
    fn annotated_pools_are_notified() {
        let epochs = ServiceNodePoolEpochs::from([
            ("shared-general.shop".to_owned(), vec![1]),
            ("svc-api.shop".to_owned(), vec![2, 3]),
        ]);
        let mut service = Service::new("api.shop", ServiceSpec::default());
        service.metadata.namespace = Some("lattice-system-demo".to_owned());
        service.metadata.annotations = Some(BTreeMap::from([to_json_annotation(
            SERVICE_NODE_POOLS_ANNOTATION,
            &epochs,
        )
        .unwrap()]));

        let pools = get_service_node_pools(service)
            .into_iter()
            .map(|reference| reference.name)
            .collect::<Vec<_>>();

        assert_eq!(pools, vec!["shared-general.shop", "svc-api.shop"]);
    }

    #[test]
    fn services_without_the_annotation_notify_nothing() {
        let mut service = Service::new("api.shop", ServiceSpec::default());
        service.metadata.namespace = Some("lattice-system-demo".to_owned());

        assert!(get_service_node_pools(service).is_empty());
    }
}
