use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{reflector::ObjectRef, watcher::Config, Controller},
    ResourceExt,
};
use lattice_core::{
    definition::path::NodePoolPath,
    kubernetes::GetApi,
    resources::{
        crd::v1::{address::Address, node_pool::NodePool, service::Service},
        meta::get_shared_node_pool_name,
    },
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded, managed_watcher_config,
    reconciler::{context::ReconcilerContext, service::reconcile_service},
};

pub async fn start_service_controller(context: Arc<ReconcilerContext>) {
    info!("Creating service controller...");

    let watcher_config = Config::default();
    let controller = Controller::new(context.global_api::<Service>(), watcher_config.clone());
    let services = controller.store();

    let controller = controller
        .owns(context.global_api::<Deployment>(), managed_watcher_config())
        .owns(context.global_api::<Address>(), watcher_config.clone())
        .owns(context.global_api::<NodePool>(), watcher_config.clone())
        .watches(
            context.global_api::<NodePool>(),
            watcher_config,
            move |node_pool| get_shared_pool_services(&services.state(), &node_pool),
        )
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_service),
            error_policy::<Service>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<Service, _>);

    info!("Service controller created!");

    controller.await;

    info!("Exiting service controller!");
}

/// Shared pools aren't owned by the services running on them.
fn get_shared_pool_services(services: &[Arc<Service>], node_pool: &NodePool) -> Vec<ObjectRef<Service>> {
    let name = node_pool.name_any();
    let namespace = node_pool.namespace();

    services
        .iter()
        .filter(|service| service.namespace() == namespace)
        .filter(|service| {
            service
                .spec
                .shared_node_pool
                .as_deref()
                .and_then(|path| path.parse::<NodePoolPath>().ok())
                .is_some_and(|path| get_shared_node_pool_name(&path) == name)
        })
        .map(|service| ObjectRef::from_obj(service.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use lattice_core::resources::crd::v1::{node_pool::NodePoolSpec, service::ServiceSpec};

    use super::*;

    fn service(name: &str, namespace: &str, shared_node_pool: Option<&str>) -> Arc<Service> {
        let mut service = Service::new(
            name,
            ServiceSpec {
                shared_node_pool: shared_node_pool.map(str::to_owned),
                ..Default::default()
            },
        );
        service.metadata.namespace = Some(namespace.to_owned());

        Arc::new(service)
    }

    #[test]
    fn services_on_a_shared_pool_are_notified() {
        let mut node_pool = NodePool::new("shared-general.shop", NodePoolSpec::default());
        node_pool.metadata.namespace = Some("lattice-system-demo".to_owned());

        let services = vec![
            service("api.shop", "lattice-system-demo", Some("/shop:general")),
            service("web.shop", "lattice-system-demo", None),
            service("api.shop", "lattice-system-other", Some("/shop:general")),
            service("db.shop", "lattice-system-demo", Some("/shop:storage")),
        ];

        let notified = get_shared_pool_services(&services, &node_pool);

        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].name, "api.shop");
        assert_eq!(notified[0].namespace.as_deref(), Some("lattice-system-demo"));
    }
}
