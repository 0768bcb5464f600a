use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{reflector::ObjectRef, watcher::Config, Controller},
    Resource, ResourceExt,
};
use lattice_core::{
    kubernetes::GetApi,
    resources::{
        crd::v1::{address::Address, service::Service},
        meta::get_address_name,
    },
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded, managed_watcher_config,
    reconciler::{address::reconcile_address, context::ReconcilerContext},
};

pub async fn start_address_controller(context: Arc<ReconcilerContext>) {
    info!("Creating address controller...");

    let watcher_config = Config::default();
    let controller = Controller::new(context.global_api::<Address>(), watcher_config.clone())
        .watches(
            context.global_api::<Service>(),
            watcher_config,
            |service| get_service_address(&service),
        )
        .watches(
            context.global_api::<Deployment>(),
            managed_watcher_config(),
            |deployment| get_workload_address(&deployment),
        )
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_address),
            error_policy::<Address>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<Address, _>);

    info!("Address controller created!");

    controller.await;

    info!("Exiting address controller!");
}

fn get_service_address(service: &Service) -> Option<ObjectRef<Address>> {
    Some(ObjectRef::new(&get_address_name(&service.spec.path)).within(&service.namespace()?))
}

/// Mesh ports live on the workload, the address of a service shares its name.
fn get_workload_address(deployment: &Deployment) -> Option<ObjectRef<Address>> {
    let is_service_workload = deployment
        .owner_references()
        .iter()
        .any(|owner| owner.kind == Service::kind(&()) && owner.controller == Some(true));

    is_service_workload
        .then(|| Some(ObjectRef::new(&deployment.name_any()).within(&deployment.namespace()?)))
        .flatten()
}
