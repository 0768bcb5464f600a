use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::runtime::{watcher::Config, Controller};
use lattice_core::{kubernetes::GetApi, resources::crd::v1::container_build::ContainerBuild};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded, managed_watcher_config,
    reconciler::{container_build::reconcile_container_build, context::ReconcilerContext},
};

pub async fn start_container_build_controller(context: Arc<ReconcilerContext>) {
    info!("Creating container build controller...");

    let controller = Controller::new(context.global_api::<ContainerBuild>(), Config::default())
        .owns(context.global_api::<BatchJob>(), managed_watcher_config())
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_container_build),
            error_policy::<ContainerBuild>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<ContainerBuild, _>);

    info!("Container build controller created!");

    controller.await;

    info!("Exiting container build controller!");
}
