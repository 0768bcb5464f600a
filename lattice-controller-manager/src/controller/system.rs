use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher::Config, Controller};
use lattice_core::{
    kubernetes::GetApi,
    resources::crd::v1::{
        build::Build, deploy::Deploy, job::Job, node_pool::NodePool, service::Service,
        system::System, teardown::Teardown,
    },
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded,
    reconciler::{context::ReconcilerContext, system::reconcile_system},
};

pub async fn start_system_controller(context: Arc<ReconcilerContext>) {
    info!("Creating system controller...");

    let watcher_config = Config::default();
    let controller = Controller::new(context.global_api::<System>(), watcher_config.clone())
        .owns(context.global_api::<Service>(), watcher_config.clone())
        .owns(context.global_api::<NodePool>(), watcher_config.clone())
        .owns(context.global_api::<Build>(), watcher_config.clone())
        .owns(context.global_api::<Job>(), watcher_config.clone())
        .owns(context.global_api::<Deploy>(), watcher_config.clone())
        .owns(context.global_api::<Teardown>(), watcher_config)
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_system),
            error_policy::<System>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<System, _>);

    info!("System controller created!");

    controller.await;

    info!("Exiting system controller!");
}
