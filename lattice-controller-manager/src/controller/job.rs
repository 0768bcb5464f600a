use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::runtime::{watcher::Config, Controller};
use lattice_core::{
    kubernetes::GetApi,
    resources::crd::v1::{job::Job, node_pool::NodePool},
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded, managed_watcher_config,
    reconciler::{context::ReconcilerContext, job::reconcile_job},
};

pub async fn start_job_controller(context: Arc<ReconcilerContext>) {
    info!("Creating job controller...");

    let controller = Controller::new(context.global_api::<Job>(), Config::default())
        .owns(context.global_api::<BatchJob>(), managed_watcher_config())
        .owns(context.global_api::<NodePool>(), Config::default())
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_job),
            error_policy::<Job>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<Job, _>);

    info!("Job controller created!");

    controller.await;

    info!("Exiting job controller!");
}
