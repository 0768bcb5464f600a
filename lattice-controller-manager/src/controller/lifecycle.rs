use std::sync::Arc;

use futures::StreamExt;
use kube::{
    runtime::{reflector::ObjectRef, watcher::Config, Controller},
    Resource, ResourceExt,
};
use lattice_core::{
    kubernetes::GetApi,
    resources::{
        crd::v1::{build::Build, deploy::Deploy, system::System, teardown::Teardown},
        meta::try_get_system_id,
    },
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded,
    reconciler::{context::ReconcilerContext, lifecycle::reconcile_lifecycle},
};

pub async fn start_lifecycle_controller(context: Arc<ReconcilerContext>) {
    info!("Creating lifecycle controller...");

    let watcher_config = Config::default();
    let prefix = context.settings.namespace_prefix.clone();
    let deploy_prefix = prefix.clone();
    let teardown_prefix = prefix.clone();
    let build_prefix = prefix;

    let controller = Controller::new(context.global_api::<System>(), watcher_config.clone())
        .watches(
            context.global_api::<Deploy>(),
            watcher_config.clone(),
            move |deploy| get_namespace_system(&deploy_prefix, &deploy),
        )
        .watches(
            context.global_api::<Teardown>(),
            watcher_config.clone(),
            move |teardown| get_namespace_system(&teardown_prefix, &teardown),
        )
        .watches(
            context.global_api::<Build>(),
            watcher_config,
            move |build| get_namespace_system(&build_prefix, &build),
        )
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_lifecycle),
            error_policy::<System>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<System, _>);

    info!("Lifecycle controller created!");

    controller.await;

    info!("Exiting lifecycle controller!");
}

/// Every tenant namespace holds a single system named after its id.
fn get_namespace_system<K: Resource>(prefix: &str, resource: &K) -> Option<ObjectRef<System>> {
    let namespace = resource.namespace()?;
    let system = try_get_system_id(prefix, &namespace)?;

    Some(ObjectRef::new(system).within(&namespace))
}

#[cfg(test)]
mod tests {
    use lattice_core::resources::crd::v1::deploy::DeploySpec;

    use super::*;

    #[test]
    fn requests_map_to_the_system_of_their_namespace() {
        let mut deploy = Deploy::new("release-1", DeploySpec::default());
        deploy.metadata.namespace = Some("lattice-system-demo".to_owned());

        let system = get_namespace_system("lattice", &deploy).unwrap();

        assert_eq!(system.name, "demo");
        assert_eq!(system.namespace.as_deref(), Some("lattice-system-demo"));

        deploy.metadata.namespace = Some("kube-system".to_owned());

        assert!(get_namespace_system("lattice", &deploy).is_none());
    }
}
