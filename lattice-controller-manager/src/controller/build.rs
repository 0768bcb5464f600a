use std::sync::Arc;

use futures::StreamExt;
use kube::{
    runtime::{reflector::ObjectRef, watcher::Config, Controller},
    Resource, ResourceExt,
};
use lattice_core::{
    kubernetes::GetApi,
    resources::crd::v1::{build::Build, container_build::ContainerBuild},
};
use log::info;

use crate::helpers::handle_reconciliation_result;

use super::{
    controller_config, error_policy, guarded,
    reconciler::{build::reconcile_build, context::ReconcilerContext},
};

pub async fn start_build_controller(context: Arc<ReconcilerContext>) {
    info!("Creating build controller...");

    let watcher_config = Config::default();
    let controller = Controller::new(context.global_api::<Build>(), watcher_config.clone())
        .watches(
            context.global_api::<ContainerBuild>(),
            watcher_config,
            get_referencing_builds,
        )
        .with_config(controller_config(&context))
        .reconcile_all_on(context.config.changes())
        .graceful_shutdown_on(context.shutdown.wait())
        .run(
            |object, context| guarded(object, context, reconcile_build),
            error_policy::<Build>,
            context.clone(),
        )
        .for_each(handle_reconciliation_result::<Build, _>);

    info!("Build controller created!");

    controller.await;

    info!("Exiting build controller!");
}

/// Container builds are shared between builds, every build referencing one
/// (as controller or not) gets notified.
fn get_referencing_builds(container_build: ContainerBuild) -> Vec<ObjectRef<Build>> {
    let namespace = container_build.namespace();
    let kind = Build::kind(&());

    container_build
        .owner_references()
        .iter()
        .filter(|owner| owner.kind == kind && owner.api_version == Build::api_version(&()))
        .map(|owner| {
            let reference = ObjectRef::new(&owner.name);

            match &namespace {
                Some(namespace) => reference.within(namespace),
                None => reference,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use lattice_core::resources::crd::v1::container_build::ContainerBuildSpec;

    use super::*;

    #[test]
    fn every_build_owner_is_notified() {
        let owner = |kind: &str, name: &str| OwnerReference {
            api_version: "lattice.dev/v1".to_owned(),
            kind: kind.to_owned(),
            name: name.to_owned(),
            ..Default::default()
        };
        let mut container_build = ContainerBuild::new("abc-0", ContainerBuildSpec::default());
        container_build.metadata.namespace = Some("lattice-system-demo".to_owned());
        container_build.metadata.owner_references = Some(vec![
            owner("Build", "first"),
            owner("System", "demo"),
            owner("Build", "second"),
        ]);

        let builds = get_referencing_builds(container_build)
            .into_iter()
            .map(|reference| (reference.name, reference.namespace))
            .collect::<Vec<_>>();

        assert_eq!(
            builds,
            vec![
                ("first".to_owned(), Some("lattice-system-demo".to_owned())),
                ("second".to_owned(), Some("lattice-system-demo".to_owned())),
            ]
        );
    }
}
