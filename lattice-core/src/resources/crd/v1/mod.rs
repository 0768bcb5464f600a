use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{api::PatchParams, Client, CustomResourceExt};

use crate::kubernetes::operations::apply_crd;

use self::{
    address::Address, build::Build, config::Config, container_build::ContainerBuild,
    deploy::Deploy, job::Job, node_pool::NodePool, service::Service, system::System,
    teardown::Teardown,
};

pub mod address;
pub mod build;
pub mod config;
pub mod container_build;
pub mod deploy;
pub mod job;
pub mod node_pool;
pub mod service;
pub mod system;
pub mod teardown;

pub fn v1_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Config::crd(),
        System::crd(),
        Build::crd(),
        ContainerBuild::crd(),
        Service::crd(),
        Address::crd(),
        NodePool::crd(),
        Job::crd(),
        Deploy::crd(),
        Teardown::crd(),
    ]
}

pub async fn create_v1_crds(client: &Client, apply_params: &PatchParams) -> anyhow::Result<()> {
    for crd in v1_crds() {
        apply_crd(client, &crd, apply_params).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_crd_belongs_to_the_lattice_group() {
        let crds = v1_crds();

        assert_eq!(crds.len(), 10);
        for crd in crds {
            assert_eq!(crd.spec.group, crate::RESOURCE_GROUP);
            assert_eq!(crd.spec.scope, "Namespaced");
            assert!(crd
                .spec
                .versions
                .iter()
                .all(|version| version.name == crate::RESOURCE_VERSION));
        }
    }

    #[test]
    fn config_is_the_only_kind_without_status() {
        let without_status = v1_crds()
            .into_iter()
            .filter(|crd| {
                crd.spec.versions.iter().all(|version| {
                    version
                        .subresources
                        .as_ref()
                        .and_then(|subresources| subresources.status.as_ref())
                        .is_none()
                })
            })
            .map(|crd| crd.spec.names.kind)
            .collect::<Vec<_>>();

        assert_eq!(without_status, vec!["Config".to_owned()]);
    }
}
