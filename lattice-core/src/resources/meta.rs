use kube::ResourceExt;

use crate::definition::path::{NodePoolPath, TreePath};

use super::crd::v1::{container_build::ContainerBuild, job::Job, service::Service};

pub const SYSTEM_FINALIZER: &str = "systems.lattice.dev/cleanup";
pub const SERVICE_FINALIZER: &str = "services.lattice.dev/cleanup";
pub const ADDRESS_FINALIZER: &str = "addresses.lattice.dev/cleanup";
pub const NODE_POOL_FINALIZER: &str = "nodepools.lattice.dev/cleanup";
pub const CONTAINER_BUILD_FINALIZER: &str = "containerbuilds.lattice.dev/cleanup";

const TENANT_NAMESPACE_INFIX: &str = "-system-";

pub fn get_tenant_namespace(prefix: &str, system: &str) -> String {
    format!("{prefix}{TENANT_NAMESPACE_INFIX}{system}")
}

/// Inverse of [`get_tenant_namespace`].
pub fn try_get_system_id<'a>(prefix: &str, namespace: &'a str) -> Option<&'a str> {
    namespace
        .strip_prefix(prefix)?
        .strip_prefix(TENANT_NAMESPACE_INFIX)
        .filter(|system| !system.is_empty())
}

pub fn get_service_name(path: &TreePath) -> String {
    path.to_domain()
}

pub fn get_job_name(path: &TreePath) -> String {
    path.to_domain()
}

pub fn get_address_name(path: &TreePath) -> String {
    path.to_domain()
}

pub fn get_dedicated_node_pool_name(path: &TreePath) -> String {
    format!("svc-{}", path.to_domain())
}

pub fn get_shared_node_pool_name(path: &NodePoolPath) -> String {
    format!("shared-{}", path.to_domain())
}

/// Node pool names are only unique within a tenant, nodes are labeled with this instead.
pub fn get_node_pool_id(namespace: &str, node_pool: &str) -> String {
    format!("{node_pool}.{namespace}")
}

/// Kubernetes Services are DNS labels, so dots aren't allowed.
pub fn get_load_balancer_name(address: &str) -> String {
    format!("lattice-lb-{}", address.replace('.', "-"))
}

pub fn get_container_build_name(hash: &str, attempt: usize) -> String {
    format!("{hash}-{attempt}")
}

pub trait ContainerBuildMeta {
    fn get_build_job_name(&self) -> String;
}

impl ContainerBuildMeta for ContainerBuild {
    fn get_build_job_name(&self) -> String {
        format!("lattice-container-build-{}", self.name_any())
    }
}

pub trait ServiceMeta {
    fn get_deployment_name(&self) -> String;
}

impl ServiceMeta for Service {
    fn get_deployment_name(&self) -> String {
        self.name_any()
    }
}

pub trait JobMeta {
    fn get_run_name(&self, run: usize) -> String;
}

impl JobMeta for Job {
    fn get_run_name(&self, run: usize) -> String {
        format!("{}-run-{run}", self.name_any())
    }
}
