use std::collections::BTreeMap;

use kube::api::ListParams;

use crate::definition::path::TreePath;

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "lattice";

pub const SYSTEM_LABEL: &str = "lattice.dev/system";
pub const SERVICE_PATH_LABEL: &str = "service.lattice.dev/path";
pub const CONTAINER_BUILD_ID_LABEL: &str = "containerbuild.lattice.dev/id";
pub const BUILD_DEFINITION_HASH_LABEL: &str = "build-definition-hash";
pub const JOB_ID_LABEL: &str = "job.lattice.dev/id";
pub const JOB_PATH_LABEL: &str = "job.lattice.dev/path";
pub const NODE_POOL_ID_LABEL: &str = "node-pool.lattice.dev/id";
pub const NODE_POOL_EPOCH_LABEL: &str = "node-pool.lattice.dev/epoch";

pub fn get_system_labels(system: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (SYSTEM_LABEL.to_owned(), system.to_owned()),
    ])
}

/// Label values can't contain slashes, so the path is stored in its domain form.
pub fn get_service_labels(system: &str, path: &TreePath) -> BTreeMap<String, String> {
    let mut labels = get_system_labels(system);
    labels.insert(SERVICE_PATH_LABEL.to_owned(), path.to_domain());

    labels
}

pub fn get_job_labels(system: &str, path: &TreePath) -> BTreeMap<String, String> {
    let mut labels = get_system_labels(system);
    labels.insert(JOB_PATH_LABEL.to_owned(), path.to_domain());

    labels
}

pub fn get_service_selector_labels(path: &TreePath) -> BTreeMap<String, String> {
    BTreeMap::from([(SERVICE_PATH_LABEL.to_owned(), path.to_domain())])
}

pub fn get_container_build_labels(hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (BUILD_DEFINITION_HASH_LABEL.to_owned(), hash.to_owned()),
    ])
}

pub fn get_container_build_job_labels(container_build: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (CONTAINER_BUILD_ID_LABEL.to_owned(), container_build.to_owned()),
    ])
}

pub fn get_job_run_labels(job: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (JOB_ID_LABEL.to_owned(), job.to_owned()),
    ])
}

pub fn get_node_pool_labels(node_pool: &str, epoch: u64) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NODE_POOL_ID_LABEL.to_owned(), node_pool.to_owned()),
        (NODE_POOL_EPOCH_LABEL.to_owned(), epoch.to_string()),
    ])
}

pub fn get_container_build_job_listparams(container_build: &str) -> ListParams {
    ListParams::default().labels(&format!("{CONTAINER_BUILD_ID_LABEL}={container_build}"))
}

pub fn get_job_run_listparams(job: &str) -> ListParams {
    ListParams::default().labels(&format!("{JOB_ID_LABEL}={job}"))
}

pub fn get_node_pool_listparams(node_pool: &str) -> ListParams {
    ListParams::default().labels(&format!("{NODE_POOL_ID_LABEL}={node_pool}"))
}

pub fn get_node_pool_epoch_listparams(node_pool: &str, epoch: u64) -> ListParams {
    ListParams::default().labels(&format!(
        "{NODE_POOL_ID_LABEL}={node_pool},{NODE_POOL_EPOCH_LABEL}={epoch}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_labels_use_the_path_domain() {
        let path = TreePath::new("/shop/api").unwrap();
        let labels = get_service_labels("demo", &path);

        assert_eq!(labels.get(SERVICE_PATH_LABEL).map(String::as_str), Some("api.shop"));
        assert_eq!(labels.get(SYSTEM_LABEL).map(String::as_str), Some("demo"));
    }

    #[test]
    fn epoch_listparams_select_both_labels() {
        let params = get_node_pool_epoch_listparams("pool.shop", 3);

        assert_eq!(
            params.label_selector.as_deref(),
            Some("node-pool.lattice.dev/id=pool.shop,node-pool.lattice.dev/epoch=3")
        );
    }
}
