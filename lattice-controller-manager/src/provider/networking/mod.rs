use k8s_openapi::api::{apps::v1::DaemonSet, core::v1::ConfigMap};
use lattice_core::resources::crd::v1::config::ConfigSpec;

use super::ProviderError;

pub mod flannel;
pub mod none;

/// Resources a lattice needs before any workload can run.
#[derive(Debug, Clone, Default)]
pub struct BootstrapResources {
    pub config_maps: Vec<ConfigMap>,
    pub daemon_sets: Vec<DaemonSet>,
}

impl BootstrapResources {
    pub fn is_empty(&self) -> bool {
        self.config_maps.is_empty() && self.daemon_sets.is_empty()
    }
}

pub trait NetworkingProvider: Send + Sync {
    fn bootstrap_resources(&self, config: &ConfigSpec) -> Result<BootstrapResources, ProviderError>;
}
