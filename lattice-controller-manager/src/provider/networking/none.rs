use lattice_core::resources::crd::v1::config::ConfigSpec;

use crate::provider::ProviderError;

use super::{BootstrapResources, NetworkingProvider};

/// The cluster's own pod network is used as is.
pub struct NoneNetworkingProvider;

impl NetworkingProvider for NoneNetworkingProvider {
    fn bootstrap_resources(&self, _config: &ConfigSpec) -> Result<BootstrapResources, ProviderError> {
        Ok(BootstrapResources::default())
    }
}
