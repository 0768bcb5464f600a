use std::{sync::Arc, time::Duration};

use k8s_openapi::NamespaceResourceScope;
use kube::{Api, Client, Resource};
use lattice_core::{kubernetes::GetApi, resources::meta::try_get_system_id};

use crate::{
    config::ConfigStore,
    controller::{backoff::RateLimiter, events::EventPublisher, shutdown::Shutdown},
    provider::Providers,
};

use super::error::ReconcilerError;

/// Process flags the reconcilers care about.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub namespace_prefix: String,
    pub workers: u16,
    pub deploy_degraded_timeout: Duration,
}

pub struct ReconcilerContext {
    pub client: Client,
    pub config: Arc<ConfigStore>,
    pub providers: Providers,
    pub events: EventPublisher,
    pub backoff: RateLimiter,
    pub shutdown: Shutdown,
    pub settings: ReconcilerSettings,
}

impl ReconcilerContext {
    /// Reconcilers call this between external calls so a shutdown doesn't
    /// wait for a long chain of them.
    pub fn ensure_running(&self) -> Result<(), ReconcilerError> {
        match self.shutdown.is_triggered() {
            true => Err(ReconcilerError::ShuttingDown),
            false => Ok(()),
        }
    }

    /// Id of the system owning a tenant namespace.
    pub fn system_id<'a>(&self, namespace: &'a str) -> Result<&'a str, ReconcilerError> {
        try_get_system_id(&self.settings.namespace_prefix, namespace).ok_or_else(|| {
            ReconcilerError::InvalidObjectData(
                format!("'{namespace}' is not a tenant namespace").into(),
            )
        })
    }
}

impl GetApi for ReconcilerContext {
    fn global_api<T: Resource<DynamicType = ()>>(&self) -> Api<T> {
        self.client.global_api()
    }

    fn namespaced_api<T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>>(
        &self,
        namespace: &str,
    ) -> Api<T> {
        self.client.namespaced_api(namespace)
    }
}
