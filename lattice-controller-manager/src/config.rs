use std::sync::Arc;

use futures::{Future, Stream, StreamExt};
use lattice_core::{kubernetes::GetApi, resources::crd::v1::config::{Config, ConfigSpec}};
use kube::{
    runtime::{
        watcher::{watcher, Config as WatcherConfig},
        WatchStreamExt,
    },
    Client, ResourceExt,
};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio_stream::wrappers::WatchStream;

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("Lattice config wasn't observed yet!")]
    NotReady,
}

/// Latest observed lattice configuration.
/// The revision counter starts at 0 and is bumped on every change, so
/// `> 0` means a config was observed.
pub struct ConfigStore {
    current: RwLock<Option<Arc<ConfigSpec>>>,
    revision: watch::Sender<u64>,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);

        Self {
            current: RwLock::new(None),
            revision,
        }
    }

    /// Stores the spec, returns `false` when nothing changed.
    pub async fn set(&self, spec: ConfigSpec) -> bool {
        let mut guard = self.current.write().await;

        if guard.as_deref() == Some(&spec) {
            return false;
        }

        *guard = Some(Arc::new(spec));
        self.revision.send_modify(|revision| *revision += 1);

        true
    }

    pub async fn current(&self) -> Result<Arc<ConfigSpec>, ConfigStoreError> {
        self.current
            .read()
            .await
            .clone()
            .ok_or(ConfigStoreError::NotReady)
    }

    pub async fn wait_until_ready(&self) {
        let mut receiver = self.revision.subscribe();

        // the sender lives as long as the store, so this can't fail
        let _ = receiver.wait_for(|revision| *revision > 0).await;
    }

    /// Yields once for every config change observed after the call.
    pub fn changes(&self) -> impl Stream<Item = ()> + Send + Sync + 'static {
        WatchStream::from_changes(self.revision.subscribe()).map(|_| ())
    }
}

pub fn start_config_watcher(
    client: &Client,
    namespace: &str,
    name: &str,
    config_store: Arc<ConfigStore>,
) -> impl Future<Output = ()> {
    let watcher_config = WatcherConfig::default().fields(&format!("metadata.name={name}"));
    watcher(client.namespaced_api::<Config>(namespace), watcher_config)
        .default_backoff()
        .applied_objects()
        .for_each(move |config| {
            let config_store = config_store.clone();

            async move {
                match config {
                    Ok(config) => {
                        if config_store.set(config.spec.clone()).await {
                            info!("Observed a new revision of '{}' config!", config.name_any());
                        }
                    }
                    Err(error) => warn!("Config watcher failed! {error}"),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_becomes_ready_on_first_spec() {
        let store = ConfigStore::new();

        assert!(matches!(store.current().await, Err(ConfigStoreError::NotReady)));

        assert!(store.set(ConfigSpec::default()).await);
        store.wait_until_ready().await;

        assert!(store.current().await.is_ok());
    }

    #[tokio::test]
    async fn unchanged_spec_is_not_a_change() {
        let store = ConfigStore::new();

        assert!(store.set(ConfigSpec::default()).await);
        assert!(!store.set(ConfigSpec::default()).await);
    }

    #[tokio::test]
    async fn changes_are_streamed() {
        let store = ConfigStore::new();
        let mut changes = Box::pin(store.changes());

        store.set(ConfigSpec::default()).await;

        assert_eq!(changes.next().await, Some(()));
    }
}
