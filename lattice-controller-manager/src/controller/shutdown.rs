use std::{future::Future, sync::Arc};

use log::{info, warn};
use tokio::sync::watch;

/// Process wide stop signal: one writer, any number of readers.
#[derive(Clone)]
pub struct Shutdown {
    sender: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);

        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolves once [`Shutdown::trigger`] was called.
    pub fn wait(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        let mut receiver = self.sender.subscribe();

        async move {
            loop {
                let triggered = *receiver.borrow_and_update();
                if triggered || receiver.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Triggers the shutdown on SIGINT or SIGTERM.
    pub async fn trigger_on_signal(self) {
        wait_for_signal().await;

        info!("Shutdown requested, waiting for running reconciliations to finish...");

        self.trigger();
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(error) => {
            warn!("Couldn't listen for SIGTERM! {error}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = terminate.recv() => (),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!("Couldn't listen for Ctrl+C! {error}");
    }
}
