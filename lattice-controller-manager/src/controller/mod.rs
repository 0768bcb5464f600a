use std::{
    any::Any,
    future::Future,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};

use futures::FutureExt;
use kube::{
    runtime::{controller::Action, controller::Config as ControllerConfig, watcher::Config},
    Resource, ResourceExt,
};
use lattice_core::resources::labels::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use log::{debug, info, warn};
use rand::Rng;
use tokio::join;

use self::{
    address::start_address_controller,
    build::start_build_controller,
    container_build::start_container_build_controller,
    events::REASON_RECONCILE_ESCALATED,
    job::start_job_controller,
    lifecycle::start_lifecycle_controller,
    node_pool::start_node_pool_controller,
    reconciler::{context::ReconcilerContext, error::ReconcilerError},
    service::start_service_controller,
    system::start_system_controller,
};

pub mod address;
pub mod backoff;
pub mod build;
pub mod container_build;
pub mod events;
pub mod job;
pub mod lifecycle;
pub mod node_pool;
pub mod reconciler;
pub mod service;
pub mod shutdown;
pub mod system;

/// Consecutive failures after which a resource gets a warning event.
pub const ESCALATION_FAILURES: u32 = 10;

pub async fn start_controllers(context: Arc<ReconcilerContext>) {
    join!(
        start_container_build_controller(context.clone()),
        start_build_controller(context.clone()),
        start_node_pool_controller(context.clone()),
        start_address_controller(context.clone()),
        start_service_controller(context.clone()),
        start_job_controller(context.clone()),
        start_system_controller(context.clone()),
        start_lifecycle_controller(context.clone()),
    );

    info!("All controllers have exited!");
}

/// Watcher config for the kubernetes resources lattice creates.
pub fn managed_watcher_config() -> Config {
    Config::default().labels(&format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"))
}

pub fn controller_config(context: &ReconcilerContext) -> ControllerConfig {
    ControllerConfig::default().concurrency(context.settings.workers)
}

pub fn get_backoff_key<K: Resource<DynamicType = ()>>(object: &K) -> String {
    format!(
        "{}/{}/{}",
        K::kind(&()),
        object.namespace().unwrap_or_default(),
        object.name_any()
    )
}

/// Requeue after `base` plus up to 10% so periodic resyncs don't line up.
pub fn requeue_with_jitter(base: Duration) -> Action {
    let max_jitter = (base.as_millis() / 10) as u64;
    let jitter = match max_jitter {
        0 => 0,
        max_jitter => rand::thread_rng().gen_range(0..max_jitter),
    };

    Action::requeue(base + Duration::from_millis(jitter))
}

/// Runs a reconciliation, turning panics into errors and clearing the
/// backoff of the resource once it reconciles cleanly.
pub async fn guarded<K, F, Fut>(
    object: Arc<K>,
    context: Arc<ReconcilerContext>,
    reconcile: F,
) -> Result<Action, ReconcilerError>
where
    K: Resource<DynamicType = ()>,
    F: FnOnce(Arc<K>, Arc<ReconcilerContext>) -> Fut,
    Fut: Future<Output = Result<Action, ReconcilerError>>,
{
    context.ensure_running()?;

    let key = get_backoff_key(object.as_ref());
    let result = AssertUnwindSafe(reconcile(object, context.clone()))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(ReconcilerError::Panicked(get_panic_message(panic.as_ref()))));

    if result.is_ok() {
        context.backoff.forget(&key);
    }

    result
}

pub fn error_policy<K>(
    object: Arc<K>,
    error: &ReconcilerError,
    context: Arc<ReconcilerContext>,
) -> Action
where
    K: Resource<DynamicType = ()> + Send + Sync + 'static,
{
    let key = get_backoff_key(object.as_ref());

    let delay = match error {
        ReconcilerError::RetryAfter(delay) => return Action::requeue(*delay),
        ReconcilerError::ShuttingDown => return Action::await_change(),
        _ => context.backoff.when(&key, Instant::now()),
    };

    match error.is_transient() {
        true => debug!("Retrying '{key}' in {delay:?}..."),
        false => warn!("'{key}' can't be reconciled until it's fixed, retrying in {delay:?}! {error}"),
    }

    if context.backoff.failures(&key) == ESCALATION_FAILURES {
        let events = context.events.clone();
        let note = format!("Reconciliation failed {ESCALATION_FAILURES} times in a row: {error}");

        tokio::spawn(async move {
            events
                .warning(object.as_ref(), REASON_RECONCILE_ESCALATED, "Reconcile", note)
                .await
        });
    }

    Action::requeue(delay)
}

fn get_panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|message| message.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_messages_are_extracted() {
        let static_message: Box<dyn Any + Send> = Box::new("boom");
        let owned_message: Box<dyn Any + Send> = Box::new("bang".to_owned());
        let other: Box<dyn Any + Send> = Box::new(42);

        assert_eq!(get_panic_message(static_message.as_ref()), "boom");
        assert_eq!(get_panic_message(owned_message.as_ref()), "bang");
        assert_eq!(get_panic_message(other.as_ref()), "unknown panic");
    }

    #[test]
    fn jittered_requeue_stays_within_ten_percent() {
        for _ in 0..50 {
            let action = requeue_with_jitter(Duration::from_secs(100));
            let debug = format!("{action:?}");

            assert!(debug.contains("requeue_after: Some("), "{debug}");
        }

        assert_eq!(
            requeue_with_jitter(Duration::from_millis(5)),
            Action::requeue(Duration::from_millis(5))
        );
    }

    #[test]
    fn backoff_keys_include_kind_and_namespace() {
        let mut node_pool = lattice_core::resources::crd::v1::node_pool::NodePool::default();
        node_pool.metadata.name = Some("svc-api.shop".to_owned());
        node_pool.metadata.namespace = Some("lattice-system-demo".to_owned());

        assert_eq!(
            get_backoff_key(&node_pool),
            "NodePool/lattice-system-demo/svc-api.shop"
        );
    }
}
