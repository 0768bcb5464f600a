use kube::{
    runtime::events::{Event, EventType, Recorder, Reporter},
    Client, Resource,
};
use log::warn;

pub const REPORTER_NAME: &str = "lattice-controller-manager";

pub const REASON_STATE_CHANGED: &str = "StateChanged";
pub const REASON_INVARIANT_VIOLATED: &str = "InvariantViolated";
pub const REASON_PROVIDER_REJECTED: &str = "ProviderRejected";
pub const REASON_RECONCILE_ESCALATED: &str = "ReconcileEscalated";
pub const REASON_CREATED: &str = "Created";
pub const REASON_DELETED: &str = "Deleted";

/// Publishes kubernetes events about lattice resources, failures to publish
/// are logged and otherwise ignored.
#[derive(Clone)]
pub struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: REPORTER_NAME.to_owned(),
            instance: std::env::var("POD_NAME").ok(),
        };

        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal<K>(&self, resource: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await
    }

    pub async fn warning<K>(&self, resource: &K, reason: &str, action: &str, note: String)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await
    }

    async fn publish<K>(
        &self,
        resource: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note: Some(note),
            action: action.to_owned(),
            secondary: None,
        };

        if let Err(error) = self
            .recorder
            .publish(&event, &resource.object_ref(&()))
            .await
        {
            warn!(
                "Couldn't publish '{reason}' event for '{}'! {error}",
                resource.meta().name.as_deref().unwrap_or_default()
            );
        }
    }
}
