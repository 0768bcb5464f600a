use std::{borrow::Cow, time::Duration};

use kube::runtime::finalizer::Error as FinalizerError;
use lattice_core::{definition::DefinitionError, resources::ResourceGenerationError};
use thiserror::Error;

use crate::{
    config::ConfigStoreError,
    provider::{resolver::ResolveError, ProviderError},
};

#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("Object is missing metadata!")]
    MissingObjectMetadata,
    #[error("'{}' resource is missing required data!", .0)]
    MissingObjectData(Cow<'static, str>),
    #[error("'{}' resource contains invalid data!", .0)]
    InvalidObjectData(Cow<'static, str>),
    #[error("Invariant violated: {}!", .0)]
    InvariantViolation(Cow<'static, str>),
    #[error("Kubernetes API call failed! Reason: {}", .0)]
    KubeApiError(#[from] kube::Error),
    #[error("Provider call failed! Reason: {}", .0)]
    ProviderError(#[from] ProviderError),
    #[error("Couldn't resolve the definition! Reason: {}", .0)]
    ResolveError(#[from] ResolveError),
    #[error("Definition is invalid! Reason: {}", .0)]
    DefinitionError(#[from] DefinitionError),
    #[error("Couldn't generate a resource! Reason: {}", .0)]
    ResourceGenerationError(#[from] ResourceGenerationError),
    #[error("Lattice config is unavailable! Reason: {}", .0)]
    ConfigError(#[from] ConfigStoreError),
    #[error("Couldn't serialize data! Reason: {}", .0)]
    SerializationError(#[from] serde_json::Error),
    #[error("Waiting for dependent resources, retrying in {:?}!", .0)]
    RetryAfter(Duration),
    #[error("Controller manager is shutting down!")]
    ShuttingDown,
    #[error("Reconciliation panicked! {}", .0)]
    Panicked(String),
}

impl ReconcilerError {
    /// Transient errors go back to the queue with backoff, the rest need
    /// somebody to fix the resource or the environment first.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcilerError::InvalidObjectData(_)
            | ReconcilerError::InvariantViolation(_)
            | ReconcilerError::DefinitionError(_)
            | ReconcilerError::ResourceGenerationError(_) => false,
            ReconcilerError::ProviderError(error) => !error.is_terminal(),
            ReconcilerError::ResolveError(error) => !error.is_terminal(),
            _ => true,
        }
    }

    /// State to record for an error that retrying won't fix. Invariant
    /// violations only surface through the message and an event, the state
    /// of the resource stays as it was.
    pub fn failure_state<S>(&self, current: S, failed: S) -> S {
        match self.is_invariant_violation() {
            true => current,
            false => failed,
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, ReconcilerError::InvariantViolation(_))
    }
}

impl From<FinalizerError<ReconcilerError>> for ReconcilerError {
    fn from(error: FinalizerError<ReconcilerError>) -> Self {
        match error {
            FinalizerError::ApplyFailed(error) | FinalizerError::CleanupFailed(error) => error,
            FinalizerError::AddFinalizer(error) | FinalizerError::RemoveFinalizer(error) => {
                ReconcilerError::KubeApiError(error)
            }
            FinalizerError::UnnamedObject => ReconcilerError::MissingObjectMetadata,
            FinalizerError::InvalidFinalizer => {
                ReconcilerError::InvalidObjectData("finalizer".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_provider_errors_are_not_transient() {
        assert!(!ReconcilerError::from(ProviderError::Rejected("bad instance type".into()))
            .is_transient());
        assert!(ReconcilerError::from(ProviderError::MissingData("load balancer".into()))
            .is_transient());
    }

    #[test]
    fn invariant_violations_keep_the_state() {
        use lattice_core::resources::crd::v1::service::ServiceState;

        let violation = ReconcilerError::InvariantViolation(
            "workload 'api-shop' exists but isn't controlled by service 'api.shop'".into(),
        );
        let invalid = ReconcilerError::InvalidObjectData("service '/shop/api'".into());

        assert!(!violation.is_transient());
        assert_eq!(
            violation.failure_state(ServiceState::Stable, ServiceState::Failed),
            ServiceState::Stable
        );
        assert_eq!(
            invalid.failure_state(ServiceState::Stable, ServiceState::Failed),
            ServiceState::Failed
        );
    }

    #[test]
    fn finalizer_errors_unwrap_to_the_reconciler_error() {
        let error = ReconcilerError::from(FinalizerError::ApplyFailed(
            ReconcilerError::RetryAfter(Duration::from_secs(3)),
        ));

        assert!(matches!(error, ReconcilerError::RetryAfter(delay) if delay == Duration::from_secs(3)));
        assert!(matches!(
            ReconcilerError::from(FinalizerError::<ReconcilerError>::UnnamedObject),
            ReconcilerError::MissingObjectMetadata
        ));
    }
}
