use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Request to converge the system to the services of a build.
/// Exactly one of `version` and `build` has to be set.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Deploy",
    namespaced,
    status = "DeployStatus",
    derive = "Default"
)]
pub struct DeploySpec {
    pub version: Option<String>,
    pub build: Option<String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeployStatus {
    pub state: DeployState,
    pub message: Option<String>,
    pub build: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    /// first time the system was observed degraded while this deploy was in progress
    pub degraded_since: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum DeployState {
    #[default]
    Pending,
    Accepted,
    InProgress,
    Succeeded,
    Failed,
}

impl DeployState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeployState::Succeeded | DeployState::Failed)
    }

    /// The deploy holds the system's lifecycle lock in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, DeployState::Accepted | DeployState::InProgress)
    }
}

impl Display for DeployState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeployState::Pending => f.write_str("deploy is waiting for its turn"),
            DeployState::Accepted => f.write_str("deploy is waiting for its build"),
            DeployState::InProgress => f.write_str("system is being updated"),
            DeployState::Succeeded => f.write_str("system was deployed"),
            DeployState::Failed => f.write_str("deploy failed"),
        }
    }
}
