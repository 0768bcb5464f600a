use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

/// Request to remove every service of the system.
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Teardown",
    namespaced,
    status = "TeardownStatus",
    derive = "Default"
)]
pub struct TeardownSpec {}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TeardownStatus {
    pub state: TeardownState,
    pub message: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum TeardownState {
    #[default]
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

impl TeardownState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TeardownState::Succeeded | TeardownState::Failed)
    }
}

impl Display for TeardownState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TeardownState::Pending => f.write_str("teardown is waiting for its turn"),
            TeardownState::InProgress => f.write_str("services are being removed"),
            TeardownState::Succeeded => f.write_str("system was torn down"),
            TeardownState::Failed => f.write_str("teardown failed"),
        }
    }
}
