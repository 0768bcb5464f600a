use std::{collections::BTreeMap, fmt::Display};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::path::TreePath;

#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Address",
    namespaced,
    status = "AddressStatus",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct AddressSpec {
    /// path of the service this address points to
    pub service: TreePath,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AddressStatus {
    pub observed_generation: Option<i64>,
    pub state: AddressState,
    pub message: Option<String>,
    /// address registered for the service inside of the system
    pub ip: Option<String>,
    /// public port to its external address
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum AddressState {
    #[default]
    Pending,
    Stable,
    Failed,
}

impl Display for AddressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressState::Pending => f.write_str("address is waiting for its service"),
            AddressState::Stable => f.write_str("address is provisioned"),
            AddressState::Failed => f.write_str("address couldn't be provisioned"),
        }
    }
}
