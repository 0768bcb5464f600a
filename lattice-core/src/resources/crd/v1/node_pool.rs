use std::{collections::BTreeMap, fmt::Display};

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::component::{NodePoolAutoscaling, NodePoolDefinition};

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "NodePool",
    namespaced,
    status = "NodePoolStatus",
    derive = "Default",
    derive = "PartialEq"
)]
pub struct NodePoolSpec {
    pub instance_type: String,
    pub num_instances: i32,
    pub autoscaling: Option<NodePoolAutoscaling>,
}

impl NodePoolSpec {
    /// Desired shape for a definition; autoscaled pools never shrink below
    /// their current size or grow past the maximum.
    pub fn from_definition(definition: &NodePoolDefinition, current: Option<&NodePoolSpec>) -> Self {
        let num_instances = match (definition.num_instances, definition.autoscaling) {
            (Some(num_instances), _) => num_instances,
            (None, Some(autoscaling)) => current
                .map(|spec| spec.num_instances)
                .unwrap_or(autoscaling.min)
                .max(autoscaling.min)
                .min(autoscaling.max),
            (None, None) => 1,
        };

        Self {
            instance_type: definition.instance_type.to_owned(),
            num_instances,
            autoscaling: definition.autoscaling,
        }
    }

    /// Whether moving from `self` to `other` needs new nodes instead of resizing the existing group.
    pub fn requires_new_epoch(&self, other: &NodePoolSpec) -> bool {
        self.instance_type != other.instance_type
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolStatus {
    pub observed_generation: Option<i64>,
    pub state: NodePoolState,
    pub message: Option<String>,
    #[serde(default)]
    pub epochs: BTreeMap<u64, NodePoolEpochStatus>,
}

impl NodePoolStatus {
    pub fn current_epoch(&self) -> Option<(u64, &NodePoolEpochStatus)> {
        self.epochs
            .iter()
            .next_back()
            .map(|(epoch, status)| (*epoch, status))
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodePoolEpochStatus {
    pub spec: NodePoolSpec,
    pub state: NodePoolState,
    pub message: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodePoolState {
    #[default]
    Pending,
    Scaling,
    Stable,
    Deleting,
    Failed,
}

impl NodePoolState {
    /// Services may schedule onto the pool in these states.
    pub fn is_usable(&self) -> bool {
        matches!(self, NodePoolState::Stable | NodePoolState::Scaling)
    }
}

impl Display for NodePoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodePoolState::Pending => f.write_str("node pool is being provisioned"),
            NodePoolState::Scaling => f.write_str("node pool is changing its shape"),
            NodePoolState::Stable => f.write_str("node pool has the desired shape"),
            NodePoolState::Deleting => f.write_str("node pool is being deprovisioned"),
            NodePoolState::Failed => f.write_str("node pool couldn't be provisioned"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn autoscaled(min: i32, max: i32) -> NodePoolDefinition {
        NodePoolDefinition {
            instance_type: "m5.large".to_owned(),
            num_instances: None,
            autoscaling: Some(NodePoolAutoscaling { min, max }),
        }
    }

    #[test]
    fn static_size_is_taken_verbatim() {
        let definition = NodePoolDefinition {
            instance_type: "m5.large".to_owned(),
            num_instances: Some(3),
            autoscaling: None,
        };
        let current = NodePoolSpec {
            num_instances: 5,
            ..Default::default()
        };

        assert_eq!(
            NodePoolSpec::from_definition(&definition, Some(&current)).num_instances,
            3
        );
    }

    #[test]
    fn autoscaled_size_keeps_current_within_bounds() {
        let current = |num_instances| NodePoolSpec {
            num_instances,
            ..Default::default()
        };

        assert_eq!(NodePoolSpec::from_definition(&autoscaled(2, 5), None).num_instances, 2);
        assert_eq!(
            NodePoolSpec::from_definition(&autoscaled(2, 5), Some(&current(4))).num_instances,
            4
        );
        assert_eq!(
            NodePoolSpec::from_definition(&autoscaled(2, 5), Some(&current(1))).num_instances,
            2
        );
        assert_eq!(
            NodePoolSpec::from_definition(&autoscaled(2, 5), Some(&current(9))).num_instances,
            5
        );
    }

    #[test]
    fn only_instance_type_changes_require_a_new_epoch() {
        let spec = NodePoolSpec {
            instance_type: "m5.large".to_owned(),
            num_instances: 2,
            autoscaling: None,
        };
        let resized = NodePoolSpec {
            num_instances: 4,
            ..spec.clone()
        };
        let retyped = NodePoolSpec {
            instance_type: "m5.xlarge".to_owned(),
            ..spec.clone()
        };

        assert!(!spec.requires_new_epoch(&resized));
        assert!(spec.requires_new_epoch(&retyped));
    }
}
