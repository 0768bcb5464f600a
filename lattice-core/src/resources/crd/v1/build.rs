use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::{path::TreePath, tree::ResolvedDefinition};

use super::container_build::{ContainerBuildArtifacts, ContainerBuildState};

/// Materializes a version of the system definition (or one of its subtrees).
/// Exactly one of `version` and `path` has to be set.
#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Build",
    namespaced,
    status = "BuildStatus",
    derive = "Default"
)]
pub struct BuildSpec {
    pub version: Option<String>,
    pub path: Option<TreePath>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub observed_generation: Option<i64>,
    pub state: BuildState,
    pub message: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    /// version the definition was resolved at
    pub version: Option<String>,
    /// resolved component tree
    pub definition: Option<ResolvedDefinition>,
    /// container build names of each workload's containers
    #[serde(default)]
    pub workloads: BTreeMap<TreePath, BuildWorkload>,
    /// observed state of the referenced container builds, keyed by their names
    #[serde(default)]
    pub container_builds: BTreeMap<String, BuildContainerBuildStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildWorkload {
    /// container name to container build name
    #[serde(default)]
    pub containers: BTreeMap<String, String>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BuildContainerBuildStatus {
    pub state: ContainerBuildState,
    pub last_observed_phase: Option<String>,
    pub failure_message: Option<String>,
    pub artifacts: Option<ContainerBuildArtifacts>,
}

impl BuildStatus {
    /// Artifacts of every container of the workload, if all of them were built.
    pub fn workload_artifacts(
        &self,
        path: &TreePath,
    ) -> Option<BTreeMap<String, ContainerBuildArtifacts>> {
        self.workloads
            .get(path)?
            .containers
            .iter()
            .map(|(container, build)| {
                let artifacts = self.container_builds.get(build)?.artifacts.clone()?;

                Some((container.to_owned(), artifacts))
            })
            .collect()
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BuildState {
    #[default]
    Pending,
    Accepted,
    Running,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BuildState::Succeeded | BuildState::Failed)
    }
}

impl Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildState::Pending => f.write_str("build is waiting to be resolved"),
            BuildState::Accepted => f.write_str("build definition was resolved"),
            BuildState::Running => f.write_str("container builds are running"),
            BuildState::Succeeded => f.write_str("all container builds succeeded"),
            BuildState::Failed => f.write_str("build failed"),
        }
    }
}
