use std::{collections::BTreeMap, fmt::Display};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::{component::JobDefinition, path::TreePath};

use super::container_build::ContainerBuildArtifacts;

#[skip_serializing_none]
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "Job",
    namespaced,
    status = "JobStatus",
    derive = "Default"
)]
pub struct JobSpec {
    pub path: TreePath,
    pub definition: JobDefinition,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ContainerBuildArtifacts>,
    /// how many times a failed run is retried, defaults to 0
    pub num_retries: Option<i32>,
    /// overrides the main container's command
    pub command: Option<Vec<String>>,
    /// merged into the main container's environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl JobSpec {
    /// Run parameters are left to whoever triggers the job.
    pub fn from_definition(
        path: TreePath,
        definition: JobDefinition,
        artifacts: BTreeMap<String, ContainerBuildArtifacts>,
    ) -> Self {
        Self {
            path,
            definition,
            artifacts,
            ..Default::default()
        }
    }
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub observed_generation: Option<i64>,
    pub state: JobState,
    pub message: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Vec<JobRunRecord>,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobRunRecord {
    /// name of the kubernetes job backing the run
    pub name: String,
    pub state: JobRunState,
    pub message: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => f.write_str("job is waiting to be started"),
            JobState::Running => f.write_str("job is running"),
            JobState::Succeeded => f.write_str("job succeeded"),
            JobState::Failed => f.write_str("job failed after exhausting its retries"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobRunState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
}
