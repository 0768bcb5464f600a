use std::fmt::Display;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

use crate::definition::component::ContainerBuildDefinition;

#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "lattice.dev",
    version = "v1",
    kind = "ContainerBuild",
    namespaced,
    status = "ContainerBuildStatus",
    derive = "Default"
)]
pub struct ContainerBuildSpec {
    pub definition: ContainerBuildDefinition,
}

#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildStatus {
    pub state: ContainerBuildState,
    pub message: Option<String>,
    pub start_timestamp: Option<DateTime<Utc>>,
    pub completion_timestamp: Option<DateTime<Utc>>,
    /// last phase reported by the builder
    pub last_observed_phase: Option<String>,
    pub artifacts: Option<ContainerBuildArtifacts>,
    pub job_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ContainerBuildState {
    #[default]
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl ContainerBuildState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerBuildState::Succeeded | ContainerBuildState::Failed)
    }
}

impl Display for ContainerBuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerBuildState::Pending => f.write_str("build job wasn't created yet"),
            ContainerBuildState::Queued => f.write_str("build job is waiting to be scheduled"),
            ContainerBuildState::Running => f.write_str("build job is running"),
            ContainerBuildState::Succeeded => f.write_str("image was built"),
            ContainerBuildState::Failed => f.write_str("image couldn't be built"),
        }
    }
}

/// Image produced by a container build.
#[skip_serializing_none]
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerBuildArtifacts {
    pub docker_image_fqn: String,
    pub registry: Option<String>,
    pub repository: String,
    pub tag: String,
    pub digest: Option<String>,
}

impl ContainerBuildArtifacts {
    /// Splits a fully qualified image reference (`registry/repository:tag`).
    /// The first segment is treated as a registry when it looks like a host.
    pub fn from_fqn(fqn: &str, digest: Option<String>) -> Option<Self> {
        let fqn = fqn.trim();
        let last_segment_start = fqn.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (image, tag) = match fqn[last_segment_start..].rfind(':') {
            Some(index) => (
                &fqn[..last_segment_start + index],
                &fqn[last_segment_start + index + 1..],
            ),
            None => (fqn, "latest"),
        };

        if image.is_empty() || tag.is_empty() {
            return None;
        }

        let (registry, repository) = match image.split_once('/') {
            Some((host, repository))
                if host.contains('.') || host.contains(':') || host == "localhost" =>
            {
                (Some(host.to_owned()), repository)
            }
            _ => (None, image),
        };

        if repository.is_empty() {
            return None;
        }

        Some(Self {
            docker_image_fqn: fqn.to_owned(),
            registry,
            repository: repository.to_owned(),
            tag: tag.to_owned(),
            digest,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.docker_image_fqn.is_empty() || self.repository.is_empty() || self.tag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fqn_with_registry_is_split() {
        let artifacts =
            ContainerBuildArtifacts::from_fqn("registry.local:5000/team/api:abc123", None).unwrap();

        assert_eq!(artifacts.registry.as_deref(), Some("registry.local:5000"));
        assert_eq!(artifacts.repository, "team/api");
        assert_eq!(artifacts.tag, "abc123");
        assert!(!artifacts.is_empty());
    }

    #[test]
    fn fqn_without_registry_or_tag_uses_defaults() {
        let artifacts = ContainerBuildArtifacts::from_fqn("team/api", None).unwrap();

        assert_eq!(artifacts.registry, None);
        assert_eq!(artifacts.repository, "team/api");
        assert_eq!(artifacts.tag, "latest");
    }

    #[test]
    fn empty_fqn_is_rejected() {
        assert!(ContainerBuildArtifacts::from_fqn("", None).is_none());
        assert!(ContainerBuildArtifacts::from_fqn("api:", None).is_none());
        assert!(ContainerBuildArtifacts::default().is_empty());
    }
}
