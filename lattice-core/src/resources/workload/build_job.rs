use std::collections::BTreeMap;

use derive_builder::Builder;
use k8s_openapi::{
    api::{
        batch::v1::{Job, JobSpec},
        core::v1::{
            Container, EnvVar, HostPathVolumeSource, PodSpec, PodTemplateSpec, Volume,
            VolumeMount,
        },
    },
    apimachinery::pkg::apis::meta::v1::OwnerReference,
};
use kube::core::ObjectMeta;

use crate::resources::{
    annotations::{ARTIFACT_FQN_ANNOTATION, BUILD_DEFINITION_HASH_ANNOTATION},
    crd::v1::config::DockerArtifactConfig,
    labels::get_container_build_job_labels,
    ResourceGenerationError,
};

pub const BUILDER_CONTAINER_NAME: &str = "builder";
pub const BUILDER_SERVICE_ACCOUNT_NAME: &str = "lattice-container-builder";
pub const WORK_DIRECTORY_VOLUME_NAME: &str = "work-directory";
pub const WORK_DIRECTORY_PATH: &str = "/var/lib/component-builder";
pub const DOCKER_SOCKET_VOLUME_NAME: &str = "docker-socket";
pub const DOCKER_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Everything needed to spawn the job that builds a single container image.
#[derive(Debug, Builder)]
pub struct BuildJobRelease {
    pub name: String,
    pub namespace: String,
    pub container_build: String,
    pub definition_hash: String,
    pub builder_image: String,
    pub docker_api_version: String,
    pub registry: String,
    pub repository: String,
    pub tag: String,
    #[builder(default)]
    pub push: bool,
    #[builder(default)]
    pub registry_auth_type: Option<String>,
    pub work_directory: Volume,
    #[builder(default)]
    pub owner_reference: Option<OwnerReference>,
}

impl BuildJobReleaseBuilder {
    /// Picks the repository and tag of the produced image.
    /// With a repository per image the hash names the repository and the tag is
    /// the build time, otherwise every image lives in the shared repository and
    /// is tagged with its hash.
    pub fn with_artifact_config(
        &mut self,
        config: &DockerArtifactConfig,
        hash: &str,
        now_secs: u64,
    ) -> Result<&mut Self, ResourceGenerationError> {
        let (repository, tag) = match config.repository_per_image {
            true => (hash.to_owned(), now_secs.to_string()),
            false => (
                config
                    .repository
                    .as_ref()
                    .ok_or(ResourceGenerationError::MissingData(
                        "artifact repository is required without repositoryPerImage".into(),
                    ))?
                    .to_owned(),
                hash.to_owned(),
            ),
        };

        Ok(self
            .definition_hash(hash.to_owned())
            .registry(config.registry.to_owned())
            .repository(repository)
            .tag(tag)
            .push(config.push)
            .registry_auth_type(config.registry_auth_type.clone()))
    }
}

impl BuildJobRelease {
    pub fn artifact_fqn(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }

    pub fn generate_metadata(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.to_owned()),
            namespace: Some(self.namespace.to_owned()),
            labels: Some(get_container_build_job_labels(&self.container_build)),
            annotations: Some(BTreeMap::from([
                (ARTIFACT_FQN_ANNOTATION.to_owned(), self.artifact_fqn()),
                (
                    BUILD_DEFINITION_HASH_ANNOTATION.to_owned(),
                    self.definition_hash.to_owned(),
                ),
            ])),
            owner_references: self.owner_reference.clone().map(|owner| vec![owner]),
            ..Default::default()
        }
    }

    fn generate_args(&self) -> Vec<String> {
        let mut args = vec![
            "--container-build-id".to_owned(),
            self.container_build.to_owned(),
            "--namespace".to_owned(),
            self.namespace.to_owned(),
            "--docker-registry".to_owned(),
            self.registry.to_owned(),
            "--docker-repository".to_owned(),
            self.repository.to_owned(),
            "--docker-tag".to_owned(),
            self.tag.to_owned(),
            "--docker-push".to_owned(),
            self.push.to_string(),
            "--work-directory".to_owned(),
            WORK_DIRECTORY_PATH.to_owned(),
        ];

        if let Some(auth_type) = &self.registry_auth_type {
            args.push("--docker-registry-auth-type".to_owned());
            args.push(auth_type.to_owned());
        }

        args
    }

    pub fn generate_job(&self) -> Result<Job, ResourceGenerationError> {
        if self.registry.is_empty() {
            return Err(ResourceGenerationError::MissingData(
                "artifact registry".into(),
            ));
        }

        let labels = get_container_build_job_labels(&self.container_build);
        let mut work_directory = self.work_directory.clone();
        work_directory.name = WORK_DIRECTORY_VOLUME_NAME.to_owned();

        let pod_spec = PodSpec {
            containers: vec![Container {
                name: BUILDER_CONTAINER_NAME.to_owned(),
                image: Some(self.builder_image.to_owned()),
                image_pull_policy: Some("IfNotPresent".to_owned()),
                args: Some(self.generate_args()),
                env: Some(vec![EnvVar {
                    name: "DOCKER_API_VERSION".to_owned(),
                    value: Some(self.docker_api_version.to_owned()),
                    ..Default::default()
                }]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: WORK_DIRECTORY_VOLUME_NAME.to_owned(),
                        mount_path: WORK_DIRECTORY_PATH.to_owned(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: DOCKER_SOCKET_VOLUME_NAME.to_owned(),
                        mount_path: DOCKER_SOCKET_PATH.to_owned(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            restart_policy: Some("Never".to_owned()),
            service_account_name: Some(BUILDER_SERVICE_ACCOUNT_NAME.to_owned()),
            volumes: Some(vec![
                work_directory,
                Volume {
                    name: DOCKER_SOCKET_VOLUME_NAME.to_owned(),
                    host_path: Some(HostPathVolumeSource {
                        path: DOCKER_SOCKET_PATH.to_owned(),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        Ok(Job {
            metadata: self.generate_metadata(),
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}
