use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as FinalizerEvent},
    },
    Resource, ResourceExt,
};
use lattice_core::{
    definition::hash::definition_hash,
    helpers::{get_secs_since_unix_epoch, RequireMetadata},
    kubernetes::{
        operations::{apply_resource_status, create_or_get_resource, list_resources, try_remove_resource},
        GetApi,
    },
    resources::{
        annotations::{
            get_annotation, ARTIFACT_DIGEST_ANNOTATION, ARTIFACT_FQN_ANNOTATION,
            CONTAINER_BUILD_PHASE_ANNOTATION,
        },
        crd::v1::{
            container_build::{
                ContainerBuild, ContainerBuildArtifacts, ContainerBuildState, ContainerBuildStatus,
            },
            job::JobRunState,
        },
        labels::get_container_build_job_listparams,
        meta::{ContainerBuildMeta, CONTAINER_BUILD_FINALIZER},
        workload::{build_job::BuildJobReleaseBuilder, job_run::get_job_run_state},
        ResourceGenerationError,
    },
};
use log::{info, warn};

use crate::controller::{
    events::{REASON_CREATED, REASON_INVARIANT_VIOLATED, REASON_STATE_CHANGED},
    requeue_with_jitter,
};

use super::{
    apply_params, background_deletion, context::ReconcilerContext, error::ReconcilerError,
    PROGRESS_REQUEUE,
};

pub async fn reconcile_container_build(
    object: Arc<ContainerBuild>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    let namespace = object.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let api = context.namespaced_api::<ContainerBuild>(namespace);

    finalizer(&api, CONTAINER_BUILD_FINALIZER, object, |event| async {
        match event {
            FinalizerEvent::Apply(container_build) => {
                try_reconcile(&container_build, &context).await
            }
            FinalizerEvent::Cleanup(container_build) => cleanup(&container_build, &context).await,
        }
    })
    .await
    .map_err(ReconcilerError::from)
}

async fn try_reconcile(
    container_build: &ContainerBuild,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let current = container_build.status.clone().unwrap_or_default();

    // the job of a finished build is kept around for its logs, nothing to do
    if current.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let name = container_build.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = container_build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let now = Utc::now();

    let job = match ensure_single_job(container_build, context).await? {
        Some(job) => job,
        None => create_build_job(container_build, context).await?,
    };

    context.ensure_running()?;

    let observed = observe_build_job(&current, &job, now);

    if let Some(violation) = &observed.violation {
        warn!("Container build '{name}' in '{namespace}' namespace: {violation}");
        context
            .events
            .warning(
                container_build,
                REASON_INVARIANT_VIOLATED,
                "ObserveBuildJob",
                violation.to_owned(),
            )
            .await;
    }

    if observed.status != current {
        if observed.status.state != current.state {
            context
                .events
                .normal(
                    container_build,
                    REASON_STATE_CHANGED,
                    "ObserveBuildJob",
                    observed.status.state.to_string(),
                )
                .await;
        }

        apply_resource_status::<ContainerBuild, _>(
            &context.client,
            observed.status.clone(),
            name,
            namespace,
            &apply_params(),
        )
        .await?;
    }

    match observed.violation {
        Some(violation) => Err(ReconcilerError::InvariantViolation(violation.into())),
        None if observed.status.state.is_terminal() => Ok(Action::await_change()),
        None => Ok(requeue_with_jitter(PROGRESS_REQUEUE)),
    }
}

/// Returns the build job, deleting any duplicates that lost a creation race.
async fn ensure_single_job(
    container_build: &ContainerBuild,
    context: &ReconcilerContext,
) -> Result<Option<BatchJob>, ReconcilerError> {
    let namespace = container_build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let jobs = list_resources::<BatchJob>(
        &context.client,
        namespace,
        &get_container_build_job_listparams(&container_build.name_any()),
    )
    .await?;

    let (oldest, duplicates) = split_oldest_job(jobs);

    if !duplicates.is_empty() {
        let names = duplicates
            .iter()
            .map(ResourceExt::name_any)
            .collect::<Vec<_>>();

        context
            .events
            .warning(
                container_build,
                REASON_INVARIANT_VIOLATED,
                "EnsureBuildJob",
                format!("Found duplicate build jobs, removing {}", names.join(", ")),
            )
            .await;

        for duplicate in names {
            try_remove_resource::<BatchJob>(
                &context.client,
                &duplicate,
                namespace,
                &background_deletion(),
            )
            .await?;
        }
    }

    Ok(oldest)
}

async fn create_build_job(
    container_build: &ContainerBuild,
    context: &ReconcilerContext,
) -> Result<BatchJob, ReconcilerError> {
    let namespace = container_build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let config = context.config.current().await?;
    let hash = definition_hash(&container_build.spec.definition)?;
    let job_name = container_build.get_build_job_name();
    let work_directory = context
        .providers
        .cloud
        .build_work_directory(&job_name)
        .await?;

    let release = BuildJobReleaseBuilder::default()
        .name(job_name.to_owned())
        .namespace(namespace.to_owned())
        .container_build(container_build.name_any())
        .builder_image(config.component_build.builder.image.to_owned())
        .docker_api_version(config.component_build.builder.docker_api_version.to_owned())
        .work_directory(work_directory)
        .owner_reference(container_build.controller_owner_ref(&()))
        .with_artifact_config(&config.component_build.artifact, &hash, get_secs_since_unix_epoch())?
        .build()
        .map_err(|error| ResourceGenerationError::MissingData(error.to_string().into()))?;

    info!(
        "Creating build job '{job_name}' for '{}' image...",
        release.artifact_fqn()
    );

    let job = create_or_get_resource(&context.client, &release.generate_job()?).await?;

    context
        .events
        .normal(
            container_build,
            REASON_CREATED,
            "CreateBuildJob",
            format!("Created build job '{job_name}'"),
        )
        .await;

    Ok(job)
}

async fn cleanup(
    container_build: &ContainerBuild,
    context: &ReconcilerContext,
) -> Result<Action, ReconcilerError> {
    let namespace = container_build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let jobs = list_resources::<BatchJob>(
        &context.client,
        namespace,
        &get_container_build_job_listparams(&container_build.name_any()),
    )
    .await?;

    for job in jobs {
        try_remove_resource::<BatchJob>(
            &context.client,
            &job.name_any(),
            namespace,
            &background_deletion(),
        )
        .await?;
    }

    Ok(Action::await_change())
}

/// Oldest job by creation time (then name) and the rest.
fn split_oldest_job(mut jobs: Vec<BatchJob>) -> (Option<BatchJob>, Vec<BatchJob>) {
    jobs.sort_by(|a, b| {
        a.creation_timestamp()
            .map(|time| time.0)
            .cmp(&b.creation_timestamp().map(|time| time.0))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    let mut jobs = jobs.into_iter();
    let oldest = jobs.next();

    (oldest, jobs.collect())
}

#[derive(Debug)]
struct ObservedBuild {
    status: ContainerBuildStatus,
    violation: Option<String>,
}

/// Derives the container build status from its job. A job that completed
/// without reporting its image leaves the state untouched.
fn observe_build_job(
    current: &ContainerBuildStatus,
    job: &BatchJob,
    now: DateTime<Utc>,
) -> ObservedBuild {
    let annotations = job.metadata.annotations.as_ref();
    let (run_state, message) = get_job_run_state(job);
    let mut status = ContainerBuildStatus {
        job_name: Some(job.name_any()),
        last_observed_phase: get_annotation(annotations, CONTAINER_BUILD_PHASE_ANNOTATION)
            .map(str::to_owned)
            .or_else(|| current.last_observed_phase.clone()),
        ..current.clone()
    };

    let state = match run_state {
        JobRunState::Queued => ContainerBuildState::Queued,
        JobRunState::Running => ContainerBuildState::Running,
        JobRunState::Failed => ContainerBuildState::Failed,
        JobRunState::Succeeded => {
            let digest = get_annotation(annotations, ARTIFACT_DIGEST_ANNOTATION).map(str::to_owned);
            let artifacts = get_annotation(annotations, ARTIFACT_FQN_ANNOTATION)
                .and_then(|fqn| ContainerBuildArtifacts::from_fqn(fqn, digest))
                .filter(|artifacts| !artifacts.is_empty());

            match artifacts {
                Some(artifacts) => {
                    status.artifacts = Some(artifacts);
                    ContainerBuildState::Succeeded
                }
                None => {
                    let violation = format!(
                        "build job '{}' completed without a valid '{ARTIFACT_FQN_ANNOTATION}' annotation",
                        job.name_any()
                    );
                    status.message = Some(violation.to_owned());

                    return ObservedBuild {
                        status,
                        violation: Some(violation),
                    };
                }
            }
        }
    };

    if state != ContainerBuildState::Queued && status.start_timestamp.is_none() {
        status.start_timestamp = Some(now);
    }

    if state.is_terminal() {
        status.completion_timestamp = Some(now);
    }

    status.message = match state {
        ContainerBuildState::Failed => message.or_else(|| Some(state.to_string())),
        _ => None,
    };
    status.state = state;

    ObservedBuild {
        status,
        violation: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::batch::v1::{JobCondition, JobStatus as BatchJobStatus},
        apimachinery::pkg::apis::meta::v1::Time,
    };

    use super::*;

    fn job(name: &str, conditions: &[(&str, Option<&str>)], active: i32) -> BatchJob {
        let mut job = BatchJob::default();
        job.metadata.name = Some(name.to_owned());
        job.status = Some(BatchJobStatus {
            active: Some(active),
            conditions: Some(
                conditions
                    .iter()
                    .map(|(type_, message)| JobCondition {
                        type_: type_.to_string(),
                        status: "True".to_owned(),
                        message: message.map(str::to_owned),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        });

        job
    }

    fn with_annotations(mut job: BatchJob, annotations: &[(&str, &str)]) -> BatchJob {
        job.metadata.annotations = Some(
            annotations
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );

        job
    }

    #[test]
    fn running_job_starts_the_build() {
        let now = Utc::now();
        let job = with_annotations(
            job("lattice-container-build-abc-0", &[], 1),
            &[(CONTAINER_BUILD_PHASE_ANNOTATION, "pulling-sources")],
        );

        let observed = observe_build_job(&ContainerBuildStatus::default(), &job, now);

        assert!(observed.violation.is_none());
        assert_eq!(observed.status.state, ContainerBuildState::Running);
        assert_eq!(observed.status.start_timestamp, Some(now));
        assert_eq!(
            observed.status.last_observed_phase.as_deref(),
            Some("pulling-sources")
        );
        assert_eq!(
            observed.status.job_name.as_deref(),
            Some("lattice-container-build-abc-0")
        );
    }

    #[test]
    fn completed_job_publishes_artifacts() {
        let job = with_annotations(
            job("build", &[("Complete", None)], 0),
            &[
                (ARTIFACT_FQN_ANNOTATION, "registry.local/lattice:abc"),
                (ARTIFACT_DIGEST_ANNOTATION, "sha256:1234"),
            ],
        );

        let observed = observe_build_job(&ContainerBuildStatus::default(), &job, Utc::now());
        let artifacts = observed.status.artifacts.unwrap();

        assert_eq!(observed.status.state, ContainerBuildState::Succeeded);
        assert_eq!(artifacts.repository, "lattice");
        assert_eq!(artifacts.digest.as_deref(), Some("sha256:1234"));
        assert!(observed.status.completion_timestamp.is_some());
    }

    #[test]
    fn completed_job_without_artifact_keeps_the_state() {
        let current = ContainerBuildStatus {
            state: ContainerBuildState::Running,
            ..Default::default()
        };
        let job = job("build", &[("Complete", None)], 0);

        let observed = observe_build_job(&current, &job, Utc::now());

        assert!(observed.violation.is_some());
        assert_eq!(observed.status.state, ContainerBuildState::Running);
        assert!(observed.status.message.is_some());
        assert!(observed.status.artifacts.is_none());
    }

    #[test]
    fn failed_job_carries_its_reason() {
        let job = job("build", &[("Failed", Some("BackoffLimitExceeded"))], 0);

        let observed = observe_build_job(&ContainerBuildStatus::default(), &job, Utc::now());

        assert_eq!(observed.status.state, ContainerBuildState::Failed);
        assert_eq!(observed.status.message.as_deref(), Some("BackoffLimitExceeded"));
    }

    #[test]
    fn oldest_job_survives_a_race() {
        let at = |secs| Some(Time(DateTime::from_timestamp(secs, 0).unwrap()));
        let mut first = job("b", &[], 0);
        first.metadata.creation_timestamp = at(100);
        let mut second = job("a", &[], 0);
        second.metadata.creation_timestamp = at(200);
        let mut third = job("c", &[], 0);
        third.metadata.creation_timestamp = at(100);

        let (oldest, duplicates) = split_oldest_job(vec![second, third, first]);

        assert_eq!(oldest.unwrap().name_any(), "b");
        assert_eq!(
            duplicates.iter().map(ResourceExt::name_any).collect::<Vec<_>>(),
            vec!["c", "a"]
        );
    }
}
