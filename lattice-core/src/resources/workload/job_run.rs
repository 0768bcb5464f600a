use std::collections::BTreeSet;

use k8s_openapi::api::{
    batch::v1::{Job as BatchJob, JobSpec as BatchJobSpec},
    core::v1::{PodSpec, PodTemplateSpec},
};
use kube::{core::ObjectMeta, Resource, ResourceExt};

use crate::{
    definition::component::MAIN_CONTAINER_NAME,
    helpers::RequireMetadata,
    resources::{
        crd::v1::job::{Job, JobRunState},
        labels::{get_job_run_labels, get_node_pool_labels, NODE_POOL_EPOCH_LABEL},
        meta::JobMeta,
        ResourceGenerationError,
    },
};

use super::{generate_container, generate_env, NodePoolPlacement};

/// Generates the batch job backing the `run`-th attempt of a lattice job. A
/// placed run carries the labels of its node pool epoch, which keeps the
/// epoch from being retired while the run is active.
pub fn generate_job_run(
    job: &Job,
    run: usize,
    placement: Option<&NodePoolPlacement>,
) -> Result<BatchJob, ResourceGenerationError> {
    let namespace = job
        .require_namespace_or(ResourceGenerationError::DependentMissingMetadataNamespace)?
        .to_owned();
    let job_name = job
        .require_name_or(ResourceGenerationError::DependentMissingMetadataName)?
        .to_owned();
    let owner_reference = job
        .controller_owner_ref(&())
        .ok_or(ResourceGenerationError::DependentMissingMetadataName)?;
    let labels = get_job_run_labels(&job_name);
    let mut run_labels = labels.clone();

    if let Some(placement) = placement {
        run_labels.extend(get_node_pool_labels(&placement.name, placement.epoch));
    }

    let mut containers = job
        .spec
        .definition
        .containers()
        .map(|(name, container)| generate_container(name, container, &job.spec.artifacts))
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(main) = containers
        .iter_mut()
        .find(|container| container.name == MAIN_CONTAINER_NAME)
    {
        if let Some(command) = &job.spec.command {
            main.command = Some(command.clone());
        }

        let mut env = job.spec.definition.container.env.clone();
        env.extend(job.spec.env.clone());
        main.env = generate_env(&env);
    }

    Ok(BatchJob {
        metadata: ObjectMeta {
            name: Some(job.get_run_name(run)),
            namespace: Some(namespace),
            labels: Some(run_labels),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: Some(BatchJobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    restart_policy: Some("Never".to_owned()),
                    affinity: placement.map(NodePoolPlacement::generate_affinity),
                    tolerations: placement.map(NodePoolPlacement::generate_tolerations),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Node pool epochs pinned by runs that haven't finished yet.
pub fn get_active_run_epochs(runs: &[BatchJob]) -> BTreeSet<u64> {
    runs.iter()
        .filter(|run| matches!(get_job_run_state(run).0, JobRunState::Queued | JobRunState::Running))
        .filter_map(|run| run.labels().get(NODE_POOL_EPOCH_LABEL)?.parse().ok())
        .collect()
}

/// Maps the status of a batch job onto the state of a run.
pub fn get_job_run_state(job: &BatchJob) -> (JobRunState, Option<String>) {
    let Some(status) = job.status.as_ref() else {
        return (JobRunState::Queued, None);
    };
    let terminal = status
        .conditions
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|condition| {
            (condition.type_ == "Complete" || condition.type_ == "Failed")
                && condition.status == "True"
        });

    match terminal {
        Some(condition) if condition.type_ == "Complete" => (JobRunState::Succeeded, None),
        Some(condition) => (
            JobRunState::Failed,
            condition
                .message
                .clone()
                .or_else(|| condition.reason.clone()),
        ),
        None if status.active.unwrap_or_default() > 0 || status.failed.unwrap_or_default() > 0 => {
            (JobRunState::Running, None)
        }
        None => (JobRunState::Queued, None),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus as BatchJobStatus};

    use crate::{
        definition::{component::JobDefinition, path::TreePath},
        resources::{
            crd::v1::job::JobSpec,
            workload::tests::{artifacts_for, http_container},
        },
    };

    use super::*;

    fn job() -> Job {
        let mut container = http_container(8080);
        container.env = BTreeMap::from([
            ("MODE".to_owned(), "default".to_owned()),
            ("REGION".to_owned(), "eu".to_owned()),
        ]);

        let mut job = Job::new(
            "migrate.shop",
            JobSpec {
                path: TreePath::new("/shop/migrate").unwrap(),
                definition: JobDefinition {
                    container,
                    ..Default::default()
                },
                artifacts: artifacts_for(&["main"]),
                num_retries: Some(2),
                command: Some(vec!["migrate".to_owned(), "--up".to_owned()]),
                env: BTreeMap::from([("MODE".to_owned(), "override".to_owned())]),
            },
        );
        job.metadata.namespace = Some("lattice-system-demo".to_owned());
        job.metadata.uid = Some("f00d".to_owned());

        job
    }

    #[test]
    fn run_overrides_command_and_env() {
        let run = generate_job_run(&job(), 1, None).unwrap();
        let spec = run.spec.unwrap();
        let main = &spec.template.spec.as_ref().unwrap().containers[0];
        let env = main
            .env
            .clone()
            .unwrap()
            .into_iter()
            .map(|var| (var.name, var.value.unwrap_or_default()))
            .collect::<BTreeMap<_, _>>();

        assert_eq!(run.metadata.name.as_deref(), Some("migrate.shop-run-1"));
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(
            main.command,
            Some(vec!["migrate".to_owned(), "--up".to_owned()])
        );
        assert_eq!(env.get("MODE").map(String::as_str), Some("override"));
        assert_eq!(env.get("REGION").map(String::as_str), Some("eu"));
    }

    #[test]
    fn run_state_follows_job_conditions() {
        let mut run = BatchJob::default();
        assert_eq!(get_job_run_state(&run).0, JobRunState::Queued);

        run.status = Some(BatchJobStatus {
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(get_job_run_state(&run).0, JobRunState::Running);

        run.status = Some(BatchJobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".to_owned(),
                status: "True".to_owned(),
                reason: Some("BackoffLimitExceeded".to_owned()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(
            get_job_run_state(&run),
            (JobRunState::Failed, Some("BackoffLimitExceeded".to_owned()))
        );
    }

    #[test]
    fn only_active_runs_pin_their_epoch() {
        let placement = NodePoolPlacement::new("svc-api.shop.lattice-system-demo", 2);
        let mut active = generate_job_run(&job(), 0, Some(&placement)).unwrap();
        active.status = Some(BatchJobStatus {
            active: Some(1),
            ..Default::default()
        });

        let retired = NodePoolPlacement::new("svc-api.shop.lattice-system-demo", 1);
        let mut finished = generate_job_run(&job(), 1, Some(&retired)).unwrap();
        finished.status = Some(BatchJobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".to_owned(),
                status: "True".to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        });

        let unplaced = generate_job_run(&job(), 2, None).unwrap();

        assert_eq!(
            active.labels().get("node-pool.lattice.dev/epoch").map(String::as_str),
            Some("2")
        );
        assert_eq!(
            get_active_run_epochs(&[active, finished, unplaced]),
            BTreeSet::from([2])
        );
    }
}
