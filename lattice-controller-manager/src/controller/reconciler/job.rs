use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use k8s_openapi::api::batch::v1::Job as BatchJob;
use kube::{runtime::controller::Action, ResourceExt};
use lattice_core::{
    helpers::RequireMetadata,
    kubernetes::operations::{
        apply_resource_status, create_or_get_resource, list_resources, try_get_resource,
    },
    resources::{
        crd::v1::{
            job::{Job, JobRunRecord, JobRunState, JobState, JobStatus},
            node_pool::NodePool,
        },
        labels::get_job_run_listparams,
        meta::JobMeta,
        workload::{
            job_run::{generate_job_run, get_job_run_state},
            NodePoolPlacement,
        },
    },
};
use log::info;

use crate::controller::{events::REASON_STATE_CHANGED, requeue_with_jitter};

use super::{
    apply_node_pool, apply_params, context::ReconcilerContext, error::ReconcilerError,
    get_node_pool_availability, get_workload_node_pool_name, warn_on_status_error,
    NodePoolAvailability, PROGRESS_REQUEUE,
};

pub async fn reconcile_job(
    object: Arc<Job>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    match try_reconcile(&object, &context).await {
        Err(error) if !error.is_transient() => {
            let current = object.status.clone().unwrap_or_default();
            let status = match error.is_invariant_violation() {
                true => JobStatus {
                    message: Some(error.to_string()),
                    ..current.clone()
                },
                false => JobStatus {
                    state: JobState::Failed,
                    message: Some(error.to_string()),
                    completion_timestamp: Some(Utc::now()),
                    ..current.clone()
                },
            };
            warn_on_status_error(
                object.as_ref(),
                update_status(&object, &current, status, &context).await,
            );

            Err(error)
        }
        result => result,
    }
}

async fn try_reconcile(job: &Job, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let current = job.status.clone().unwrap_or_default();

    if current.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let name = job.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = job.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let now = Utc::now();

    let placement = match get_job_placement(job, context).await? {
        JobPlacement::Ready(placement) => placement,
        JobPlacement::Waiting(message) => {
            let status = JobStatus {
                observed_generation: job.metadata.generation,
                message: Some(message),
                ..current.clone()
            };
            update_status(job, &current, status, context).await?;

            return Ok(requeue_with_jitter(PROGRESS_REQUEUE));
        }
        JobPlacement::Failed(message) => {
            let status = JobStatus {
                observed_generation: job.metadata.generation,
                state: JobState::Failed,
                message: Some(message),
                completion_timestamp: Some(now),
                ..current.clone()
            };
            update_status(job, &current, status, context).await?;

            return Ok(Action::await_change());
        }
    };

    let observed = list_resources::<BatchJob>(&context.client, namespace, &get_job_run_listparams(name))
        .await?
        .iter()
        .map(|run| (run.name_any(), get_job_run_state(run)))
        .collect::<BTreeMap<_, _>>();

    let max_runs = 1 + job.spec.num_retries.unwrap_or_default().max(0) as usize;
    let step = step_job_runs(&current, &observed, max_runs, |run| job.get_run_name(run), now);

    if let Some(run) = step.start_run {
        context.ensure_running()?;

        info!("Starting run {run} of '{name}' job in '{namespace}' namespace...");

        let batch_job = generate_job_run(job, run, placement.as_ref())?;
        create_or_get_resource(&context.client, &batch_job).await?;
    }

    let status = JobStatus {
        observed_generation: job.metadata.generation,
        ..step.status
    };
    let state = status.state;

    update_status(job, &current, status, context).await?;

    Ok(match state.is_terminal() {
        true => Action::await_change(),
        false => requeue_with_jitter(PROGRESS_REQUEUE),
    })
}

enum JobPlacement {
    Ready(Option<NodePoolPlacement>),
    Waiting(String),
    Failed(String),
}

/// Jobs without a node pool run wherever the scheduler puts them.
async fn get_job_placement(job: &Job, context: &ReconcilerContext) -> Result<JobPlacement, ReconcilerError> {
    let namespace = job.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let definition = &job.spec.definition;
    let node_pool_name = get_workload_node_pool_name(
        &job.spec.path,
        definition.node_pool.as_ref(),
        definition.shared_node_pool.as_deref(),
    )?;

    let Some(node_pool_name) = node_pool_name else {
        return Ok(JobPlacement::Ready(None));
    };

    let node_pool = match &definition.node_pool {
        Some(node_pool) => {
            let system_id = context.system_id(namespace)?;

            Some(
                apply_node_pool(&context.client, job, &node_pool_name, system_id, node_pool)
                    .await?,
            )
        }
        None => try_get_resource::<NodePool>(&context.client, &node_pool_name, namespace).await?,
    };

    let Some(node_pool) = node_pool else {
        return Ok(JobPlacement::Waiting(format!(
            "waiting for node pool '{node_pool_name}'"
        )));
    };

    Ok(match get_node_pool_availability(namespace, &node_pool) {
        NodePoolAvailability::Ready(placement) => JobPlacement::Ready(Some(placement)),
        NodePoolAvailability::Waiting(_) => {
            JobPlacement::Waiting(format!("waiting for node pool '{node_pool_name}'"))
        }
        NodePoolAvailability::Failed(message) => {
            JobPlacement::Failed(format!("node pool '{node_pool_name}' failed: {message}"))
        }
    })
}

#[derive(Debug)]
struct JobStep {
    status: JobStatus,
    /// number of the run that has to be started
    start_run: Option<usize>,
}

/// Folds the observed batch jobs into the run records and decides whether
/// another run has to be started. Runs are numbered from 1.
fn step_job_runs(
    current: &JobStatus,
    observed: &BTreeMap<String, (JobRunState, Option<String>)>,
    max_runs: usize,
    run_name: impl Fn(usize) -> String,
    now: DateTime<Utc>,
) -> JobStep {
    let mut status = current.clone();

    for record in status.runs.iter_mut() {
        let Some((state, message)) = observed.get(&record.name) else {
            continue;
        };

        if matches!(record.state, JobRunState::Succeeded | JobRunState::Failed) {
            continue;
        }

        record.state = *state;
        record.message = message.clone();

        if matches!(state, JobRunState::Succeeded | JobRunState::Failed) {
            record.completion_timestamp = Some(now);
        }
    }

    let start = |status: &mut JobStatus, run: usize| {
        status.runs.push(JobRunRecord {
            name: run_name(run),
            state: JobRunState::Queued,
            message: None,
            start_timestamp: Some(now),
            completion_timestamp: None,
        });
        status.start_timestamp.get_or_insert(now);
        status.state = JobState::Running;
        status.message = None;

        Some(run)
    };

    let last = status.runs.last().map(|record| (record.state, record.message.clone(), record.name.clone()));
    let start_run = match last {
        None => start(&mut status, 1),
        Some((JobRunState::Succeeded, _, _)) => {
            status.state = JobState::Succeeded;
            status.message = None;
            status.completion_timestamp = Some(now);

            None
        }
        Some((JobRunState::Failed, message, _)) if status.runs.len() >= max_runs => {
            status.state = JobState::Failed;
            status.message = Some(format!(
                "{} run(s) failed, last one with: {}",
                status.runs.len(),
                message.as_deref().unwrap_or("unknown reason")
            ));
            status.completion_timestamp = Some(now);

            None
        }
        Some((JobRunState::Failed, _, _)) => {
            let run = status.runs.len() + 1;

            start(&mut status, run)
        }
        // the batch job of a recorded run is missing, created again under the same name
        Some((_, _, name)) if !observed.contains_key(&name) => {
            status.state = JobState::Running;

            Some(status.runs.len())
        }
        Some(_) => {
            status.state = JobState::Running;

            None
        }
    };

    JobStep { status, start_run }
}

async fn update_status(
    job: &Job,
    current: &JobStatus,
    status: JobStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    if status == *current {
        return Ok(());
    }

    let name = job.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = job.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;

    if status.state != current.state {
        context
            .events
            .normal(
                job,
                REASON_STATE_CHANGED,
                "ReconcileJob",
                status.message.clone().unwrap_or_else(|| status.state.to_string()),
            )
            .await;
    }

    apply_resource_status::<Job, _>(&context.client, status, name, namespace, &apply_params())
        .await?;

    Ok(())
}
