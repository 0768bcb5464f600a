use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use kube::{api::ListParams, core::ObjectMeta, runtime::controller::Action, Resource, ResourceExt};
use lattice_core::{
    definition::{
        component::ContainerBuildDefinition, hash::definition_hash, path::TreePath,
        tree::ResolvedDefinition,
    },
    helpers::RequireMetadata,
    kubernetes::operations::{
        add_owner_reference, apply_resource_status, create_or_get_resource, list_resources,
        merge_annotations, shared_owner_reference, try_get_resource,
    },
    resources::{
        annotations::{get_build_definition_hash_annotations, RESOLVED_TREE_HASH_ANNOTATION},
        crd::v1::{
            build::{Build, BuildContainerBuildStatus, BuildSpec, BuildState, BuildStatus, BuildWorkload},
            container_build::{ContainerBuild, ContainerBuildSpec, ContainerBuildState},
            system::System,
        },
        labels::{get_container_build_labels, BUILD_DEFINITION_HASH_LABEL},
        meta::get_container_build_name,
    },
};
use log::{info, warn};

use crate::{
    controller::{
        events::REASON_STATE_CHANGED,
        requeue_with_jitter,
    },
    provider::resolver::{ResolveError, ResolveTarget},
};

use super::{
    apply_params, context::ReconcilerContext, error::ReconcilerError, warn_on_status_error,
    PROGRESS_REQUEUE,
};

pub async fn reconcile_build(
    object: Arc<Build>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    match try_reconcile(&object, &context).await {
        Ok(action) => Ok(action),
        Err(error) if !error.is_transient() => {
            let mut status = object.status.clone().unwrap_or_default();

            match error.is_invariant_violation() {
                true => status.message = Some(error.to_string()),
                false => fail(&mut status, error.to_string(), Utc::now()),
            }

            warn_on_status_error(object.as_ref(), apply_status(&object, status, &context).await);

            Err(error)
        }
        Err(error) => Err(error),
    }
}

async fn try_reconcile(build: &Build, context: &ReconcilerContext) -> Result<Action, ReconcilerError> {
    let mut current = build.status.clone().unwrap_or_default();

    if current.state.is_terminal() {
        return Ok(Action::await_change());
    }

    let namespace = build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let system_id = context.system_id(namespace)?;
    let now = Utc::now();
    let mut status = current.clone();

    let definition = match current.definition.clone() {
        Some(definition) => definition,
        None => {
            let system = try_get_resource::<System>(&context.client, system_id, namespace)
                .await?
                .ok_or_else(|| {
                    ReconcilerError::MissingObjectData(format!("system '{system_id}'").into())
                })?;

            match resolve_definition(build, &system, context).await {
                Ok((version, definition)) => {
                    let hash = definition_hash(&definition)?;

                    merge_annotations(
                        &context.client,
                        build,
                        &BTreeMap::from([(RESOLVED_TREE_HASH_ANNOTATION.to_owned(), hash)]),
                    )
                    .await?;

                    status.version = Some(version);
                    status.definition = Some(definition.clone());
                    status.state = BuildState::Accepted;
                    status.message = None;
                    status.start_timestamp = Some(now);
                    status.observed_generation = build.metadata.generation;

                    // persisted before the fan out so a restart doesn't resolve again
                    publish_state_change(build, &current, &status, context).await;
                    apply_status(build, status.clone(), context).await?;
                    current = status.clone();

                    definition
                }
                Err(error) if error.is_terminal() => {
                    warn!("Build '{}' couldn't be resolved! {error}", build.name_any());

                    fail(&mut status, error.to_string(), now);
                    publish_state_change(build, &current, &status, context).await;
                    apply_status(build, status, context).await?;

                    return Ok(Action::await_change());
                }
                Err(error) => return Err(error.into()),
            }
        }
    };

    context.ensure_running()?;

    let fan_out = ensure_container_builds(build, &definition, &current, context).await?;

    status.workloads = fan_out.workloads;
    status.container_builds = fan_out
        .container_builds
        .iter()
        .map(|container_build| {
            (
                container_build.name_any(),
                get_container_build_summary(container_build),
            )
        })
        .collect();

    let (state, message) = aggregate_build_state(&status);

    status.state = state;
    status.message = message;

    if status.state.is_terminal() {
        status.completion_timestamp = Some(now);
    }

    if status != current {
        publish_state_change(build, &current, &status, context).await;
        apply_status(build, status.clone(), context).await?;
    }

    match status.state.is_terminal() {
        true => Ok(Action::await_change()),
        false => Ok(requeue_with_jitter(PROGRESS_REQUEUE)),
    }
}

async fn resolve_definition(
    build: &Build,
    system: &System,
    context: &ReconcilerContext,
) -> Result<(String, ResolvedDefinition), ResolveError> {
    let target = get_resolve_target(&build.spec, system.spec.version.as_deref())?;

    info!(
        "Resolving '{}' at {target:?} for build '{}'...",
        system.spec.definition_url,
        build.name_any()
    );

    let definition = context
        .providers
        .resolver
        .resolve(&system.spec.definition_url, &target)
        .await?;

    Ok((target.version().to_owned(), definition))
}

/// Path builds resolve against the version the system currently runs.
fn get_resolve_target(
    spec: &BuildSpec,
    deployed_version: Option<&str>,
) -> Result<ResolveTarget, ResolveError> {
    match (&spec.version, &spec.path) {
        (Some(version), None) => Ok(ResolveTarget::Version(version.to_owned())),
        (None, Some(path)) => {
            let version = deployed_version.ok_or(ResolveError::InvalidTarget(
                "path builds need a system with a deployed version".into(),
            ))?;

            Ok(ResolveTarget::Path {
                version: version.to_owned(),
                path: path.clone(),
            })
        }
        _ => Err(ResolveError::InvalidTarget(
            "exactly one of version and path has to be set".into(),
        )),
    }
}

struct FanOut {
    workloads: BTreeMap<TreePath, BuildWorkload>,
    container_builds: Vec<ContainerBuild>,
}

/// Makes sure every distinct container build definition of the tree has a
/// ContainerBuild in the namespace, reusing any that isn't failed.
async fn ensure_container_builds(
    build: &Build,
    definition: &ResolvedDefinition,
    current: &BuildStatus,
    context: &ReconcilerContext,
) -> Result<FanOut, ReconcilerError> {
    let namespace = build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let mut definitions = BTreeMap::<String, &ContainerBuildDefinition>::new();
    let mut workload_hashes = Vec::new();

    for workload in definition.container_builds() {
        let hash = definition_hash(workload.definition)?;

        definitions.entry(hash.to_owned()).or_insert(workload.definition);
        workload_hashes.push((workload.path, workload.container, hash));
    }

    let existing = list_resources::<ContainerBuild>(
        &context.client,
        namespace,
        &ListParams::default().labels(BUILD_DEFINITION_HASH_LABEL),
    )
    .await?;
    let referenced = current
        .workloads
        .values()
        .flat_map(|workload| workload.containers.values().cloned())
        .collect::<BTreeSet<_>>();

    let mut names = BTreeMap::new();
    let mut container_builds = Vec::new();

    for (hash, container_build_definition) in definitions {
        context.ensure_running()?;

        let candidates = existing
            .iter()
            .filter(|container_build| {
                container_build.labels().get(BUILD_DEFINITION_HASH_LABEL) == Some(&hash)
            })
            .collect::<Vec<_>>();

        let container_build = match select_container_build(&candidates, &referenced) {
            ContainerBuildSelection::Reuse(container_build) => container_build.clone(),
            ContainerBuildSelection::Create(attempt) => {
                let container_build = generate_container_build(
                    build,
                    &hash,
                    attempt,
                    container_build_definition,
                )?;

                create_or_get_resource(&context.client, &container_build).await?
            }
        };

        let container_build = match shared_owner_reference(build) {
            Some(owner) => add_owner_reference(&context.client, &container_build, owner).await?,
            None => container_build,
        };

        names.insert(hash, container_build.name_any());
        container_builds.push(container_build);
    }

    let mut workloads = BTreeMap::<TreePath, BuildWorkload>::new();
    for (path, container, hash) in workload_hashes {
        if let Some(name) = names.get(&hash) {
            workloads
                .entry(path.clone())
                .or_default()
                .containers
                .insert(container.to_owned(), name.to_owned());
        }
    }

    Ok(FanOut {
        workloads,
        container_builds,
    })
}

#[derive(Debug)]
enum ContainerBuildSelection<'a> {
    Reuse(&'a ContainerBuild),
    Create(usize),
}

/// A container build this build already references is kept whatever its
/// state, otherwise the best non-failed candidate is reused. With only
/// failed candidates left a new attempt is numbered after the last one.
fn select_container_build<'a>(
    candidates: &[&'a ContainerBuild],
    referenced: &BTreeSet<String>,
) -> ContainerBuildSelection<'a> {
    if let Some(container_build) = candidates
        .iter()
        .find(|container_build| referenced.contains(&container_build.name_any()))
    {
        return ContainerBuildSelection::Reuse(container_build);
    }

    let state = |container_build: &ContainerBuild| {
        container_build
            .status
            .as_ref()
            .map(|status| status.state)
            .unwrap_or_default()
    };

    let reusable = candidates
        .iter()
        .filter(|container_build| state(container_build) != ContainerBuildState::Failed)
        .min_by_key(|container_build| {
            (
                state(container_build) != ContainerBuildState::Succeeded,
                container_build.creation_timestamp().map(|time| time.0),
                container_build.name_any(),
            )
        });

    if let Some(container_build) = reusable {
        return ContainerBuildSelection::Reuse(container_build);
    }

    let next_attempt = candidates
        .iter()
        .filter_map(|container_build| {
            container_build
                .name_any()
                .rsplit_once('-')
                .and_then(|(_, attempt)| attempt.parse::<usize>().ok())
        })
        .max()
        .map_or(candidates.len(), |attempt| (attempt + 1).max(candidates.len()));

    ContainerBuildSelection::Create(next_attempt)
}

fn generate_container_build(
    build: &Build,
    hash: &str,
    attempt: usize,
    definition: &ContainerBuildDefinition,
) -> Result<ContainerBuild, ReconcilerError> {
    let owner_reference = build
        .controller_owner_ref(&())
        .ok_or(ReconcilerError::MissingObjectMetadata)?;

    Ok(ContainerBuild {
        metadata: ObjectMeta {
            name: Some(get_container_build_name(hash, attempt)),
            namespace: build.namespace(),
            labels: Some(get_container_build_labels(hash)),
            annotations: Some(get_build_definition_hash_annotations(hash)),
            owner_references: Some(vec![owner_reference]),
            ..Default::default()
        },
        spec: ContainerBuildSpec {
            definition: definition.clone(),
        },
        status: None,
    })
}

fn get_container_build_summary(container_build: &ContainerBuild) -> BuildContainerBuildStatus {
    let status = container_build.status.clone().unwrap_or_default();

    BuildContainerBuildStatus {
        state: status.state,
        last_observed_phase: status.last_observed_phase,
        failure_message: match status.state {
            ContainerBuildState::Failed => status.message,
            _ => None,
        },
        artifacts: status.artifacts,
    }
}

/// Succeeded once every container build published its image, failed once
/// one failed and the rest finished.
fn aggregate_build_state(status: &BuildStatus) -> (BuildState, Option<String>) {
    let summaries = &status.container_builds;
    let is_built = |summary: &BuildContainerBuildStatus| {
        summary.state == ContainerBuildState::Succeeded
            && summary
                .artifacts
                .as_ref()
                .is_some_and(|artifacts| !artifacts.is_empty())
    };

    if summaries.values().all(is_built) {
        return (BuildState::Succeeded, None);
    }

    let all_terminal = summaries.values().all(|summary| summary.state.is_terminal());
    let failed = summaries
        .iter()
        .filter(|(_, summary)| summary.state == ContainerBuildState::Failed)
        .map(|(name, _)| name.as_str())
        .collect::<BTreeSet<_>>();

    if failed.is_empty() || !all_terminal {
        return (BuildState::Running, None);
    }

    let failed_paths = status
        .workloads
        .iter()
        .flat_map(|(path, workload)| {
            workload
                .containers
                .iter()
                .filter(|(_, name)| failed.contains(name.as_str()))
                .map(move |(container, _)| format!("{path} ({container})"))
        })
        .collect::<Vec<_>>();

    (
        BuildState::Failed,
        Some(format!("container builds failed for {}", failed_paths.join(", "))),
    )
}

fn fail(status: &mut BuildStatus, message: String, now: DateTime<Utc>) {
    status.state = BuildState::Failed;
    status.message = Some(message);
    status.completion_timestamp = Some(now);
}

async fn publish_state_change(
    build: &Build,
    current: &BuildStatus,
    status: &BuildStatus,
    context: &ReconcilerContext,
) {
    if current.state == status.state {
        return;
    }

    let note = status
        .message
        .clone()
        .unwrap_or_else(|| status.state.to_string());

    match status.state {
        BuildState::Failed => {
            context
                .events
                .warning(build, REASON_STATE_CHANGED, "ReconcileBuild", note)
                .await
        }
        _ => {
            context
                .events
                .normal(build, REASON_STATE_CHANGED, "ReconcileBuild", note)
                .await
        }
    }
}

async fn apply_status(
    build: &Build,
    status: BuildStatus,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    apply_resource_status::<Build, _>(
        &context.client,
        status,
        build.require_name_or(ReconcilerError::MissingObjectMetadata)?,
        build.require_namespace_or(ReconcilerError::MissingObjectMetadata)?,
        &apply_params(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use lattice_core::resources::crd::v1::container_build::{
        ContainerBuildArtifacts, ContainerBuildStatus,
    };

    use super::*;

    fn container_build(name: &str, state: ContainerBuildState, created_at: i64) -> ContainerBuild {
        let mut container_build = ContainerBuild::new(name, ContainerBuildSpec::default());
        container_build.metadata.creation_timestamp =
            DateTime::from_timestamp(created_at, 0).map(Time);
        container_build.status = Some(ContainerBuildStatus {
            state,
            ..Default::default()
        });

        container_build
    }

    fn summary(state: ContainerBuildState, built: bool) -> BuildContainerBuildStatus {
        BuildContainerBuildStatus {
            state,
            artifacts: built.then(|| ContainerBuildArtifacts::from_fqn("registry.local/api:abc", None))
                .flatten(),
            ..Default::default()
        }
    }

    fn status(summaries: &[(&str, &str, BuildContainerBuildStatus)]) -> BuildStatus {
        let mut status = BuildStatus::default();

        for (path, name, summary) in summaries {
            status
                .workloads
                .entry(TreePath::new(path).unwrap())
                .or_default()
                .containers
                .insert("main".to_owned(), name.to_string());
            status
                .container_builds
                .insert(name.to_string(), summary.clone());
        }

        status
    }

    #[test]
    fn version_and_path_targets() {
        let by_version = BuildSpec {
            version: Some("v1.0.0".to_owned()),
            path: None,
        };
        let by_path = BuildSpec {
            version: None,
            path: Some(TreePath::new("/shop").unwrap()),
        };

        assert_eq!(
            get_resolve_target(&by_version, None).unwrap(),
            ResolveTarget::Version("v1.0.0".to_owned())
        );
        assert_eq!(
            get_resolve_target(&by_path, Some("v0.9.0")).unwrap(),
            ResolveTarget::Path {
                version: "v0.9.0".to_owned(),
                path: TreePath::new("/shop").unwrap()
            }
        );
        assert!(get_resolve_target(&by_path, None).unwrap_err().is_terminal());
        assert!(get_resolve_target(&BuildSpec::default(), Some("v1")).is_err());
    }

    #[test]
    fn succeeded_container_build_is_reused_before_running_ones() {
        let running = container_build("abc-1", ContainerBuildState::Running, 100);
        let succeeded = container_build("abc-0", ContainerBuildState::Succeeded, 200);
        let candidates = [&running, &succeeded];

        assert!(matches!(
            select_container_build(&candidates, &BTreeSet::new()),
            ContainerBuildSelection::Reuse(selected) if selected.name_any() == "abc-0"
        ));
    }

    #[test]
    fn concurrent_builds_settle_on_the_same_container_build() {
        let failed = container_build("abc-0", ContainerBuildState::Failed, 100);
        let older = container_build("abc-1", ContainerBuildState::Running, 200);
        let newer = container_build("abc-2", ContainerBuildState::Running, 300);
        let queued = container_build("abc-3", ContainerBuildState::Pending, 200);

        let selected = |candidates: &[&ContainerBuild]| {
            match select_container_build(candidates, &BTreeSet::new()) {
                ContainerBuildSelection::Reuse(selected) => Some(selected.name_any()),
                ContainerBuildSelection::Create(_) => None,
            }
        };

        assert_eq!(selected(&[&failed, &newer, &older, &queued]).as_deref(), Some("abc-1"));
        assert_eq!(selected(&[&queued, &older, &newer, &failed]).as_deref(), Some("abc-1"));

        let mut succeeded = newer.clone();
        succeeded.status = Some(ContainerBuildStatus {
            state: ContainerBuildState::Succeeded,
            ..Default::default()
        });
        assert_eq!(selected(&[&older, &succeeded, &failed]).as_deref(), Some("abc-2"));

        // both racers number the retry the same way, so the create deduplicates
        let retried = container_build("abc-1", ContainerBuildState::Failed, 200);
        assert!(matches!(
            select_container_build(&[&retried, &failed], &BTreeSet::new()),
            ContainerBuildSelection::Create(2)
        ));
        assert!(matches!(
            select_container_build(&[&failed, &retried], &BTreeSet::new()),
            ContainerBuildSelection::Create(2)
        ));
    }

    #[test]
    fn failed_container_builds_get_a_new_attempt() {
        let first = container_build("abc-0", ContainerBuildState::Failed, 100);
        let second = container_build("abc-1", ContainerBuildState::Failed, 200);

        assert!(matches!(
            select_container_build(&[], &BTreeSet::new()),
            ContainerBuildSelection::Create(0)
        ));
        assert!(matches!(
            select_container_build(&[&first, &second], &BTreeSet::new()),
            ContainerBuildSelection::Create(2)
        ));
    }

    #[test]
    fn referenced_failed_container_build_is_kept() {
        let failed = container_build("abc-0", ContainerBuildState::Failed, 100);
        let referenced = BTreeSet::from(["abc-0".to_owned()]);

        assert!(matches!(
            select_container_build(&[&failed], &referenced),
            ContainerBuildSelection::Reuse(selected) if selected.name_any() == "abc-0"
        ));
    }

    #[test]
    fn build_succeeds_once_every_image_is_published() {
        let built = status(&[
            ("/shop/api", "abc-0", summary(ContainerBuildState::Succeeded, true)),
            ("/shop/web", "def-0", summary(ContainerBuildState::Succeeded, true)),
        ]);
        let missing_artifacts = status(&[(
            "/shop/api",
            "abc-0",
            summary(ContainerBuildState::Succeeded, false),
        )]);

        assert_eq!(aggregate_build_state(&built), (BuildState::Succeeded, None));
        assert_eq!(
            aggregate_build_state(&missing_artifacts).0,
            BuildState::Running
        );
    }

    #[test]
    fn build_fails_only_after_the_rest_finished() {
        let still_running = status(&[
            ("/shop/api", "abc-0", summary(ContainerBuildState::Failed, false)),
            ("/shop/web", "def-0", summary(ContainerBuildState::Running, false)),
        ]);
        let finished = status(&[
            ("/shop/api", "abc-0", summary(ContainerBuildState::Failed, false)),
            ("/shop/web", "def-0", summary(ContainerBuildState::Succeeded, true)),
        ]);

        assert_eq!(aggregate_build_state(&still_running).0, BuildState::Running);

        let (state, message) = aggregate_build_state(&finished);
        assert_eq!(state, BuildState::Failed);
        assert_eq!(
            message.as_deref(),
            Some("container builds failed for /shop/api (main)")
        );
    }
}
