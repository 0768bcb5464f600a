use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use kube::{
    api::{ListParams, PostParams},
    core::ObjectMeta,
    runtime::controller::Action,
    Resource, ResourceExt,
};
use lattice_core::{
    helpers::{Deleted, RequireMetadata},
    kubernetes::{
        operations::{apply_resource_status, create_or_get_resource, list_resources, try_get_resource},
        GetApi,
    },
    resources::crd::v1::{
        build::{Build, BuildSpec, BuildState, BuildStatus},
        deploy::{Deploy, DeployState, DeployStatus},
        system::{System, SystemJobSpec, SystemServiceSpec, SystemSpec, SystemState},
        teardown::{Teardown, TeardownState, TeardownStatus},
    },
};
use log::{info, warn};

use crate::{
    controller::{events::REASON_STATE_CHANGED, requeue_with_jitter},
    provider::resolver::ResolveError,
};

use super::{
    apply_params, context::ReconcilerContext, error::ReconcilerError, PROGRESS_REQUEUE,
    SUCCESS_REQUEUE,
};

/// Deploys and teardowns of a system are reconciled under the key of the
/// system, so only one of them can hold it at a time.
pub async fn reconcile_lifecycle(
    system: Arc<System>,
    context: Arc<ReconcilerContext>,
) -> Result<Action, ReconcilerError> {
    if system.is_deleted() {
        return Ok(Action::await_change());
    }

    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let deploys = list_resources::<Deploy>(&context.client, namespace, &ListParams::default()).await?;
    let teardowns =
        list_resources::<Teardown>(&context.client, namespace, &ListParams::default()).await?;

    let requests = deploys
        .iter()
        .map(LifecycleRequest::Deploy)
        .chain(teardowns.iter().map(LifecycleRequest::Teardown))
        .collect::<Vec<_>>();

    let Some(request) = select_request(&requests) else {
        return Ok(requeue_with_jitter(SUCCESS_REQUEUE));
    };

    let active = match request {
        LifecycleRequest::Deploy(deploy) => reconcile_deploy(&system, deploy, &context).await?,
        LifecycleRequest::Teardown(teardown) => {
            reconcile_teardown(&system, teardown, &context).await?
        }
    };

    Ok(match active {
        true => requeue_with_jitter(PROGRESS_REQUEUE),
        // the next pending request can go right away
        false => Action::requeue(Duration::ZERO),
    })
}

#[derive(Debug, Clone, Copy)]
enum LifecycleRequest<'a> {
    Deploy(&'a Deploy),
    Teardown(&'a Teardown),
}

impl LifecycleRequest<'_> {
    fn sort_key(&self) -> (Option<DateTime<Utc>>, String) {
        let meta = match self {
            LifecycleRequest::Deploy(deploy) => deploy.meta(),
            LifecycleRequest::Teardown(teardown) => teardown.meta(),
        };

        (
            meta.creation_timestamp.as_ref().map(|time| time.0),
            meta.name.clone().unwrap_or_default(),
        )
    }

    fn is_active(&self) -> bool {
        match self {
            LifecycleRequest::Deploy(deploy) => deploy
                .status
                .as_ref()
                .is_some_and(|status| status.state.is_active()),
            LifecycleRequest::Teardown(teardown) => teardown
                .status
                .as_ref()
                .is_some_and(|status| status.state == TeardownState::InProgress),
        }
    }

    fn is_pending(&self) -> bool {
        match self {
            LifecycleRequest::Deploy(deploy) => deploy
                .status
                .as_ref()
                .map_or(true, |status| status.state == DeployState::Pending),
            LifecycleRequest::Teardown(teardown) => teardown
                .status
                .as_ref()
                .map_or(true, |status| status.state == TeardownState::Pending),
        }
    }
}

/// The request holding the system, or the oldest pending one when none does.
fn select_request<'a>(requests: &[LifecycleRequest<'a>]) -> Option<LifecycleRequest<'a>> {
    let oldest = |filter: fn(&LifecycleRequest<'a>) -> bool| {
        requests
            .iter()
            .filter(|request| filter(request))
            .min_by_key(|request| request.sort_key())
            .copied()
    };

    oldest(LifecycleRequest::is_active).or_else(|| oldest(LifecycleRequest::is_pending))
}

/// Returns whether the deploy still holds the system.
async fn reconcile_deploy(
    system: &System,
    deploy: &Deploy,
    context: &ReconcilerContext,
) -> Result<bool, ReconcilerError> {
    let namespace = deploy.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = deploy.status.clone().unwrap_or_default();
    let now = Utc::now();

    let status = match current.state {
        DeployState::Pending => accept_deploy(system, deploy, context, now).await?,
        DeployState::Accepted => {
            let build_name = current.build.clone().unwrap_or_default();
            let build = try_get_resource::<Build>(&context.client, &build_name, namespace).await?;

            match build.map(|build| build.status) {
                None => fail_deploy(&current, format!("build '{build_name}' is gone"), now),
                Some(None) => current.clone(),
                Some(Some(build)) if build.state == BuildState::Failed => fail_deploy(
                    &current,
                    format!(
                        "build '{build_name}' failed: {}",
                        build.message.as_deref().unwrap_or("unknown reason")
                    ),
                    now,
                ),
                Some(Some(build)) if build.state == BuildState::Succeeded => {
                    match get_deployed_spec(&system.spec, &build) {
                        Ok(spec) => {
                            update_system_spec(system, spec, context).await?;

                            DeployStatus {
                                state: DeployState::InProgress,
                                message: None,
                                ..current.clone()
                            }
                        }
                        Err(message) => fail_deploy(&current, message, now),
                    }
                }
                Some(Some(_)) => current.clone(),
            }
        }
        DeployState::InProgress => step_deploy_rollout(
            &current,
            get_observed_system_state(&get_latest_system(system, context).await?),
            now,
            context.settings.deploy_degraded_timeout,
        ),
        DeployState::Succeeded | DeployState::Failed => current.clone(),
    };

    let active = status.state.is_active();

    if status != current {
        if status.state != current.state {
            publish_transition(deploy, &status.state, status.message.as_deref(), context).await;
        }

        let name = deploy.require_name_or(ReconcilerError::MissingObjectMetadata)?;
        apply_resource_status::<Deploy, _>(&context.client, status, name, namespace, &apply_params())
            .await?;
    }

    Ok(active)
}

async fn accept_deploy(
    system: &System,
    deploy: &Deploy,
    context: &ReconcilerContext,
    now: DateTime<Utc>,
) -> Result<DeployStatus, ReconcilerError> {
    let namespace = deploy.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let name = deploy.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let current = deploy.status.clone().unwrap_or_default();

    let build_name = match (&deploy.spec.version, &deploy.spec.build) {
        (Some(version), None) => {
            let definition_url = &system.spec.definition_url;
            let listed = context.providers.resolver.list_versions(definition_url).await;

            if let Some(message) = get_version_rejection(listed, definition_url, version)? {
                return Ok(fail_deploy(&current, message, now));
            }

            let owner_reference = system
                .controller_owner_ref(&())
                .ok_or(ReconcilerError::MissingObjectMetadata)?;
            let build = Build {
                metadata: ObjectMeta {
                    name: Some(name.to_owned()),
                    namespace: Some(namespace.to_owned()),
                    owner_references: Some(vec![owner_reference]),
                    ..Default::default()
                },
                spec: BuildSpec {
                    version: Some(version.to_owned()),
                    path: None,
                },
                status: None,
            };

            info!("Building version '{version}' for '{name}' deploy...");

            create_or_get_resource(&context.client, &build).await?.name_any()
        }
        (None, Some(build)) => {
            if try_get_resource::<Build>(&context.client, build, namespace)
                .await?
                .is_none()
            {
                return Ok(fail_deploy(&current, format!("build '{build}' doesn't exist"), now));
            }

            build.to_owned()
        }
        _ => {
            return Ok(fail_deploy(
                &current,
                "exactly one of version and build has to be set".to_owned(),
                now,
            ))
        }
    };

    Ok(DeployStatus {
        state: DeployState::Accepted,
        message: None,
        build: Some(build_name),
        start_timestamp: Some(now),
        ..current
    })
}

/// Failure message for a version the repository doesn't have. Listing
/// errors that may go away are returned instead.
fn get_version_rejection(
    listed: Result<Vec<String>, ResolveError>,
    definition_url: &str,
    version: &str,
) -> Result<Option<String>, ResolveError> {
    match listed {
        Ok(versions) if versions.iter().any(|listed| listed == version) => Ok(None),
        Ok(_) => Ok(Some(
            ResolveError::UnknownVersion(definition_url.to_owned(), version.to_owned()).to_string(),
        )),
        Err(error) if error.is_terminal() => Ok(Some(error.to_string())),
        Err(error) => Err(error),
    }
}

fn fail_deploy(current: &DeployStatus, message: String, now: DateTime<Utc>) -> DeployStatus {
    DeployStatus {
        state: DeployState::Failed,
        message: Some(message),
        completion_timestamp: Some(now),
        ..current.clone()
    }
}

/// System spec running the workloads of a finished build.
fn get_deployed_spec(current: &SystemSpec, build: &BuildStatus) -> Result<SystemSpec, String> {
    let definition = build
        .definition
        .as_ref()
        .ok_or_else(|| "build has no resolved definition".to_owned())?;

    let services = definition
        .services
        .iter()
        .map(|(path, service)| {
            let artifacts = build
                .workload_artifacts(path)
                .ok_or_else(|| format!("artifacts of service '{path}' are missing"))?;

            Ok((
                path.clone(),
                SystemServiceSpec {
                    definition: service.clone(),
                    artifacts,
                },
            ))
        })
        .collect::<Result<BTreeMap<_, _>, String>>()?;

    let jobs = definition
        .jobs
        .iter()
        .map(|(path, job)| {
            let artifacts = build
                .workload_artifacts(path)
                .ok_or_else(|| format!("artifacts of job '{path}' are missing"))?;

            Ok((
                path.clone(),
                SystemJobSpec {
                    definition: job.clone(),
                    artifacts,
                },
            ))
        })
        .collect::<Result<BTreeMap<_, _>, String>>()?;

    Ok(SystemSpec {
        definition_url: current.definition_url.clone(),
        version: build.version.clone(),
        services,
        jobs,
        node_pools: definition.node_pools.clone(),
    })
}

/// State of the system once it has seen its latest spec.
fn get_observed_system_state(system: &System) -> Option<SystemState> {
    let status = system.status.as_ref()?;

    (status.observed_generation == system.metadata.generation).then_some(status.state)
}

fn step_deploy_rollout(
    current: &DeployStatus,
    system: Option<SystemState>,
    now: DateTime<Utc>,
    degraded_timeout: Duration,
) -> DeployStatus {
    match system {
        Some(SystemState::Stable) => DeployStatus {
            state: DeployState::Succeeded,
            message: None,
            completion_timestamp: Some(now),
            degraded_since: None,
            ..current.clone()
        },
        Some(SystemState::Degraded) => {
            let since = current.degraded_since.unwrap_or(now);
            let degraded_for = (now - since).to_std().unwrap_or_default();

            match degraded_for >= degraded_timeout {
                true => DeployStatus {
                    degraded_since: Some(since),
                    ..fail_deploy(
                        current,
                        format!("system stayed degraded for {}s", degraded_for.as_secs()),
                        now,
                    )
                },
                false => DeployStatus {
                    degraded_since: Some(since),
                    ..current.clone()
                },
            }
        }
        Some(SystemState::Failed) => fail_deploy(current, "system failed".to_owned(), now),
        _ => DeployStatus {
            degraded_since: None,
            ..current.clone()
        },
    }
}

/// Returns whether the teardown still holds the system.
async fn reconcile_teardown(
    system: &System,
    teardown: &Teardown,
    context: &ReconcilerContext,
) -> Result<bool, ReconcilerError> {
    let namespace = teardown.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let current = teardown.status.clone().unwrap_or_default();
    let now = Utc::now();

    let status = match current.state {
        TeardownState::Pending => {
            let spec = SystemSpec {
                version: None,
                services: BTreeMap::new(),
                jobs: BTreeMap::new(),
                ..system.spec.clone()
            };

            info!("Tearing down '{}' system...", system.name_any());

            update_system_spec(system, spec, context).await?;

            TeardownStatus {
                state: TeardownState::InProgress,
                message: None,
                start_timestamp: Some(now),
                ..current.clone()
            }
        }
        TeardownState::InProgress => {
            let system = get_latest_system(system, context).await?;

            let emptied = system.spec.services.is_empty() && system.spec.jobs.is_empty();

            match (get_observed_system_state(&system), emptied) {
                (Some(SystemState::Stable), true) => TeardownStatus {
                    state: TeardownState::Succeeded,
                    completion_timestamp: Some(now),
                    ..current.clone()
                },
                (Some(SystemState::Failed), _) => TeardownStatus {
                    state: TeardownState::Failed,
                    message: Some("system failed".to_owned()),
                    completion_timestamp: Some(now),
                    ..current.clone()
                },
                _ => current.clone(),
            }
        }
        TeardownState::Succeeded | TeardownState::Failed => current.clone(),
    };

    let active = status.state == TeardownState::InProgress;

    if status != current {
        if status.state != current.state {
            publish_transition(teardown, &status.state, status.message.as_deref(), context).await;
        }

        let name = teardown.require_name_or(ReconcilerError::MissingObjectMetadata)?;
        apply_resource_status::<Teardown, _>(&context.client, status, name, namespace, &apply_params())
            .await?;
    }

    Ok(active)
}

/// The cached system may predate a spec replaced by an earlier reconciliation.
async fn get_latest_system(system: &System, context: &ReconcilerContext) -> Result<System, ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;

    Ok(context.namespaced_api::<System>(namespace).get(name).await?)
}

/// Replaces the spec of the latest system, a concurrent change fails with a conflict.
async fn update_system_spec(
    system: &System,
    spec: SystemSpec,
    context: &ReconcilerContext,
) -> Result<(), ReconcilerError> {
    let name = system.require_name_or(ReconcilerError::MissingObjectMetadata)?;
    let namespace = system.require_namespace_or(ReconcilerError::MissingObjectMetadata)?;
    let mut latest = get_latest_system(system, context).await?;
    latest.spec = spec;

    context
        .namespaced_api::<System>(namespace)
        .replace(name, &PostParams::default(), &latest)
        .await?;

    Ok(())
}

async fn publish_transition<K>(
    resource: &K,
    state: &impl std::fmt::Display,
    message: Option<&str>,
    context: &ReconcilerContext,
) where
    K: Resource<DynamicType = ()>,
{
    if let Some(message) = message {
        warn!(
            "{} '{}': {message}",
            K::kind(&()),
            resource.meta().name.as_deref().unwrap_or_default()
        );
    }

    context
        .events
        .normal(
            resource,
            REASON_STATE_CHANGED,
            "ReconcileLifecycle",
            message.map_or_else(|| state.to_string(), str::to_owned),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use lattice_core::{
        definition::{
            component::{JobDefinition, ServiceDefinition},
            path::TreePath,
            tree::ResolvedDefinition,
        },
        resources::crd::v1::{
            build::{BuildContainerBuildStatus, BuildWorkload},
            container_build::{ContainerBuildArtifacts, ContainerBuildState},
            deploy::DeploySpec,
            teardown::TeardownSpec,
        },
    };

    use super::*;

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, 0).unwrap()
    }

    fn deploy(name: &str, created: i64, state: DeployState) -> Deploy {
        let mut deploy = Deploy::new(name, DeploySpec::default());
        deploy.metadata.creation_timestamp = Some(Time(at(created)));
        deploy.status = Some(DeployStatus {
            state,
            ..Default::default()
        });

        deploy
    }

    fn teardown(name: &str, created: i64, state: TeardownState) -> Teardown {
        let mut teardown = Teardown::new(name, TeardownSpec {});
        teardown.metadata.creation_timestamp = Some(Time(at(created)));
        teardown.status = Some(TeardownStatus {
            state,
            ..Default::default()
        });

        teardown
    }

    fn selected_name(request: Option<LifecycleRequest<'_>>) -> Option<String> {
        request.map(|request| request.sort_key().1)
    }

    #[test]
    fn oldest_pending_request_is_picked_in_fifo_order() {
        let deploys = vec![
            deploy("second", 20, DeployState::Pending),
            deploy("done", 5, DeployState::Succeeded),
        ];
        let teardowns = vec![teardown("first", 10, TeardownState::Pending)];
        let requests = deploys
            .iter()
            .map(LifecycleRequest::Deploy)
            .chain(teardowns.iter().map(LifecycleRequest::Teardown))
            .collect::<Vec<_>>();

        assert_eq!(selected_name(select_request(&requests)).as_deref(), Some("first"));
    }

    #[test]
    fn active_request_holds_the_system() {
        let deploys = vec![
            deploy("older", 10, DeployState::Pending),
            deploy("running", 20, DeployState::InProgress),
        ];
        let requests = deploys.iter().map(LifecycleRequest::Deploy).collect::<Vec<_>>();

        assert_eq!(selected_name(select_request(&requests)).as_deref(), Some("running"));
        assert!(select_request(&[]).is_none());
    }

    #[test]
    fn deploy_succeeds_once_the_system_is_stable() {
        let current = DeployStatus {
            state: DeployState::InProgress,
            ..Default::default()
        };

        let waiting = step_deploy_rollout(&current, None, at(100), Duration::from_secs(60));
        let updating =
            step_deploy_rollout(&current, Some(SystemState::Updating), at(100), Duration::from_secs(60));
        let stable =
            step_deploy_rollout(&current, Some(SystemState::Stable), at(100), Duration::from_secs(60));

        assert_eq!(waiting, current);
        assert_eq!(updating.state, DeployState::InProgress);
        assert_eq!(stable.state, DeployState::Succeeded);
        assert_eq!(stable.completion_timestamp, Some(at(100)));
    }

    #[test]
    fn deploy_fails_when_degraded_past_the_timeout() {
        let current = DeployStatus {
            state: DeployState::InProgress,
            ..Default::default()
        };
        let timeout = Duration::from_secs(60);

        let degraded = step_deploy_rollout(&current, Some(SystemState::Degraded), at(100), timeout);
        assert_eq!(degraded.state, DeployState::InProgress);
        assert_eq!(degraded.degraded_since, Some(at(100)));

        let still = step_deploy_rollout(&degraded, Some(SystemState::Degraded), at(130), timeout);
        assert_eq!(still.state, DeployState::InProgress);

        let recovered = step_deploy_rollout(&still, Some(SystemState::Updating), at(140), timeout);
        assert_eq!(recovered.degraded_since, None);

        let failed = step_deploy_rollout(&degraded, Some(SystemState::Degraded), at(160), timeout);
        assert_eq!(failed.state, DeployState::Failed);
        assert_eq!(failed.completion_timestamp, Some(at(160)));
    }

    #[test]
    fn deploys_of_unknown_versions_are_rejected() {
        let url = "https://git.local/shop.git";
        let versions = || Ok(vec!["v1".to_owned(), "v2".to_owned()]);

        assert_eq!(get_version_rejection(versions(), url, "v2").unwrap(), None);
        assert_eq!(
            get_version_rejection(versions(), url, "v3").unwrap().as_deref(),
            Some("Version 'v3' doesn't exist in 'https://git.local/shop.git'!")
        );
        assert!(get_version_rejection(Err(ResolveError::UnknownRepository(url.to_owned())), url, "v1")
            .unwrap()
            .is_some());

        let unreadable = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        assert!(get_version_rejection(Err(unreadable.into()), url, "v1").is_err());
    }

    #[test]
    fn deployed_spec_carries_the_build_artifacts() {
        let path = TreePath::new("/shop/api").unwrap();
        let job_path = TreePath::new("/shop/migrate").unwrap();
        let artifacts = ContainerBuildArtifacts::from_fqn("registry.local/abc:1", None).unwrap();
        let build = BuildStatus {
            state: BuildState::Succeeded,
            version: Some("v2".to_owned()),
            definition: Some(ResolvedDefinition {
                services: BTreeMap::from([(path.clone(), ServiceDefinition::default())]),
                jobs: BTreeMap::from([(job_path.clone(), JobDefinition::default())]),
                ..Default::default()
            }),
            workloads: BTreeMap::from([
                (
                    path.clone(),
                    BuildWorkload {
                        containers: BTreeMap::from([("main".to_owned(), "abc-0".to_owned())]),
                    },
                ),
                (
                    job_path.clone(),
                    BuildWorkload {
                        containers: BTreeMap::from([("main".to_owned(), "abc-0".to_owned())]),
                    },
                ),
            ]),
            container_builds: BTreeMap::from([(
                "abc-0".to_owned(),
                BuildContainerBuildStatus {
                    state: ContainerBuildState::Succeeded,
                    artifacts: Some(artifacts.clone()),
                    ..Default::default()
                },
            )]),
            ..Default::default()
        };
        let current = SystemSpec {
            definition_url: "https://git.local/shop.git".to_owned(),
            ..Default::default()
        };

        let spec = get_deployed_spec(&current, &build).unwrap();

        assert_eq!(spec.version.as_deref(), Some("v2"));
        assert_eq!(spec.definition_url, "https://git.local/shop.git");
        assert_eq!(spec.services[&path].artifacts["main"], artifacts);
        assert_eq!(spec.jobs[&job_path].artifacts["main"], artifacts);

        let unbuilt = BuildStatus {
            container_builds: BTreeMap::new(),
            ..build
        };
        assert!(get_deployed_spec(&current, &unbuilt).is_err());
    }
}
