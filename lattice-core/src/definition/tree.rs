use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{
    component::{
        ComponentDefinition, ContainerBuildDefinition, JobDefinition, NodePoolDefinition,
        ServiceDefinition, SystemDefinition,
    },
    path::{NodePoolPath, TreePath},
    DefinitionError,
};

/// Flattened view of a system definition, keyed by the paths of its workloads.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDefinition {
    #[serde(default)]
    pub services: BTreeMap<TreePath, ServiceDefinition>,
    #[serde(default)]
    pub jobs: BTreeMap<TreePath, JobDefinition>,
    /// shared node pools keyed by their `/path:name`
    #[serde(default)]
    pub node_pools: BTreeMap<String, NodePoolDefinition>,
}

/// A single container image that has to be built for a workload.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadContainerBuild<'a> {
    pub path: &'a TreePath,
    pub container: &'a str,
    pub definition: &'a ContainerBuildDefinition,
}

impl ResolvedDefinition {
    pub fn from_system(system: &SystemDefinition) -> Result<Self, DefinitionError> {
        let mut resolved = Self::default();

        flatten_into(system, &TreePath::root(), &mut resolved)?;
        resolved.validate_node_pool_references()?;

        Ok(resolved)
    }

    /// Resolves the whole tree, then keeps only what lives under `path`.
    pub fn from_subtree(system: &SystemDefinition, path: &TreePath) -> Result<Self, DefinitionError> {
        let resolved = Self::from_system(system)?;

        if path.is_root() {
            return Ok(resolved);
        }

        let services: BTreeMap<_, _> = resolved
            .services
            .into_iter()
            .filter(|(service_path, _)| path.is_prefix_of(service_path))
            .collect();
        let jobs: BTreeMap<_, _> = resolved
            .jobs
            .into_iter()
            .filter(|(job_path, _)| path.is_prefix_of(job_path))
            .collect();

        if services.is_empty() && jobs.is_empty() {
            return Err(DefinitionError::MissingComponent(path.to_string()));
        }

        let referenced_pools = services
            .values()
            .filter_map(|service| service.shared_node_pool.as_ref())
            .chain(jobs.values().filter_map(|job| job.shared_node_pool.as_ref()))
            .collect::<Vec<_>>();
        let node_pools = resolved
            .node_pools
            .into_iter()
            .filter(|(pool, _)| referenced_pools.contains(&pool))
            .collect();

        Ok(Self {
            services,
            jobs,
            node_pools,
        })
    }

    pub fn container_builds(&self) -> Vec<WorkloadContainerBuild<'_>> {
        let services = self.services.iter().flat_map(|(path, service)| {
            service
                .containers()
                .map(move |(container, definition)| WorkloadContainerBuild {
                    path,
                    container,
                    definition: &definition.build,
                })
        });
        let jobs = self.jobs.iter().flat_map(|(path, job)| {
            job.containers()
                .map(move |(container, definition)| WorkloadContainerBuild {
                    path,
                    container,
                    definition: &definition.build,
                })
        });

        services.chain(jobs).collect()
    }

    fn validate_node_pool_references(&self) -> Result<(), DefinitionError> {
        let references = self
            .services
            .iter()
            .filter_map(|(path, service)| Some((path, service.shared_node_pool.as_ref()?)))
            .chain(
                self.jobs
                    .iter()
                    .filter_map(|(path, job)| Some((path, job.shared_node_pool.as_ref()?))),
            );

        for (path, reference) in references {
            reference.parse::<NodePoolPath>()?;

            if !self.node_pools.contains_key(reference) {
                return Err(DefinitionError::UnknownNodePool(
                    path.to_string(),
                    reference.to_owned(),
                ));
            }
        }

        Ok(())
    }
}

fn flatten_into(
    system: &SystemDefinition,
    path: &TreePath,
    resolved: &mut ResolvedDefinition,
) -> Result<(), DefinitionError> {
    for (name, node_pool) in &system.node_pools {
        node_pool.validate()?;
        resolved.node_pools.insert(
            NodePoolPath::new(path.to_owned(), name).to_string(),
            node_pool.to_owned(),
        );
    }

    for (name, component) in &system.components {
        let child = TreePath::new(path.child(name).as_str())?;

        match component {
            ComponentDefinition::System(subsystem) => flatten_into(subsystem, &child, resolved)?,
            ComponentDefinition::Service(service) => {
                service.validate()?;
                resolved.services.insert(child, service.to_owned());
            }
            ComponentDefinition::Job(job) => {
                job.validate()?;
                resolved.jobs.insert(child, job.to_owned());
            }
        }
    }

    Ok(())
}
