use std::fmt::Debug;

use anyhow::{anyhow, Context};
use k8s_openapi::{
    apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
    apimachinery::pkg::apis::meta::v1::OwnerReference,
    serde::{de::DeserializeOwned, Serialize},
    NamespaceResourceScope,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::object::HasStatus,
    Api, Client, Resource, ResourceExt,
};
use log::{debug, info};
use serde_json::json;

use crate::helpers::pretty_type_name;

use super::{is_conflict, is_not_found, FromStatus, GetApi};

pub async fn apply_crd(
    client: &Client,
    crd: &CustomResourceDefinition,
    patch_params: &PatchParams,
) -> anyhow::Result<()> {
    let crd_name = crd
        .metadata
        .name
        .as_ref()
        .ok_or_else(|| anyhow!("CRD is missing a name!"))?;
    let crd_apiversions = crd
        .spec
        .versions
        .iter()
        .map(|version| version.name.as_str())
        .collect::<Vec<&str>>()
        .join(", ");

    info!("Applying {crd_name} ({crd_apiversions}) CRD...");

    let crd_api: Api<CustomResourceDefinition> = client.global_api();
    crd_api
        .patch(crd_name, patch_params, &Patch::Apply(crd))
        .await
        .context(format!("Unable to apply {crd_name} ({crd_apiversions}) CRD!"))?;

    Ok(())
}

pub async fn apply_resource<T>(
    client: &Client,
    resource: &T,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();

    debug!(
        "Applying '{name}' {} in '{namespace}' namespace...",
        pretty_type_name::<T>()
    );

    client
        .namespaced_api::<T>(&namespace)
        .patch(&name, patch_params, &Patch::Apply(resource))
        .await
}

pub async fn apply_resource_status<T, S>(
    client: &Client,
    status: S,
    name: &str,
    namespace: &str,
    patch_params: &PatchParams,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + HasStatus<Status = S>
        + FromStatus<S>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let mut object = T::from_status(status);

    object.meta_mut().name = Some(name.to_owned());
    object.meta_mut().namespace = Some(namespace.to_owned());

    client
        .namespaced_api::<T>(namespace)
        .patch_status(name, patch_params, &Patch::Apply(&object))
        .await
}

/// Creates the resource, or returns the existing one if somebody else created it first.
pub async fn create_or_get_resource<T>(client: &Client, resource: &T) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Serialize
        + Clone
        + DeserializeOwned
        + Debug,
{
    let name = resource.name_any();
    let namespace = resource.namespace().unwrap_or_default();
    let api = client.namespaced_api::<T>(&namespace);

    match api.create(&PostParams::default(), resource).await {
        Ok(created) => {
            info!(
                "Created '{name}' {} in '{namespace}' namespace!",
                pretty_type_name::<T>()
            );

            Ok(created)
        }
        Err(error) if is_conflict(&error) => {
            debug!(
                "'{name}' {} already exists, fetching it instead...",
                pretty_type_name::<T>()
            );

            api.get(&name).await
        }
        Err(error) => Err(error),
    }
}

pub async fn try_get_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
) -> Result<Option<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    client.namespaced_api::<T>(namespace).get_opt(name).await
}

pub async fn list_resources<T>(
    client: &Client,
    namespace: &str,
    list_params: &ListParams,
) -> Result<Vec<T>, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    Ok(client
        .namespaced_api::<T>(namespace)
        .list(list_params)
        .await?
        .items)
}

/// Deletes the resource, an already missing resource is not an error.
pub async fn try_remove_resource<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    delete_params: &DeleteParams,
) -> Result<(), kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    match client
        .namespaced_api::<T>(namespace)
        .delete(name, delete_params)
        .await
    {
        Ok(_) => {
            info!(
                "Removing '{name}' {} from '{namespace}' namespace...",
                pretty_type_name::<T>()
            );

            Ok(())
        }
        Err(error) if is_not_found(&error) => Ok(()),
        Err(error) => Err(error),
    }
}

/// Adds a non-controller owner reference, guarded by the object's resource version.
pub async fn add_owner_reference<T>(
    client: &Client,
    resource: &T,
    owner_reference: OwnerReference,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let mut owner_references = resource.owner_references().to_vec();

    if owner_references
        .iter()
        .any(|reference| reference.uid == owner_reference.uid)
    {
        return Ok(resource.clone());
    }

    owner_references.push(owner_reference);

    let patch = json!({
        "metadata": {
            "ownerReferences": owner_references,
            "resourceVersion": resource.resource_version(),
        }
    });

    client
        .namespaced_api::<T>(&resource.namespace().unwrap_or_default())
        .patch(
            &resource.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
}

pub async fn merge_annotations<T>(
    client: &Client,
    resource: &T,
    annotations: &std::collections::BTreeMap<String, String>,
) -> Result<T, kube::Error>
where
    T: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Debug,
{
    let patch = json!({
        "metadata": {
            "annotations": annotations,
        }
    });

    client
        .namespaced_api::<T>(&resource.namespace().unwrap_or_default())
        .patch(
            &resource.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await
}

/// Owner reference that doesn't make `owner` the controller of the object
/// and doesn't block its deletion.
pub fn shared_owner_reference<T: Resource<DynamicType = ()>>(owner: &T) -> Option<OwnerReference> {
    let mut reference = owner.controller_owner_ref(&())?;

    reference.controller = Some(false);
    reference.block_owner_deletion = Some(false);

    Some(reference)
}
