use std::borrow::Cow;

use thiserror::Error;

pub mod annotations;
pub mod crd;
pub mod labels;
pub mod meta;
pub mod workload;

#[derive(Debug, Error)]
pub enum ResourceGenerationError {
    #[error("Resource contains invalid data ({})!", .0)]
    InvalidData(Cow<'static, str>),
    #[error("Resource is missing required data ({})!", .0)]
    MissingData(Cow<'static, str>),
    #[error("Provided dependent resource is missing a name!")]
    DependentMissingMetadataName,
    #[error("Provided dependent resource is missing a namespace!")]
    DependentMissingMetadataNamespace,
    #[error("Artifacts of '{}' container are missing!", .0)]
    MissingArtifacts(String),
    #[error("Couldn't serialize an annotation! {}", .0)]
    Serialization(#[from] serde_json::Error),
}
