use std::borrow::Cow;

use async_trait::async_trait;
use lattice_core::definition::{path::TreePath, tree::ResolvedDefinition, DefinitionError};
use thiserror::Error;

pub mod directory;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Definition repository '{}' is unknown!", .0)]
    UnknownRepository(String),
    #[error("Version '{}' doesn't exist in '{}'!", .1, .0)]
    UnknownVersion(String, String),
    #[error("Couldn't read the definition! {}", .0)]
    Io(#[from] std::io::Error),
    #[error("Couldn't parse the definition! {}", .0)]
    Parse(#[from] serde_json::Error),
    #[error("{}", .0)]
    Definition(#[from] DefinitionError),
    #[error("Resolve target is invalid: {}!", .0)]
    InvalidTarget(Cow<'static, str>),
}

impl ResolveError {
    /// Retrying won't change the outcome unless the repository changes.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolveError::Io(_))
    }
}

/// What part of a definition repository to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveTarget {
    Version(String),
    Path { version: String, path: TreePath },
}

impl ResolveTarget {
    pub fn version(&self) -> &str {
        match self {
            ResolveTarget::Version(version) => version,
            ResolveTarget::Path { version, .. } => version,
        }
    }
}

#[async_trait]
pub trait ComponentResolver: Send + Sync {
    async fn resolve(
        &self,
        definition_url: &str,
        target: &ResolveTarget,
    ) -> Result<ResolvedDefinition, ResolveError>;

    /// Versions available in the repository, sorted.
    async fn list_versions(&self, definition_url: &str) -> Result<Vec<String>, ResolveError>;
}
