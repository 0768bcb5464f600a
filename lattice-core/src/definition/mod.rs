use std::borrow::Cow;

use thiserror::Error;

use self::path::PathError;

pub mod component;
pub mod hash;
pub mod path;
pub mod tree;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("Definition is invalid: {}!", .0)]
    Invalid(Cow<'static, str>),
    #[error("Definition contains an invalid path! {}", .0)]
    InvalidPath(PathError),
    #[error("Component '{}' doesn't exist in the definition!", .0)]
    MissingComponent(String),
    #[error("Component '{}' is not a system!", .0)]
    NotASystem(String),
    #[error("'{}' references node pool '{}' that isn't declared!", .0, .1)]
    UnknownNodePool(String, String),
    #[error("Couldn't serialize the definition! {}", .0)]
    Serialization(serde_json::Error),
}

impl From<PathError> for DefinitionError {
    fn from(value: PathError) -> Self {
        DefinitionError::InvalidPath(value)
    }
}
