use std::{fmt::Display, str::FromStr};

use schemars::{gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PATH_SEPARATOR: char = '/';
pub const NODE_POOL_SEPARATOR: char = ':';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Path cannot be empty!")]
    Empty,
    #[error("Path '{}' must start with '/'!", .0)]
    MissingLeadingSeparator(String),
    #[error("Path '{}' contains an empty subpath!", .0)]
    EmptySubpath(String),
    #[error("Path '{}' has no parent!", .0)]
    NoParent(String),
    #[error("Node pool path '{}' must have the '/path:name' form!", .0)]
    InvalidNodePoolPath(String),
}

/// Location of a node in the system definition tree, e.g. `/a/b/c`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TreePath(String);

impl TreePath {
    pub fn new(path: &str) -> Result<Self, PathError> {
        if path.is_empty() {
            return Err(PathError::Empty);
        }

        if !path.starts_with(PATH_SEPARATOR) {
            return Err(PathError::MissingLeadingSeparator(path.to_owned()));
        }

        if path.len() > 1 && path[1..].split(PATH_SEPARATOR).any(str::is_empty) {
            return Err(PathError::EmptySubpath(path.to_owned()));
        }

        Ok(Self(path.to_owned()))
    }

    pub fn root() -> Self {
        Self(PATH_SEPARATOR.to_string())
    }

    /// Inverse of [`TreePath::to_domain`], `c.b.a` becomes `/a/b/c`.
    pub fn from_domain(domain: &str) -> Result<Self, PathError> {
        let path = domain
            .split('.')
            .rev()
            .fold(String::new(), |mut path, subpath| {
                path.push(PATH_SEPARATOR);
                path.push_str(subpath);
                path
            });

        Self::new(&path)
    }

    pub fn child(&self, child: &str) -> Self {
        if self.is_root() {
            return Self(format!("{PATH_SEPARATOR}{child}"));
        }

        Self(format!("{}{PATH_SEPARATOR}{child}", self.0))
    }

    pub fn parent(&self) -> Result<Self, PathError> {
        if self.is_root() {
            return Err(PathError::NoParent(self.0.to_owned()));
        }

        match self.0.rfind(PATH_SEPARATOR) {
            Some(0) | None => Ok(Self::root()),
            Some(index) => Ok(Self(self.0[..index].to_owned())),
        }
    }

    pub fn subpaths(&self) -> Vec<&str> {
        if self.is_root() {
            return Vec::new();
        }

        self.0[1..].split(PATH_SEPARATOR).collect()
    }

    pub fn depth(&self) -> usize {
        self.subpaths().len()
    }

    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    pub fn is_prefix_of(&self, other: &TreePath) -> bool {
        if self.is_root() {
            return true;
        }

        other.0 == self.0 || other.0.starts_with(&format!("{}{PATH_SEPARATOR}", self.0))
    }

    /// Domain form of the path, `/a/b/c` becomes `c.b.a`.
    pub fn to_domain(&self) -> String {
        self.subpaths()
            .into_iter()
            .rev()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TreePath {
    fn default() -> Self {
        Self::root()
    }
}

impl Display for TreePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TreePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TreePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<TreePath> for String {
    fn from(value: TreePath) -> Self {
        value.0
    }
}

impl JsonSchema for TreePath {
    fn schema_name() -> String {
        "TreePath".to_owned()
    }

    fn is_referenceable() -> bool {
        false
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

/// Reference to a node pool declared by a system, e.g. `/a/b:pool`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePoolPath {
    pub path: TreePath,
    pub name: String,
}

impl NodePoolPath {
    pub fn new(path: TreePath, name: &str) -> Self {
        Self {
            path,
            name: name.to_owned(),
        }
    }

    /// Domain form used for resource names, `/a/b:pool` becomes `pool.b.a`.
    pub fn to_domain(&self) -> String {
        match self.path.is_root() {
            true => self.name.to_lowercase(),
            false => format!("{}.{}", self.name.to_lowercase(), self.path.to_domain()),
        }
    }
}

impl FromStr for NodePoolPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, name) = s
            .split_once(NODE_POOL_SEPARATOR)
            .ok_or_else(|| PathError::InvalidNodePoolPath(s.to_owned()))?;

        if name.is_empty() {
            return Err(PathError::InvalidNodePoolPath(s.to_owned()));
        }

        Ok(Self::new(TreePath::new(path)?, name))
    }
}

impl Display for NodePoolPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{NODE_POOL_SEPARATOR}{}", self.path, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_malformed_paths() {
        assert_eq!(TreePath::new(""), Err(PathError::Empty));
        assert_eq!(
            TreePath::new("a/b"),
            Err(PathError::MissingLeadingSeparator("a/b".to_owned()))
        );
        assert_eq!(
            TreePath::new("/a//b"),
            Err(PathError::EmptySubpath("/a//b".to_owned()))
        );
        assert_eq!(
            TreePath::new("/a/"),
            Err(PathError::EmptySubpath("/a/".to_owned()))
        );
        assert!(TreePath::new("/").is_ok());
    }

    #[test]
    fn domain_reverses_and_lowercases_subpaths() {
        let path = TreePath::new("/Frontend/api/v2").unwrap();

        assert_eq!(path.to_domain(), "v2.api.frontend");
        assert_eq!(
            TreePath::from_domain("b.a").unwrap(),
            TreePath::new("/a/b").unwrap()
        );
    }

    #[test]
    fn navigation_follows_the_tree() {
        let root = TreePath::root();
        let a = root.child("a");
        let ab = a.child("b");

        assert_eq!(ab.as_str(), "/a/b");
        assert_eq!(ab.depth(), 2);
        assert_eq!(ab.parent().unwrap(), a);
        assert_eq!(a.parent().unwrap(), root);
        assert_eq!(root.depth(), 0);
        assert_eq!(TreePath::default(), root);
        assert!(root.parent().is_err());
        assert!(a.is_prefix_of(&ab));
        assert!(!ab.is_prefix_of(&a));
        assert!(!a.is_prefix_of(&TreePath::new("/ab").unwrap()));
    }

    #[test]
    fn serializes_as_plain_string() {
        let path = TreePath::new("/a/b").unwrap();

        assert_eq!(serde_json::to_string(&path).unwrap(), "\"/a/b\"");
        assert!(serde_json::from_str::<TreePath>("\"a\"").is_err());
    }

    #[test]
    fn node_pool_path_parses_and_encodes() {
        let pool: NodePoolPath = "/a/b:workers".parse().unwrap();

        assert_eq!(pool.path.as_str(), "/a/b");
        assert_eq!(pool.name, "workers");
        assert_eq!(pool.to_domain(), "workers.b.a");
        assert_eq!(pool.to_string(), "/a/b:workers");
        assert!("/a/b".parse::<NodePoolPath>().is_err());
        assert!("/a/b:".parse::<NodePoolPath>().is_err());
    }
}
