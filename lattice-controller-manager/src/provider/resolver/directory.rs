use std::{io::ErrorKind, path::PathBuf};

use async_trait::async_trait;
use lattice_core::definition::{
    component::ComponentDefinition, tree::ResolvedDefinition, DefinitionError,
};
use log::debug;

use super::{ComponentResolver, ResolveError, ResolveTarget};

pub const SYSTEM_DEFINITION_FILE: &str = "system.json";

/// Resolves definitions pre-fetched into
/// `<root>/<repository key>/<version>/system.json`.
pub struct DirectoryResolver {
    root: PathBuf,
}

impl DirectoryResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn repository_directory(&self, definition_url: &str) -> PathBuf {
        self.root.join(get_repository_key(definition_url))
    }

    async fn load_system(
        &self,
        definition_url: &str,
        version: &str,
    ) -> Result<ComponentDefinition, ResolveError> {
        if version.is_empty() || version.contains(['/', '\\']) || version.starts_with('.') {
            return Err(ResolveError::InvalidTarget(
                format!("'{version}' is not a valid version").into(),
            ));
        }

        let repository = self.repository_directory(definition_url);
        if !tokio::fs::try_exists(&repository).await? {
            return Err(ResolveError::UnknownRepository(definition_url.to_owned()));
        }

        let file = repository.join(version).join(SYSTEM_DEFINITION_FILE);
        debug!("Loading definition from {}...", file.display());

        let raw = match tokio::fs::read(&file).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ResolveError::UnknownVersion(
                    definition_url.to_owned(),
                    version.to_owned(),
                ))
            }
            Err(error) => return Err(error.into()),
        };

        Ok(serde_json::from_slice(&raw)?)
    }
}

#[async_trait]
impl ComponentResolver for DirectoryResolver {
    async fn resolve(
        &self,
        definition_url: &str,
        target: &ResolveTarget,
    ) -> Result<ResolvedDefinition, ResolveError> {
        let system = match self.load_system(definition_url, target.version()).await? {
            ComponentDefinition::System(system) => system,
            _ => return Err(DefinitionError::NotASystem(definition_url.to_owned()).into()),
        };

        let resolved = match target {
            ResolveTarget::Version(_) => ResolvedDefinition::from_system(&system)?,
            ResolveTarget::Path { path, .. } => ResolvedDefinition::from_subtree(&system, path)?,
        };

        Ok(resolved)
    }

    async fn list_versions(&self, definition_url: &str) -> Result<Vec<String>, ResolveError> {
        let repository = self.repository_directory(definition_url);
        let mut entries = match tokio::fs::read_dir(&repository).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(ResolveError::UnknownRepository(definition_url.to_owned()))
            }
            Err(error) => return Err(error.into()),
        };

        let mut versions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        versions.sort();

        Ok(versions)
    }
}

/// `git://example.com/demo.git` becomes `git___example_com_demo_git`.
pub fn get_repository_key(definition_url: &str) -> String {
    definition_url
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use lattice_core::definition::path::TreePath;

    use super::*;

    const URL: &str = "git://example.com/demo.git";

    const SYSTEM: &str = r#"{
        "type": "v1/system",
        "components": {
            "api": {
                "type": "v1/service",
                "container": {
                    "build": { "dockerImage": { "repository": "nginx", "tag": "1.25" } },
                    "ports": { "http": { "port": 80, "protocol": "HTTP" } }
                }
            },
            "workers": {
                "type": "v1/system",
                "components": {
                    "mailer": {
                        "type": "v1/service",
                        "container": {
                            "build": { "dockerImage": { "repository": "mailer", "tag": "2" } }
                        }
                    }
                }
            }
        }
    }"#;

    async fn repository(test: &str) -> PathBuf {
        let root = std::env::temp_dir()
            .join("lattice-directory-resolver")
            .join(test);
        let _ = tokio::fs::remove_dir_all(&root).await;

        for version in ["v1.0.0", "v1.1.0"] {
            let directory = root.join(get_repository_key(URL)).join(version);
            tokio::fs::create_dir_all(&directory).await.unwrap();
            tokio::fs::write(directory.join(SYSTEM_DEFINITION_FILE), SYSTEM)
                .await
                .unwrap();
        }

        root
    }

    fn path(path: &str) -> TreePath {
        TreePath::new(path).unwrap()
    }

    #[test]
    fn repository_key_replaces_non_alphanumerics() {
        assert_eq!(get_repository_key(URL), "git___example_com_demo_git");
    }

    #[tokio::test]
    async fn version_resolves_to_the_whole_tree() {
        let resolver = DirectoryResolver::new(repository("whole-tree").await);
        let resolved = resolver
            .resolve(URL, &ResolveTarget::Version("v1.0.0".to_owned()))
            .await
            .unwrap();

        assert_eq!(
            resolved.services.keys().cloned().collect::<Vec<_>>(),
            vec![path("/api"), path("/workers/mailer")]
        );
    }

    #[tokio::test]
    async fn path_resolves_to_a_subtree() {
        let resolver = DirectoryResolver::new(repository("subtree").await);
        let resolved = resolver
            .resolve(
                URL,
                &ResolveTarget::Path {
                    version: "v1.0.0".to_owned(),
                    path: path("/workers"),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            resolved.services.keys().cloned().collect::<Vec<_>>(),
            vec![path("/workers/mailer")]
        );
    }

    #[tokio::test]
    async fn unknown_version_and_repository_are_terminal() {
        let resolver = DirectoryResolver::new(repository("unknown").await);

        let version = resolver
            .resolve(URL, &ResolveTarget::Version("v9".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(version, ResolveError::UnknownVersion(_, _)));
        assert!(version.is_terminal());

        let repository = resolver
            .resolve("git://example.com/other.git", &ResolveTarget::Version("v1.0.0".to_owned()))
            .await
            .unwrap_err();
        assert!(matches!(repository, ResolveError::UnknownRepository(_)));
    }

    #[tokio::test]
    async fn versions_cannot_escape_the_repository() {
        let resolver = DirectoryResolver::new(Path::new("/nonexistent"));
        let result = resolver
            .resolve(URL, &ResolveTarget::Version("../../etc".to_owned()))
            .await;

        assert!(matches!(result, Err(ResolveError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn versions_are_listed_sorted() {
        let resolver = DirectoryResolver::new(repository("versions").await);

        assert_eq!(
            resolver.list_versions(URL).await.unwrap(),
            vec!["v1.0.0".to_owned(), "v1.1.0".to_owned()]
        );
    }
}
