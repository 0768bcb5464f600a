use std::{
    any::type_name,
    time::{Duration, SystemTime},
};

use kube::Resource;

pub fn get_secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(2137420))
        .as_secs()
}

pub fn pretty_type_name<'a, T>() -> &'a str {
    let name = type_name::<T>();

    name.rsplit("::").next().unwrap_or(name)
}

pub trait RequireMetadata<E> {
    fn require_name_or(&self, error: E) -> Result<&str, E>;
    fn require_namespace_or(&self, error: E) -> Result<&str, E>;
    fn require_uid_or(&self, error: E) -> Result<&str, E>;
}

impl<T: Resource, E> RequireMetadata<E> for T {
    fn require_name_or(&self, error: E) -> Result<&str, E> {
        Ok(self.meta().name.as_ref().ok_or(error)?.as_str())
    }

    fn require_namespace_or(&self, error: E) -> Result<&str, E> {
        Ok(self.meta().namespace.as_ref().ok_or(error)?.as_str())
    }

    fn require_uid_or(&self, error: E) -> Result<&str, E> {
        Ok(self.meta().uid.as_ref().ok_or(error)?.as_str())
    }
}

/// `true` once the object has been marked for deletion
pub trait Deleted {
    fn is_deleted(&self) -> bool;
}

impl<T: Resource> Deleted for T {
    fn is_deleted(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SomeTypeName;

    #[test]
    fn pretty_type_name_strips_module_path() {
        assert_eq!(pretty_type_name::<SomeTypeName>(), "SomeTypeName");
        assert_eq!(pretty_type_name::<u32>(), "u32");
    }

    #[test]
    fn deleted_objects_have_a_deletion_timestamp() {
        use chrono::Utc;
        use k8s_openapi::{api::core::v1::ConfigMap, apimachinery::pkg::apis::meta::v1::Time};

        let mut config_map = ConfigMap::default();
        config_map.metadata.name = Some("lattice".to_owned());

        assert!(!config_map.is_deleted());
        assert_eq!(config_map.require_name_or("missing"), Ok("lattice"));
        assert_eq!(config_map.require_namespace_or("missing"), Err("missing"));

        config_map.metadata.deletion_timestamp = Some(Time(Utc::now()));

        assert!(config_map.is_deleted());
    }
}
