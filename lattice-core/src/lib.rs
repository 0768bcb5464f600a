pub mod definition;
pub mod helpers;
pub mod ip;
pub mod kubernetes;
pub mod resources;

pub const RESOURCE_GROUP: &str = "lattice.dev";
pub const RESOURCE_VERSION: &str = "v1";

pub const FIELD_MANAGER: &str = "lattice-controller-manager";

pub const DEFAULT_INTERNAL_NAMESPACE: &str = "lattice-internal";
pub const DEFAULT_NAMESPACE_PREFIX: &str = "lattice";
pub const DEFAULT_CONFIG_NAME: &str = "config";
