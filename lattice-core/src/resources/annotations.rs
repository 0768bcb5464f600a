use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Serialize};

pub const BUILD_DEFINITION_HASH_ANNOTATION: &str = "build-definition-hash";
pub const ARTIFACT_FQN_ANNOTATION: &str = "artifact-fqn";
pub const ARTIFACT_DIGEST_ANNOTATION: &str = "artifact-digest";

pub const SERVICE_MESH_ADMIN_PORT_ANNOTATION: &str = "service-mesh/admin-port";
pub const SERVICE_MESH_EGRESS_PORT_ANNOTATION: &str = "service-mesh/egress-port";
pub const SERVICE_MESH_PORTS_ANNOTATION: &str = "service-mesh/ports";
/// `dedicated` when the address holds its own leased IP, `shared` otherwise
pub const SERVICE_MESH_IP_LEASE_ANNOTATION: &str = "service-mesh/ip-lease";

pub const SERVICE_NODE_POOLS_ANNOTATION: &str = "service.lattice.dev/node-pools";
pub const RESOLVED_TREE_HASH_ANNOTATION: &str = "build.lattice.dev/resolved-tree-hash";
pub const CONTAINER_BUILD_PHASE_ANNOTATION: &str = "containerbuild.lattice.dev/phase";

/// Node pool name to the epochs a service's pods may still be scheduled on.
pub type ServiceNodePoolEpochs = BTreeMap<String, Vec<u64>>;

pub fn get_annotation<'a>(
    annotations: Option<&'a BTreeMap<String, String>>,
    key: &str,
) -> Option<&'a str> {
    annotations?.get(key).map(String::as_str)
}

pub fn get_json_annotation<T: DeserializeOwned>(
    annotations: Option<&BTreeMap<String, String>>,
    key: &str,
) -> Option<Result<T, serde_json::Error>> {
    get_annotation(annotations, key).map(serde_json::from_str)
}

pub fn to_json_annotation<T: Serialize>(
    key: &str,
    value: &T,
) -> Result<(String, String), serde_json::Error> {
    Ok((key.to_owned(), serde_json::to_string(value)?))
}

pub fn get_build_definition_hash_annotations(hash: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        BUILD_DEFINITION_HASH_ANNOTATION.to_owned(),
        hash.to_owned(),
    )])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_annotations_are_read_back() {
        let epochs = ServiceNodePoolEpochs::from([("pool.shop".to_owned(), vec![1, 2])]);
        let (key, value) = to_json_annotation(SERVICE_NODE_POOLS_ANNOTATION, &epochs).unwrap();
        let annotations = BTreeMap::from([(key, value)]);

        let parsed: ServiceNodePoolEpochs =
            get_json_annotation(Some(&annotations), SERVICE_NODE_POOLS_ANNOTATION)
                .unwrap()
                .unwrap();

        assert_eq!(parsed, epochs);
    }

    #[test]
    fn missing_annotations_yield_none() {
        assert_eq!(get_annotation(None, ARTIFACT_FQN_ANNOTATION), None);
        assert!(get_json_annotation::<ServiceNodePoolEpochs>(
            Some(&BTreeMap::new()),
            SERVICE_NODE_POOLS_ANNOTATION
        )
        .is_none());
    }
}
