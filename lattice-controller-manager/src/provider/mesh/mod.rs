use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use async_trait::async_trait;
use k8s_openapi::api::{apps::v1::DeploymentSpec, core::v1::PodTemplateSpec};
use lattice_core::resources::{
    annotations::{
        get_annotation, get_json_annotation, SERVICE_MESH_ADMIN_PORT_ANNOTATION,
        SERVICE_MESH_EGRESS_PORT_ANNOTATION, SERVICE_MESH_PORTS_ANNOTATION,
    },
    crd::v1::{address::Address, service::ServicePort},
};

use super::{ProviderError, SpecComparison};

pub mod envoy;

/// First port handed out to the mesh, user ports are skipped.
pub const MESH_PORT_BASE: i32 = 10000;

/// Address a workload is reachable at inside of the system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIp {
    pub ip: Ipv4Addr,
    /// recorded on the address
    pub annotations: BTreeMap<String, String>,
}

#[async_trait]
pub trait ServiceMesh: Send + Sync {
    /// Mesh annotations for a workload exposing `ports`. Assignments found in
    /// `existing` are kept as long as they don't collide.
    fn workload_annotations(
        &self,
        ports: &BTreeSet<i32>,
        existing: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<String, String>, ProviderError>;

    /// User port to mesh port, read back from the workload annotations.
    fn service_mesh_ports(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> Result<BTreeMap<i32, i32>, ProviderError>;

    /// Port other workloads reach `port` of this workload at.
    fn workload_port(
        &self,
        annotations: Option<&BTreeMap<String, String>>,
        port: i32,
    ) -> Result<i32, ProviderError>;

    async fn transform_pod_template(
        &self,
        template: PodTemplateSpec,
        annotations: &BTreeMap<String, String>,
    ) -> Result<PodTemplateSpec, ProviderError>;

    /// Mesh view of the comparison, see [`super::cloud::CloudProvider::is_deployment_spec_updated`].
    fn is_deployment_spec_updated(
        &self,
        current: &DeploymentSpec,
        desired: &DeploymentSpec,
        untransformed: &DeploymentSpec,
    ) -> SpecComparison;

    async fn workload_ip(
        &self,
        address: &Address,
        ports: &[ServicePort],
    ) -> Result<WorkloadIp, ProviderError>;

    async fn release_workload_ip(&self, address: &Address) -> Result<(), ProviderError>;
}

/// Mesh ports of a single workload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshPortAssignment {
    pub admin: Option<i32>,
    pub egress: Option<i32>,
    pub ports: BTreeMap<i32, i32>,
}

impl MeshPortAssignment {
    /// Reads whatever is parseable, broken annotations count as missing.
    pub fn from_annotations(annotations: Option<&BTreeMap<String, String>>) -> Self {
        let parse_port = |key| get_annotation(annotations, key).and_then(|port| port.parse().ok());

        Self {
            admin: parse_port(SERVICE_MESH_ADMIN_PORT_ANNOTATION),
            egress: parse_port(SERVICE_MESH_EGRESS_PORT_ANNOTATION),
            ports: get_json_annotation(annotations, SERVICE_MESH_PORTS_ANNOTATION)
                .and_then(Result::ok)
                .unwrap_or_default(),
        }
    }

    pub fn to_annotations(&self) -> Result<BTreeMap<String, String>, ProviderError> {
        let mut annotations = BTreeMap::from([(
            SERVICE_MESH_PORTS_ANNOTATION.to_owned(),
            serde_json::to_string(&self.ports)?,
        )]);

        if let Some(admin) = self.admin {
            annotations.insert(SERVICE_MESH_ADMIN_PORT_ANNOTATION.to_owned(), admin.to_string());
        }

        if let Some(egress) = self.egress {
            annotations.insert(SERVICE_MESH_EGRESS_PORT_ANNOTATION.to_owned(), egress.to_string());
        }

        Ok(annotations)
    }

    /// Assigns a mesh port to every user port plus the admin and egress ports,
    /// scanning up from [`MESH_PORT_BASE`]. Assignments of `previous` survive
    /// unless they point at a user port or are used twice.
    pub fn assign(user_ports: &BTreeSet<i32>, previous: &MeshPortAssignment) -> Self {
        fn keep(port: i32, used: &mut BTreeSet<i32>) -> bool {
            port >= MESH_PORT_BASE && used.insert(port)
        }

        let mut used = user_ports.clone();

        let mut ports = BTreeMap::new();
        for (user_port, mesh_port) in &previous.ports {
            if user_ports.contains(user_port) && keep(*mesh_port, &mut used) {
                ports.insert(*user_port, *mesh_port);
            }
        }

        let mut admin = previous.admin.filter(|port| keep(*port, &mut used));
        let mut egress = previous.egress.filter(|port| keep(*port, &mut used));

        let mut candidates = MESH_PORT_BASE..;
        let mut next_free = |used: &mut BTreeSet<i32>| loop {
            match candidates.next() {
                Some(candidate) if used.insert(candidate) => break candidate,
                Some(_) => continue,
                None => break i32::MAX,
            }
        };

        for user_port in user_ports {
            if !ports.contains_key(user_port) {
                ports.insert(*user_port, next_free(&mut used));
            }
        }

        if admin.is_none() {
            admin = Some(next_free(&mut used));
        }

        if egress.is_none() {
            egress = Some(next_free(&mut used));
        }

        Self {
            admin,
            egress,
            ports,
        }
    }

    /// `true` when the assignment covers exactly `user_ports`.
    pub fn covers(&self, user_ports: &BTreeSet<i32>) -> bool {
        self.admin.is_some()
            && self.egress.is_some()
            && self.ports.keys().copied().collect::<BTreeSet<_>>() == *user_ports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(ports: &[i32]) -> BTreeSet<i32> {
        ports.iter().copied().collect()
    }

    #[test]
    fn fresh_assignment_scans_from_base() {
        let assignment = MeshPortAssignment::assign(&ports(&[80, 8080]), &Default::default());

        assert_eq!(
            assignment.ports,
            BTreeMap::from([(80, 10000), (8080, 10001)])
        );
        assert_eq!(assignment.admin, Some(10002));
        assert_eq!(assignment.egress, Some(10003));
        assert!(assignment.covers(&ports(&[80, 8080])));
    }

    #[test]
    fn user_ports_in_the_mesh_range_are_skipped() {
        let assignment =
            MeshPortAssignment::assign(&ports(&[10000, 10002]), &Default::default());
        let mesh_ports = assignment
            .ports
            .values()
            .copied()
            .chain([assignment.admin.unwrap(), assignment.egress.unwrap()])
            .collect::<Vec<_>>();

        assert_eq!(mesh_ports, vec![10001, 10003, 10004, 10005]);
    }

    #[test]
    fn previous_assignment_is_stable() {
        let first = MeshPortAssignment::assign(&ports(&[80, 8080]), &Default::default());
        let annotations = first.to_annotations().unwrap();
        let read_back = MeshPortAssignment::from_annotations(Some(&annotations));

        assert_eq!(read_back, first);
        assert_eq!(MeshPortAssignment::assign(&ports(&[80, 8080]), &read_back), first);
    }

    #[test]
    fn new_ports_extend_the_assignment_without_moving_others() {
        let first = MeshPortAssignment::assign(&ports(&[80]), &Default::default());
        let second = MeshPortAssignment::assign(&ports(&[80, 443]), &first);

        assert_eq!(second.ports[&80], first.ports[&80]);
        assert_eq!(second.admin, first.admin);
        assert_eq!(second.egress, first.egress);
        assert_eq!(second.ports[&443], 10003);
    }

    #[test]
    fn removed_ports_are_dropped() {
        let first = MeshPortAssignment::assign(&ports(&[80, 443]), &Default::default());
        let second = MeshPortAssignment::assign(&ports(&[443]), &first);

        assert_eq!(second.ports, BTreeMap::from([(443, first.ports[&443])]));
    }

    #[test]
    fn broken_annotations_are_treated_as_missing() {
        let annotations = BTreeMap::from([
            (SERVICE_MESH_PORTS_ANNOTATION.to_owned(), "{not json".to_owned()),
            (SERVICE_MESH_ADMIN_PORT_ANNOTATION.to_owned(), "admin".to_owned()),
        ]);

        assert_eq!(
            MeshPortAssignment::from_annotations(Some(&annotations)),
            MeshPortAssignment::default()
        );
    }
}
