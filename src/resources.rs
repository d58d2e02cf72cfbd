//! Desired-state builders for the leader Service and its managed
//! EndpointSlice (spec §3, §6.2). Each builder stamps a content-hash
//! annotation so the reconciler can skip a patch when nothing changed,
//! the same fingerprint-before-write discipline the teacher operator used
//! for its Deployment rollout hash.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ObjectReference, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions, EndpointPort, EndpointSlice};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::model::{
    managed_labels, ANNOTATION_CURRENT_LEADER, ANNOTATION_LEADER_LAST_SWITCH_TIME,
    ANNOTATION_LEADER_POD_NAME, ANNOTATION_LEADER_POD_UID, SourcePort, TargetPort,
};
use crate::ports::ResolvedPort;

/// Internal bookkeeping annotation; not part of the documented external
/// contract (spec §6.2), used only to decide whether a patch is a no-op.
pub const ANNOTATION_CONTENT_HASH: &str = "zen-lead.io/content-hash";

#[derive(Serialize)]
struct LeaderServiceFingerprint<'a> {
    ports: &'a [SourcePort],
    leader_pod_name: Option<&'a str>,
    leader_pod_uid: Option<&'a str>,
}

fn fingerprint<T: Serialize>(value: &T) -> String {
    let mut hasher = Sha256::new();
    let bytes = serde_json::to_vec(value).expect("fingerprint serialize");
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn target_port_to_intstr(tp: &TargetPort) -> k8s_openapi::apimachinery::pkg::util::intstr::IntOrString {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    match tp {
        TargetPort::Number(n) => IntOrString::Int(*n),
        TargetPort::Name(s) => IntOrString::String(s.clone()),
    }
}

/// Builds the desired leader Service: empty selector, ports mirrored from
/// the source, managed labels, leader-identity annotations when known, and
/// an owner reference to the source Service (spec §3).
pub fn desired_leader_service(
    leader_name: &str,
    source_name: &str,
    source_ports: &[SourcePort],
    leader: Option<(&str, &str)>,
    last_switch_time: Option<&str>,
    owner: OwnerReference,
) -> Service {
    let mut labels = managed_labels(source_name);
    labels.insert("app.kubernetes.io/name".to_string(), "zen-lead-leader".to_string());

    let mut annotations = BTreeMap::new();
    if let Some((pod_name, pod_uid)) = leader {
        annotations.insert(ANNOTATION_LEADER_POD_NAME.to_string(), pod_name.to_string());
        annotations.insert(ANNOTATION_LEADER_POD_UID.to_string(), pod_uid.to_string());
        annotations.insert(ANNOTATION_CURRENT_LEADER.to_string(), pod_name.to_string());
    }
    if let Some(t) = last_switch_time {
        annotations.insert(ANNOTATION_LEADER_LAST_SWITCH_TIME.to_string(), t.to_string());
    }

    let fp = fingerprint(&LeaderServiceFingerprint {
        ports: source_ports,
        leader_pod_name: leader.map(|(n, _)| n),
        leader_pod_uid: leader.map(|(_, u)| u),
    });
    annotations.insert(ANNOTATION_CONTENT_HASH.to_string(), fp);

    Service {
        metadata: ObjectMeta {
            name: Some(leader_name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            // Empty selector: the platform must never auto-populate endpoints
            // for this Service. Only this controller writes its EndpointSlice.
            selector: None,
            ports: Some(
                source_ports
                    .iter()
                    .map(|p| ServicePort {
                        name: p.name.clone(),
                        port: p.port,
                        target_port: Some(target_port_to_intstr(&p.target_port)),
                        protocol: Some(p.protocol.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Serialize)]
struct EndpointSliceFingerprint<'a> {
    pod_ip: Option<&'a str>,
    pod_uid: Option<&'a str>,
    ready: Option<bool>,
    ports: &'a [ResolvedPort],
}

/// Builds the desired EndpointSlice: empty `endpoints` when there is no
/// leader, otherwise exactly one endpoint at the leader pod with resolved
/// ports (spec §3, §4.E, §4.G step 8).
pub fn desired_endpointslice(
    slice_name: &str,
    leader_service_name: &str,
    owner: OwnerReference,
    leader: Option<LeaderEndpointInput<'_>>,
) -> EndpointSlice {
    let mut labels = BTreeMap::new();
    labels.insert(
        crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME.to_string(),
        leader_service_name.to_string(),
    );
    labels.insert(
        crate::model::LABEL_ENDPOINTSLICE_MANAGED_BY.to_string(),
        crate::model::LABEL_MANAGED_BY_VALUE.to_string(),
    );

    let fp = fingerprint(&EndpointSliceFingerprint {
        pod_ip: leader.as_ref().map(|l| l.pod_ip),
        pod_uid: leader.as_ref().map(|l| l.pod_uid),
        ready: leader.as_ref().map(|l| l.ready),
        ports: leader.as_ref().map(|l| l.ports).unwrap_or(&[]),
    });
    let mut annotations = BTreeMap::new();
    annotations.insert(ANNOTATION_CONTENT_HASH.to_string(), fp);

    let endpoints = match &leader {
        None => vec![],
        Some(l) => vec![Endpoint {
            addresses: vec![l.pod_ip.to_string()],
            conditions: Some(EndpointConditions {
                ready: Some(l.ready),
                serving: Some(l.ready),
                terminating: Some(false),
            }),
            target_ref: Some(ObjectReference {
                kind: Some("Pod".to_string()),
                name: Some(l.pod_name.to_string()),
                namespace: Some(l.namespace.to_string()),
                uid: Some(l.pod_uid.to_string()),
                ..Default::default()
            }),
            hostname: None,
            node_name: None,
            zone: None,
            deprecated_topology: None,
            hints: None,
        }],
    };

    let ports = leader.as_ref().map(|l| {
        l.ports
            .iter()
            .map(|p| EndpointPort {
                name: p.name.clone(),
                port: Some(p.port),
                protocol: Some(p.protocol.clone()),
                app_protocol: None,
            })
            .collect::<Vec<_>>()
    });

    EndpointSlice {
        metadata: ObjectMeta {
            name: Some(slice_name.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        address_type: "IPv4".to_string(),
        endpoints,
        ports,
    }
}

#[derive(Clone, Copy)]
pub struct LeaderEndpointInput<'a> {
    pub pod_name: &'a str,
    pub pod_uid: &'a str,
    pub namespace: &'a str,
    pub pod_ip: &'a str,
    pub ready: bool,
    pub ports: &'a [ResolvedPort],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> OwnerReference {
        OwnerReference {
            api_version: "v1".into(),
            kind: "Service".into(),
            name: "s".into(),
            uid: "uid-1".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    #[test]
    fn leader_service_has_empty_selector() {
        let svc = desired_leader_service("s-leader", "s", &[], None, None, owner());
        assert!(svc.spec.unwrap().selector.is_none());
    }

    #[test]
    fn identical_inputs_produce_identical_content_hash() {
        let a = desired_leader_service("s-leader", "s", &[], Some(("p1", "uid-p1")), None, owner());
        let b = desired_leader_service("s-leader", "s", &[], Some(("p1", "uid-p1")), None, owner());
        let hash = |svc: &Service| svc.metadata.annotations.as_ref().unwrap().get(ANNOTATION_CONTENT_HASH).cloned();
        assert_eq!(hash(&a), hash(&b));
    }

    #[test]
    fn endpointslice_without_leader_has_no_endpoints() {
        let slice = desired_endpointslice("s-leader-xyz", "s-leader", owner(), None);
        assert!(slice.endpoints.is_empty());
    }

    #[test]
    fn endpointslice_with_leader_has_exactly_one_endpoint() {
        let ports = vec![ResolvedPort { name: Some("http".into()), port: 8080, protocol: "TCP".into() }];
        let slice = desired_endpointslice(
            "s-leader-xyz",
            "s-leader",
            owner(),
            Some(LeaderEndpointInput {
                pod_name: "p1",
                pod_uid: "uid-p1",
                namespace: "ns",
                pod_ip: "10.0.0.5",
                ready: true,
                ports: &ports,
            }),
        );
        assert_eq!(slice.endpoints.len(), 1);
        assert_eq!(slice.endpoints[0].addresses, vec!["10.0.0.5".to_string()]);
        assert_eq!(slice.endpoints[0].target_ref.as_ref().unwrap().name, Some("p1".to_string()));
    }
}
