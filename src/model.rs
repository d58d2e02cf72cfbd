//! Typed views over the Kubernetes objects the controller reads and writes,
//! plus the annotation/label/event-reason strings that make up the external
//! contract (spec §3, §4.A, §6).

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Mandatory opt-in annotation. Must equal exactly `"true"`.
pub const ANNOTATION_ENABLED: &str = "zen-lead.io/enabled";
/// Toggles sticky leader retention. Default true.
pub const ANNOTATION_STICKY: &str = "zen-lead.io/sticky";
/// Overrides the default `<name>-leader` leader Service name.
pub const ANNOTATION_LEADER_SERVICE_NAME: &str = "zen-lead.io/leader-service-name";
/// Dwell time a Ready pod must hold before becoming eligible.
pub const ANNOTATION_MIN_READY_DURATION: &str = "zen-lead.io/min-ready-duration";

/// Stamped on the leader Service to record the current leader identity.
pub const ANNOTATION_LEADER_POD_NAME: &str = "zen-lead.io/leader-pod-name";
pub const ANNOTATION_LEADER_POD_UID: &str = "zen-lead.io/leader-pod-uid";
pub const ANNOTATION_LEADER_LAST_SWITCH_TIME: &str = "zen-lead.io/leader-last-switch-time";
pub const ANNOTATION_CURRENT_LEADER: &str = "zen-lead.io/current-leader";

/// Identifies controller-owned objects.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_MANAGED_BY_VALUE: &str = "zen-lead";
/// Carries the source Service name on the leader Service.
pub const LABEL_SOURCE_SERVICE: &str = "zen-lead.io/source-service";
/// Carries the leader Service name on the managed EndpointSlice.
pub const LABEL_ENDPOINTSLICE_SERVICE_NAME: &str = "kubernetes.io/service-name";
pub const LABEL_ENDPOINTSLICE_MANAGED_BY: &str = "endpointslice.kubernetes.io/managed-by";

/// A PodReady-style condition carrying a precise transition time.
const POD_READY_CONDITION_TYPE: &str = "Ready";
const POD_READY_STATUS_TRUE: &str = "True";

/// A read-only view of a user-owned Service carrying the opt-in annotation.
#[derive(Debug, Clone)]
pub struct SourceService {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    pub selector: Option<LabelSelector>,
    pub ports: Vec<SourcePort>,
    annotations: BTreeMap<String, String>,
}

/// One port entry of the source Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePort {
    pub name: Option<String>,
    pub port: i32,
    pub target_port: TargetPort,
    pub protocol: String,
}

/// The two shapes `targetPort` can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetPort {
    Number(i32),
    Name(String),
}

impl SourceService {
    /// Builds a view from a live API object. Returns `None` for cluster-scoped
    /// objects, which cannot occur for `Service` but keeps the constructor total
    /// for objects retrieved without a guaranteed namespace.
    pub fn from_service(svc: &Service) -> Option<Self> {
        let namespace = svc.metadata.namespace.clone()?;
        let name = svc.metadata.name.clone()?;
        let annotations = svc.metadata.annotations.clone().unwrap_or_default();
        let spec = svc.spec.as_ref();
        let selector = spec.and_then(|s| {
            s.selector.as_ref().map(|m| LabelSelector {
                match_labels: Some(m.clone()),
                match_expressions: None,
            })
        });
        let ports = spec
            .and_then(|s| s.ports.as_ref())
            .map(|ports| {
                ports
                    .iter()
                    .map(|p| SourcePort {
                        name: p.name.clone(),
                        port: p.port,
                        target_port: match &p.target_port {
                            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::Int(n)) => {
                                TargetPort::Number(*n)
                            }
                            Some(k8s_openapi::apimachinery::pkg::util::intstr::IntOrString::String(s)) => {
                                TargetPort::Name(s.clone())
                            }
                            None => TargetPort::Number(p.port),
                        },
                        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            namespace,
            name,
            uid: svc.metadata.uid.clone(),
            resource_version: svc.metadata.resource_version.clone(),
            selector,
            ports,
            annotations,
        })
    }

    pub fn is_opted_in(&self) -> bool {
        self.annotations
            .get(ANNOTATION_ENABLED)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn is_managed_leader_service(labels: &BTreeMap<String, String>) -> bool {
        labels
            .get(LABEL_MANAGED_BY)
            .map(|v| v == LABEL_MANAGED_BY_VALUE)
            .unwrap_or(false)
    }

    pub fn sticky(&self) -> bool {
        match self.annotations.get(ANNOTATION_STICKY) {
            Some(v) => v != "false",
            None => true,
        }
    }

    pub fn leader_service_name(&self) -> String {
        self.annotations
            .get(ANNOTATION_LEADER_SERVICE_NAME)
            .cloned()
            .unwrap_or_else(|| format!("{}-leader", self.name))
    }

    /// Parses the min-ready-duration annotation; `None` means "no dwell", a
    /// malformed value is treated the same as absent (fail open on a cosmetic
    /// tuning knob, not a safety-relevant one).
    pub fn min_ready_duration(&self) -> Duration {
        self.annotations
            .get(ANNOTATION_MIN_READY_DURATION)
            .and_then(|v| humantime::parse_duration(v).ok())
            .unwrap_or_default()
    }
}

/// A Pod in the source Service's namespace whose labels match its selector.
#[derive(Debug, Clone)]
pub struct CandidatePod {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    pub ready: bool,
    pub terminating: bool,
    /// Set iff `terminating`; the trigger signal for failover-latency sampling
    /// (spec §4.G step 6).
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub pod_ip: String,
    pub ready_since: Option<DateTime<Utc>>,
    pub creation_timestamp: DateTime<Utc>,
    /// Ordered by container, then by port, as declared on the pod spec.
    pub container_ports: Vec<ContainerPortView>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPortView {
    pub name: Option<String>,
    pub container_port: i32,
    pub protocol: String,
}

impl CandidatePod {
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        let name = pod.metadata.name.clone()?;
        let namespace = pod.metadata.namespace.clone()?;
        let uid = pod.metadata.uid.clone()?;
        let creation_timestamp = pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or_else(Utc::now);
        let deletion_timestamp = pod.metadata.deletion_timestamp.as_ref().map(|t| t.0);
        let terminating = deletion_timestamp.is_some();

        let status = pod.status.as_ref();
        let pod_ip = status
            .and_then(|s| s.pod_ip.clone())
            .unwrap_or_default();

        let (ready, ready_since) = status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|c| c.type_ == POD_READY_CONDITION_TYPE)
            })
            .map(|c| {
                let ready = c.status == POD_READY_STATUS_TRUE;
                let since = c.last_transition_time.as_ref().map(|t| t.0);
                (ready, since)
            })
            .unwrap_or((false, None));

        let container_ports = pod
            .spec
            .as_ref()
            .map(|spec| {
                spec.containers
                    .iter()
                    .flat_map(|c| c.ports.iter().flatten())
                    .map(|p| ContainerPortView {
                        name: p.name.clone(),
                        container_port: p.container_port,
                        protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            name,
            uid,
            namespace,
            ready,
            terminating,
            deletion_timestamp,
            pod_ip,
            ready_since,
            creation_timestamp,
            container_ports,
        })
    }
}

/// Identity of a previously- or currently-selected leader pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderIdentity {
    pub pod_name: String,
    pub pod_uid: String,
}

/// Reason a failover occurred, per spec §4.I / §6.4 `failover_count_total{reason}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverReason {
    NotReady,
    Terminating,
    NoIp,
    NoneReady,
}

impl FailoverReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailoverReason::NotReady => "notReady",
            FailoverReason::Terminating => "terminating",
            FailoverReason::NoIp => "noIP",
            FailoverReason::NoneReady => "noneReady",
        }
    }
}

/// Standard managed-object labels stamped on the leader Service and its
/// EndpointSlice (spec §3, §6.2).
pub fn managed_labels(source_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_VALUE.to_string()),
        (LABEL_SOURCE_SERVICE.to_string(), source_name.to_string()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc_with_annotations(ann: BTreeMap<String, String>) -> Service {
        Service {
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                name: Some("s".into()),
                namespace: Some("ns".into()),
                annotations: Some(ann),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn enabled_must_be_exact_lowercase_true() {
        let svc = svc_with_annotations(BTreeMap::from([(
            ANNOTATION_ENABLED.to_string(),
            "True".to_string(),
        )]));
        let s = SourceService::from_service(&svc).unwrap();
        assert!(!s.is_opted_in());
    }

    #[test]
    fn sticky_defaults_true() {
        let svc = svc_with_annotations(BTreeMap::new());
        let s = SourceService::from_service(&svc).unwrap();
        assert!(s.sticky());
    }

    #[test]
    fn sticky_false_is_honored() {
        let svc = svc_with_annotations(BTreeMap::from([(
            ANNOTATION_STICKY.to_string(),
            "false".to_string(),
        )]));
        let s = SourceService::from_service(&svc).unwrap();
        assert!(!s.sticky());
    }

    #[test]
    fn leader_service_name_defaults_to_suffix() {
        let svc = svc_with_annotations(BTreeMap::new());
        let s = SourceService::from_service(&svc).unwrap();
        assert_eq!(s.leader_service_name(), "s-leader");
    }

    #[test]
    fn leader_service_name_override_is_honored() {
        let svc = svc_with_annotations(BTreeMap::from([(
            ANNOTATION_LEADER_SERVICE_NAME.to_string(),
            "custom-leader".to_string(),
        )]));
        let s = SourceService::from_service(&svc).unwrap();
        assert_eq!(s.leader_service_name(), "custom-leader");
    }

    #[test]
    fn malformed_min_ready_duration_is_treated_as_absent() {
        let svc = svc_with_annotations(BTreeMap::from([(
            ANNOTATION_MIN_READY_DURATION.to_string(),
            "not-a-duration".to_string(),
        )]));
        let s = SourceService::from_service(&svc).unwrap();
        assert_eq!(s.min_ready_duration(), Duration::default());
    }
}
