//! Event Demultiplexer (spec §4.D). Three watch streams feed one reconcile
//! queue of `(namespace, sourceServiceName)` keys. Service self-events are
//! handled directly inside the reconciler's key-normalisation step (a
//! managed leader Service redirects to its source); this module covers the
//! Pod and EndpointSlice mapping paths, which the `kube::runtime::Controller`
//! wires in via `.watches(...)`.

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::discovery::v1::EndpointSlice;

use crate::leader_cache::LeaderPodCache;
use crate::model::CandidatePod;
use crate::opt_in_index::OptInIndex;

/// A cheap summary of the pod fields that can affect leader selection
/// (spec §4.D.2: PodReady condition, deletionTimestamp, podIP, phase).
#[derive(Debug, Clone, PartialEq, Eq)]
struct PodFingerprint {
    ready: bool,
    terminating: bool,
    pod_ip: String,
    phase: String,
}

impl PodFingerprint {
    fn of(pod: &Pod) -> Self {
        let candidate = CandidatePod::from_pod(pod);
        let (ready, terminating, pod_ip) = candidate
            .map(|c| (c.ready, c.terminating, c.pod_ip))
            .unwrap_or((false, false, String::new()));
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_default();
        Self { ready, terminating, pod_ip, phase }
    }
}

/// Tracks the last-seen fingerprint per pod UID so the demultiplexer can
/// drop watch deliveries that cannot change leader selection. Watch streams
/// only deliver the current object, not a diff, so this is the mechanism
/// that reconstructs "did anything relevant change" (spec §4.D.2).
#[derive(Default)]
pub struct PodEventFilter {
    last_seen: RwLock<HashMap<String, PodFingerprint>>,
}

impl PodEventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this delivery should be routed through the Opt-In
    /// Index to produce reconcile keys.
    pub fn should_enqueue(&self, pod: &Pod) -> bool {
        let Some(uid) = pod.metadata.uid.clone() else {
            return true;
        };
        let fp = PodFingerprint::of(pod);
        let mut guard = self.last_seen.write().expect("pod event filter lock poisoned");
        match guard.get(&uid) {
            Some(prev) if *prev == fp => false,
            _ => {
                guard.insert(uid, fp);
                true
            }
        }
    }

    pub fn forget(&self, pod_uid: &str) {
        self.last_seen
            .write()
            .expect("pod event filter lock poisoned")
            .remove(pod_uid);
    }
}

/// Maps a Pod watch event to the set of source-Service reconcile keys whose
/// selector matches it, via the Opt-In Index. On a namespace miss, the
/// caller is expected to have already triggered a refresh (spec §4.B) — a
/// miss here just yields no keys for this delivery, and the Opt-In Index
/// rebuilds lazily on the next lookup.
pub fn map_pod_to_reconcile_keys(index: &OptInIndex, pod: &Pod) -> Vec<(String, String)> {
    let Some(namespace) = pod.metadata.namespace.clone() else {
        return vec![];
    };
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    index
        .lookup(&namespace, &labels)
        .unwrap_or_default()
        .into_iter()
        .map(|name| (namespace.clone(), name))
        .collect()
}

/// Pod delete handling (spec §4.D.2): invalidate any Leader-Pod Cache entry
/// recording this pod's UID as the current leader, and forget its
/// fingerprint so a same-named pod recreated later is treated fresh.
pub fn handle_pod_deleted(filter: &PodEventFilter, cache: &LeaderPodCache, pod: &Pod) {
    if let Some(uid) = &pod.metadata.uid {
        cache.invalidate_by_pod_uid(uid);
        filter.forget(uid);
    }
}

/// Process-local `(namespace, leaderServiceName) -> sourceServiceName` map,
/// populated by the reconciler whenever it computes a leader Service name
/// (spec §4.D.3 needs this to route EndpointSlice drift back to its source;
/// the slice itself only carries the leader Service's name, not the source's).
#[derive(Default)]
pub struct LeaderNameIndex {
    entries: RwLock<HashMap<(String, String), String>>,
}

impl LeaderNameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, namespace: &str, leader_service_name: &str, source_name: &str) {
        self.entries
            .write()
            .expect("leader name index lock poisoned")
            .insert((namespace.to_string(), leader_service_name.to_string()), source_name.to_string());
    }

    pub fn get(&self, namespace: &str, leader_service_name: &str) -> Option<String> {
        self.entries
            .read()
            .expect("leader name index lock poisoned")
            .get(&(namespace.to_string(), leader_service_name.to_string()))
            .cloned()
    }
}

/// Maps a managed EndpointSlice event to its owning leader Service's source
/// Service name, read off the EndpointSlice's `service-name` label plus a
/// lookup of that leader Service's `source-service` label in a local Service
/// store (spec §4.D.3). Returns `None` for slices not labelled as ours.
pub fn map_endpointslice_to_source<F>(slice: &EndpointSlice, lookup_leader_source: F) -> Option<(String, String)>
where
    F: Fn(&str, &str) -> Option<String>,
{
    let namespace = slice.metadata.namespace.clone()?;
    let labels = slice.metadata.labels.as_ref()?;
    if labels.get(crate::model::LABEL_ENDPOINTSLICE_MANAGED_BY)
        != Some(&crate::model::LABEL_MANAGED_BY_VALUE.to_string())
    {
        return None;
    }
    let leader_service_name = labels.get(crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME)?;
    let source_name = lookup_leader_source(&namespace, leader_service_name)?;
    Some((namespace, source_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(uid: &str, ns: &str, labels: &[(&str, &str)], ready: bool, ip: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                uid: Some(uid.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                ..Default::default()
            },
            status: Some(k8s_openapi::api::core::v1::PodStatus {
                pod_ip: Some(ip.to_string()),
                phase: Some("Running".to_string()),
                conditions: Some(vec![k8s_openapi::api::core::v1::PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True".to_string() } else { "False".to_string() },
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn unchanged_redelivery_is_suppressed() {
        let filter = PodEventFilter::new();
        let p = pod("uid-1", "ns", &[], true, "10.0.0.1");
        assert!(filter.should_enqueue(&p));
        assert!(!filter.should_enqueue(&p));
    }

    #[test]
    fn readiness_change_is_not_suppressed() {
        let filter = PodEventFilter::new();
        let p1 = pod("uid-1", "ns", &[], true, "10.0.0.1");
        let p2 = pod("uid-1", "ns", &[], false, "10.0.0.1");
        assert!(filter.should_enqueue(&p1));
        assert!(filter.should_enqueue(&p2));
    }

    #[test]
    fn map_pod_to_keys_uses_opt_in_index() {
        let index = OptInIndex::new();
        index.refresh(
            "ns",
            vec![crate::opt_in_index::OptInEntry {
                name: "svc-a".into(),
                match_labels: BTreeMap::from([("app".to_string(), "api".to_string())]),
            }],
            500,
        );
        let p = pod("uid-1", "ns", &[("app", "api")], true, "10.0.0.1");
        let keys = map_pod_to_reconcile_keys(&index, &p);
        assert_eq!(keys, vec![("ns".to_string(), "svc-a".to_string())]);
    }

    #[test]
    fn pod_delete_invalidates_cache_by_uid() {
        let filter = PodEventFilter::new();
        let cache = LeaderPodCache::new();
        let p = pod("uid-1", "ns", &[], true, "10.0.0.1");
        filter.should_enqueue(&p);
        cache.put(
            ("ns".to_string(), "svc-a".to_string()),
            crate::model::LeaderIdentity { pod_name: "p".into(), pod_uid: "uid-1".into() },
            std::time::Instant::now(),
            std::time::Duration::from_secs(30),
        );
        handle_pod_deleted(&filter, &cache, &p);
        assert!(cache.get(&("ns".to_string(), "svc-a".to_string()), std::time::Instant::now()).is_none());
        assert!(filter.should_enqueue(&p));
    }

    #[test]
    fn leader_name_index_roundtrips() {
        let idx = LeaderNameIndex::new();
        idx.record("ns", "s-leader", "s");
        assert_eq!(idx.get("ns", "s-leader"), Some("s".to_string()));
        assert_eq!(idx.get("ns", "other-leader"), None);
    }

    #[test]
    fn endpointslice_maps_to_source_via_leader_name_index() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
        let idx = LeaderNameIndex::new();
        idx.record("ns", "s-leader", "s");
        let slice = EndpointSlice {
            metadata: ObjectMeta {
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([
                    (crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME.to_string(), "s-leader".to_string()),
                    (crate::model::LABEL_ENDPOINTSLICE_MANAGED_BY.to_string(), crate::model::LABEL_MANAGED_BY_VALUE.to_string()),
                ])),
                ..Default::default()
            },
            address_type: "IPv4".to_string(),
            endpoints: vec![],
            ports: None,
        };
        let key = map_endpointslice_to_source(&slice, |ns, leader| idx.get(ns, leader));
        assert_eq!(key, Some(("ns".to_string(), "s".to_string())));
    }
}
