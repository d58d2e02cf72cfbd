//! The Reconciler (spec §4.G): for a single `(namespace, sourceServiceName)`
//! key, fetch the source Service, select a leader among its candidate pods,
//! and materialise the leader Service and its EndpointSlice so that clients
//! of the leader Service see exactly one Ready backing pod.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::Error;
use crate::events::EventPublisher;
use crate::demux::LeaderNameIndex;
use crate::gc::sweep_leader_services;
use crate::leader_cache::LeaderPodCache;
use crate::metrics::Metrics;
use crate::model::{CandidatePod, FailoverReason, LeaderIdentity, SourceService};
use crate::opt_in_index::OptInIndex;
use crate::ports::resolve_ports;
use crate::resources::{desired_endpointslice, desired_leader_service, LeaderEndpointInput, ANNOTATION_CONTENT_HASH};
use crate::retry::{retry, RetryProfile};
use crate::selector::{select_leader, Selection};

const FIELD_MANAGER: &str = "zen-lead-controller";

pub struct Ctx {
    pub client: Client,
    pub config: Config,
    pub metrics: Arc<Metrics>,
    pub events: Arc<EventPublisher>,
    pub opt_in_index: Arc<OptInIndex>,
    pub leader_cache: Arc<LeaderPodCache>,
    pub leader_name_index: Arc<LeaderNameIndex>,
}

/// Entry point wired into `kube::runtime::Controller::run`. Normalises a
/// Service event (which may name either a source Service or one of our own
/// leader Services) down to the source Service's key, per spec §4.D.1.
pub async fn reconcile(obj: Arc<Service>, ctx: Arc<Ctx>) -> Result<Action, Error> {
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let labels = obj.metadata.labels.clone().unwrap_or_default();

    let source_name = if SourceService::is_managed_leader_service(&labels) {
        match labels.get(crate::model::LABEL_SOURCE_SERVICE) {
            Some(name) => name.clone(),
            None => {
                warn!(namespace, leader_service = %obj.name_any(), "managed leader service missing source-service label, skipping");
                return Ok(Action::requeue(Duration::from_secs(300)));
            }
        }
    } else {
        obj.name_any()
    };

    reconcile_key(&ctx, &namespace, &source_name).await
}

pub fn error_policy(_obj: Arc<Service>, err: &Error, _ctx: Arc<Ctx>) -> Action {
    warn!(%err, "reconcile failed, requeueing with backoff");
    Action::requeue(Duration::from_secs(10))
}

/// Runs one full reconcile of `(namespace, name)` and records the
/// `reconciliations_total`/`reconciliation_duration_seconds` metrics exactly
/// once regardless of outcome (spec §4.I).
pub async fn reconcile_key(ctx: &Ctx, namespace: &str, name: &str) -> Result<Action, Error> {
    let start = Instant::now();
    let result = reconcile_inner(ctx, namespace, name).await;
    let elapsed = start.elapsed().as_secs_f64();
    match &result {
        Ok(_) => ctx.metrics.record_reconcile(namespace, name, "success", elapsed),
        Err(err) => {
            ctx.metrics.record_reconcile(namespace, name, "error", elapsed);
            ctx.metrics.record_reconcile_error(namespace, name, error_type(err));
        }
    }
    result
}

fn error_type(err: &Error) -> &'static str {
    match err {
        Error::Kube(_) => "kube",
        Error::Validation { .. } => "validation",
        Error::Timeout { .. } => "timeout",
    }
}

async fn reconcile_inner(ctx: &Ctx, namespace: &str, name: &str) -> Result<Action, Error> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);

    // Step 1: fetch source Service. Absent -> safety sweep and succeed.
    let svc_obj = match services.get_opt(name).await? {
        Some(s) => s,
        None => {
            debug!(namespace, name, "source service not found, sweeping orphans");
            ctx.opt_in_index.remove(namespace, name);
            sweep_leader_services(&ctx.client, namespace, name).await?;
            return Ok(Action::requeue(Duration::from_secs(300)));
        }
    };
    let Some(source) = SourceService::from_service(&svc_obj) else {
        return Ok(Action::requeue(Duration::from_secs(300)));
    };

    // Step 2: gate on opt-in. Removing the annotation is the documented
    // uninstall path.
    if !source.is_opted_in() {
        debug!(namespace, name, "service is not opted in, sweeping any prior leader chain");
        ctx.opt_in_index.remove(namespace, name);
        let swept = sweep_leader_services(&ctx.client, namespace, name).await?;
        if swept > 0 {
            ctx.events.endpointslice_deleted(object_ref(&svc_obj)).await;
        }
        return Ok(Action::requeue(Duration::from_secs(300)));
    }

    // Step 3: validate selector.
    let Some(selector) = &source.selector else {
        ctx.events.selector_invalid(object_ref(&svc_obj)).await;
        return Err(Error::Validation { object: format!("Service/{namespace}/{name}"), field: "selector" });
    };
    if selector.match_labels.as_ref().map(|m| m.is_empty()).unwrap_or(true) {
        ctx.events.selector_invalid(object_ref(&svc_obj)).await;
        return Err(Error::Validation { object: format!("Service/{namespace}/{name}"), field: "selector" });
    }

    // Keep the Opt-In Index fresh for the demultiplexer's hot path.
    ctx.opt_in_index.upsert(
        namespace,
        crate::opt_in_index::OptInEntry::from_selector(name.to_string(), selector),
        ctx.config.max_cache_size_per_namespace,
    );

    let leader_service_name = source.leader_service_name();
    ctx.leader_name_index.record(namespace, &leader_service_name, name);

    // Step 4: resolve previous leader via cache, falling back to the
    // EndpointSlice's targetRef, verified by fetching the referenced pod.
    let cache_key = (namespace.to_string(), name.to_string());
    let previous = resolve_previous_leader(ctx, namespace, &cache_key, &leader_service_name).await?;

    // Step 5: list candidates.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let label_selector = label_selector_string(selector);
    let list_started = Utc::now();
    let candidates: Vec<CandidatePod> = retry(
        RetryProfile::Standard,
        &ctx.config.standard_retry,
        &ctx.metrics,
        namespace,
        name,
        "list_pods",
        || {
            let pods = pods.clone();
            let label_selector = label_selector.clone();
            async move {
                let list = pods
                    .list(&ListParams::default().labels(&label_selector))
                    .await?;
                Ok(list.items.iter().filter_map(CandidatePod::from_pod).collect::<Vec<_>>())
            }
        },
    )
    .await?;

    if candidates.is_empty() {
        ctx.events.no_pods_found(object_ref(&svc_obj)).await;
    }

    // Step 6: select leader.
    let min_ready = source.min_ready_duration();
    let selection = select_leader(&candidates, previous.as_ref(), source.sticky(), Utc::now(), min_ready);
    let eligible_count = candidates
        .iter()
        .filter(|p| p.ready && !p.terminating && !p.pod_ip.is_empty())
        .count();
    ctx.metrics.set_pods_available(namespace, name, eligible_count as i64);

    match &selection {
        Selection::Leader { sticky_hit, .. } => {
            if *sticky_hit {
                ctx.metrics.sticky_hit();
            } else {
                ctx.metrics.sticky_miss();
            }
        }
        Selection::NoLeader => {}
    }

    let owner = svc_obj.controller_owner_ref(&()).expect("Service is namespace-scoped");

    // Step 7 + 8: reconcile leader Service and EndpointSlice for the new state.
    let (new_leader_ref, ports_resolution) = match &selection {
        Selection::Leader { pod, .. } => {
            let resolution = resolve_ports(&source.ports, pod);
            (Some(LeaderIdentity { pod_name: pod.name.clone(), pod_uid: pod.uid.clone() }), Some((pod.clone(), resolution)))
        }
        Selection::NoLeader => (None, None),
    };

    let leader_for_service = new_leader_ref
        .as_ref()
        .map(|l| (l.pod_name.as_str(), l.pod_uid.as_str()));

    let leader_services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let leader_changed = new_leader_ref != previous;

    // The switch-time annotation must be carried forward on reconciles that
    // don't touch the leader identity (e.g. a port change), never silently
    // dropped by server-side apply omitting a field it previously owned.
    let existing_leader_svc = leader_services.get_opt(&leader_service_name).await?;
    let had_existing_leader_svc = existing_leader_svc.is_some();
    let carried_switch_time = existing_leader_svc
        .as_ref()
        .and_then(|s| s.metadata.annotations.as_ref())
        .and_then(|a| a.get(crate::model::ANNOTATION_LEADER_LAST_SWITCH_TIME).cloned());
    let switch_time = Utc::now().to_rfc3339();
    let last_switch_time = if leader_changed && new_leader_ref.is_some() {
        Some(switch_time.clone())
    } else {
        carried_switch_time
    };

    let leader_svc = desired_leader_service(
        &leader_service_name,
        name,
        &source.ports,
        leader_for_service,
        last_switch_time.as_deref(),
        owner.clone(),
    );

    let leader_obj = apply_if_changed(&leader_services, &leader_service_name, existing_leader_svc, &leader_svc, namespace, name, ctx).await?;
    if !had_existing_leader_svc {
        ctx.events
            .leader_service_created(object_ref(&svc_obj), &leader_service_name)
            .await;
    }

    let leader_owner = leader_obj
        .controller_owner_ref(&())
        .unwrap_or_else(|| owner.clone());
    let source_uid = svc_obj.uid().unwrap_or_default();
    let slice_name = format!("{leader_service_name}-{}", &source_uid[..8.min(source_uid.len())]);

    let mut port_failures: Vec<String> = vec![];
    let endpoint_input = match &ports_resolution {
        Some((pod, resolution)) => {
            port_failures = resolution.failed.clone();
            if resolution.all_failed() {
                None
            } else {
                Some(LeaderEndpointInput {
                    pod_name: &pod.name,
                    pod_uid: &pod.uid,
                    namespace: &pod.namespace,
                    pod_ip: &pod.pod_ip,
                    ready: pod.ready,
                    ports: &resolution.resolved,
                })
            }
        }
        None => None,
    };

    let desired_slice = desired_endpointslice(&slice_name, &leader_service_name, leader_owner, endpoint_input);
    let slices: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), namespace);
    apply_endpointslice_if_changed(&slices, &slice_name, &desired_slice, namespace, name, ctx).await?;

    for failed_port in &port_failures {
        ctx.metrics.port_resolution_failure(namespace, name, failed_port);
        ctx.events.port_resolution_failed(object_ref(&svc_obj), failed_port).await;
    }

    let has_leader = endpoint_input.is_some() || (new_leader_ref.is_some() && port_failures.is_empty());
    ctx.metrics.set_endpoints_empty(namespace, name, !has_leader);

    // Step 9: side effects — cache, metrics, events on transition.
    if leader_changed {
        match (&previous, &new_leader_ref) {
            (None, Some(new)) => {
                ctx.events.leader_routing_available(object_ref(&svc_obj), &new.pod_name).await;
            }
            (Some(_), Some(new)) => {
                let outgoing = previous_pod(&candidates, previous.as_ref());
                let reason = determine_failover_reason(outgoing, eligible_count > 0);
                // Earliest known triggering signal: the outgoing pod's
                // deletionTimestamp if it is terminating, otherwise the time
                // this reconcile started listing candidates (spec §4.G step 6).
                let trigger = outgoing
                    .and_then(|p| p.deletion_timestamp)
                    .filter(|t| *t < list_started)
                    .unwrap_or(list_started);
                let latency = (Utc::now() - trigger).num_milliseconds().max(0) as f64 / 1000.0;
                ctx.metrics.record_failover(namespace, name, reason, latency);
                ctx.events
                    .leader_changed(object_ref(&svc_obj), previous.as_ref().map(|p| p.pod_name.as_str()), &new.pod_name)
                    .await;
            }
            (Some(_), None) => {
                let latency = (Utc::now() - list_started).num_milliseconds().max(0) as f64 / 1000.0;
                ctx.metrics.record_failover(namespace, name, FailoverReason::NoneReady, latency);
                ctx.events.no_ready_pods(object_ref(&svc_obj)).await;
            }
            (None, None) => {}
        }

        match &new_leader_ref {
            Some(identity) => ctx.leader_cache.put(
                cache_key,
                identity.clone(),
                Instant::now(),
                ctx.config.leader_pod_cache_ttl,
            ),
            None => ctx.leader_cache.invalidate(&cache_key),
        }
    }

    // Time since the current leader was *elected*, not since its pod became
    // Ready — a promoted standby may have been Ready for a long time before
    // taking the role (spec §6.4 `leader_duration_seconds`).
    let leader_duration = new_leader_ref
        .as_ref()
        .and_then(|_| last_switch_time.as_deref())
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|since| (Utc::now() - since.with_timezone(&Utc)).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0);
    let leader_pod_age = previous_pod(&candidates, new_leader_ref.as_ref())
        .map(|p| (Utc::now() - p.creation_timestamp).num_milliseconds().max(0) as f64 / 1000.0)
        .unwrap_or(0.0);
    ctx.metrics
        .set_leader_gauges(namespace, name, new_leader_ref.is_some(), leader_duration, leader_pod_age);

    Ok(Action::requeue(Duration::from_secs(30)))
}

fn previous_pod<'a>(candidates: &'a [CandidatePod], identity: Option<&LeaderIdentity>) -> Option<&'a CandidatePod> {
    let identity = identity?;
    candidates.iter().find(|p| p.uid == identity.pod_uid)
}

/// Pure decision of failover reason (spec §4.I / §6.4), split out so it is
/// directly unit-testable without a Kubernetes client.
fn determine_failover_reason(outgoing: Option<&CandidatePod>, any_eligible_remaining: bool) -> FailoverReason {
    if !any_eligible_remaining {
        return FailoverReason::NoneReady;
    }
    match outgoing {
        Some(pod) if pod.terminating => FailoverReason::Terminating,
        Some(pod) if pod.pod_ip.is_empty() => FailoverReason::NoIp,
        _ => FailoverReason::NotReady,
    }
}

fn label_selector_string(selector: &k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|m| m.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(","))
        .unwrap_or_default()
}

fn object_ref(svc: &Service) -> k8s_openapi::api::core::v1::ObjectReference {
    k8s_openapi::api::core::v1::ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Service".to_string()),
        name: svc.metadata.name.clone(),
        namespace: svc.metadata.namespace.clone(),
        uid: svc.metadata.uid.clone(),
        resource_version: svc.metadata.resource_version.clone(),
        ..Default::default()
    }
}

async fn resolve_previous_leader(
    ctx: &Ctx,
    namespace: &str,
    cache_key: &(String, String),
    leader_service_name: &str,
) -> Result<Option<LeaderIdentity>, Error> {
    if let Some(identity) = ctx.leader_cache.get(cache_key, Instant::now()) {
        ctx.metrics.cache_hit(namespace);
        return Ok(Some(identity));
    }
    ctx.metrics.cache_miss(namespace);

    // Fall back to the EndpointSlice's single endpoint, fast-retry profile.
    let slices: Api<EndpointSlice> = Api::namespaced(ctx.client.clone(), namespace);
    let list = retry(
        RetryProfile::Fast,
        &ctx.config.fast_retry,
        &ctx.metrics,
        namespace,
        leader_service_name,
        "get_endpointslice",
        || {
            let slices = slices.clone();
            let selector = format!(
                "{}={leader_service_name}",
                crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME
            );
            async move {
                Ok(slices
                    .list(&ListParams::default().labels(&selector))
                    .await?
                    .items)
            }
        },
    )
    .await?;

    let Some(endpoint_ref) = list
        .iter()
        .flat_map(|s| s.endpoints.iter())
        .find_map(|e| e.target_ref.as_ref())
    else {
        return Ok(None);
    };
    let Some(pod_name) = &endpoint_ref.name else {
        return Ok(None);
    };
    let Some(expected_uid) = &endpoint_ref.uid else {
        return Ok(None);
    };

    // Verify by fetching the referenced pod (fast-retry); a UID mismatch or
    // NotFound invalidates any stale assumption.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), namespace);
    let pod_name_owned = pod_name.clone();
    let fetched = retry(
        RetryProfile::Fast,
        &ctx.config.fast_retry,
        &ctx.metrics,
        namespace,
        leader_service_name,
        "get_pod",
        || {
            let pods = pods.clone();
            let pod_name = pod_name_owned.clone();
            async move { Ok(pods.get_opt(&pod_name).await?) }
        },
    )
    .await?;

    match fetched {
        Some(pod) if pod.metadata.uid.as_deref() == Some(expected_uid.as_str()) => {
            Ok(Some(LeaderIdentity { pod_name: pod_name.clone(), pod_uid: expected_uid.clone() }))
        }
        _ => {
            ctx.leader_cache.invalidate(cache_key);
            Ok(None)
        }
    }
}

/// Skips the write entirely when the desired object's content hash matches
/// what is already live, per spec §4.G step 7 ("patching is idempotent").
async fn apply_if_changed(
    api: &Api<Service>,
    name: &str,
    current: Option<Service>,
    desired: &Service,
    namespace: &str,
    service: &str,
    ctx: &Ctx,
) -> Result<Service, Error> {
    if let Some(current) = current {
        if same_content_hash(current.metadata.annotations.as_ref(), desired.metadata.annotations.as_ref()) {
            return Ok(current);
        }
    }
    retry(
        RetryProfile::Standard,
        &ctx.config.standard_retry,
        &ctx.metrics,
        namespace,
        service,
        "apply_leader_service",
        || {
            let api = api.clone();
            let desired = desired.clone();
            async move {
                Ok(api
                    .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&desired))
                    .await?)
            }
        },
    )
    .await
}

async fn apply_endpointslice_if_changed(
    api: &Api<EndpointSlice>,
    name: &str,
    desired: &EndpointSlice,
    namespace: &str,
    service: &str,
    ctx: &Ctx,
) -> Result<(), Error> {
    if let Some(current) = api.get_opt(name).await? {
        if same_content_hash(current.metadata.annotations.as_ref(), desired.metadata.annotations.as_ref()) {
            return Ok(());
        }
    }
    let result = retry(
        RetryProfile::Fast,
        &ctx.config.fast_retry,
        &ctx.metrics,
        namespace,
        service,
        "apply_endpointslice",
        || {
            let api = api.clone();
            let desired = desired.clone();
            async move {
                Ok(api
                    .patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&desired))
                    .await?)
            }
        },
    )
    .await;
    if result.is_err() {
        ctx.metrics.endpoint_write_error();
    }
    result.map(|_: EndpointSlice| ())
}

fn same_content_hash(a: Option<&BTreeMap<String, String>>, b: Option<&BTreeMap<String, String>>) -> bool {
    let ha = a.and_then(|m| m.get(ANNOTATION_CONTENT_HASH));
    let hb = b.and_then(|m| m.get(ANNOTATION_CONTENT_HASH));
    ha.is_some() && ha == hb
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pod(name: &str, uid: &str, ready: bool, terminating: bool, ip: &str) -> CandidatePod {
        CandidatePod {
            name: name.to_string(),
            uid: uid.to_string(),
            namespace: "ns".to_string(),
            ready,
            terminating,
            deletion_timestamp: if terminating { Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 30, 0).unwrap()) } else { None },
            pod_ip: ip.to_string(),
            ready_since: Some(Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap()),
            creation_timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap(),
            container_ports: vec![],
        }
    }

    #[test]
    fn reason_is_none_ready_when_no_eligible_pods_remain() {
        let p = pod("p1", "u1", false, false, "10.0.0.1");
        assert_eq!(determine_failover_reason(Some(&p), false), FailoverReason::NoneReady);
    }

    #[test]
    fn reason_is_terminating_when_outgoing_pod_is_terminating() {
        let p = pod("p1", "u1", true, true, "10.0.0.1");
        assert_eq!(determine_failover_reason(Some(&p), true), FailoverReason::Terminating);
    }

    #[test]
    fn reason_is_no_ip_when_outgoing_pod_lost_its_ip() {
        let p = pod("p1", "u1", true, false, "");
        assert_eq!(determine_failover_reason(Some(&p), true), FailoverReason::NoIp);
    }

    #[test]
    fn reason_defaults_to_not_ready() {
        let p = pod("p1", "u1", false, false, "10.0.0.1");
        assert_eq!(determine_failover_reason(Some(&p), true), FailoverReason::NotReady);
    }

    #[test]
    fn previous_pod_lookup_finds_by_uid() {
        let pods = vec![pod("p1", "u1", true, false, "10.0.0.1"), pod("p2", "u2", true, false, "10.0.0.2")];
        let identity = LeaderIdentity { pod_name: "p2".into(), pod_uid: "u2".into() };
        let found = previous_pod(&pods, Some(&identity));
        assert_eq!(found.unwrap().name, "p2");
    }

    #[test]
    fn content_hash_comparison_requires_both_present_and_equal() {
        let mut a = BTreeMap::new();
        a.insert(ANNOTATION_CONTENT_HASH.to_string(), "x".to_string());
        let mut b = BTreeMap::new();
        b.insert(ANNOTATION_CONTENT_HASH.to_string(), "x".to_string());
        assert!(same_content_hash(Some(&a), Some(&b)));
        b.insert(ANNOTATION_CONTENT_HASH.to_string(), "y".to_string());
        assert!(!same_content_hash(Some(&a), Some(&b)));
        assert!(!same_content_hash(None, Some(&b)));
    }
}
