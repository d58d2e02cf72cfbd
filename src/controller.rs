//! Runtime harness wiring (spec §6.6 "Runtime harness" collaborator, §5).
//! Builds the shared reconcile context, registers the Pod/EndpointSlice
//! watches that feed the Event Demultiplexer (spec §4.D), and hands
//! everything to `kube::runtime::Controller`. Only one active replica is
//! expected at a time (spec §5 "process-level singleton"); this module does
//! not itself arbitrate that — it is an external collaborator's concern.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::{controller::Config as ControllerConfig, reflector::ObjectRef, watcher, Controller};
use kube::{Api, Client};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::demux::{self, LeaderNameIndex, PodEventFilter};
use crate::events::EventPublisher;
use crate::leader_cache::LeaderPodCache;
use crate::metrics::Metrics;
use crate::opt_in_index::OptInIndex;
use crate::reconciler::{error_policy, reconcile, Ctx};

const CONTROLLER_NAME: &str = "zen-lead-controller";

/// Builds the client, shared caches, and metrics registry, then runs the
/// reconcile loop until shutdown. `main.rs` stays a thin wrapper around this.
pub async fn run() -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let config = Config::from_env();
    let metrics = Arc::new(Metrics::new()?);
    let events = Arc::new(EventPublisher::new(client.clone(), CONTROLLER_NAME));
    let opt_in_index = Arc::new(OptInIndex::new());
    let leader_cache = Arc::new(LeaderPodCache::new());
    let leader_name_index = Arc::new(LeaderNameIndex::new());
    let pod_filter = Arc::new(PodEventFilter::new());

    let ctx = Arc::new(Ctx {
        client: client.clone(),
        config: config.clone(),
        metrics: metrics.clone(),
        events,
        opt_in_index: opt_in_index.clone(),
        leader_cache: leader_cache.clone(),
        leader_name_index: leader_name_index.clone(),
    });

    let services: Api<Service> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let slices: Api<EndpointSlice> = Api::all(client.clone());

    tokio::spawn(sample_metrics_loop(client.clone(), metrics.clone(), opt_in_index.clone(), leader_cache.clone(), config.clone()));

    let watch_cfg = watcher::Config::default();

    Controller::new(services, watch_cfg.clone())
        .with_config(ControllerConfig::default().concurrency(config.max_concurrent_reconciles as u16))
        .watches(pods, watch_cfg.clone(), {
            let opt_in_index = opt_in_index.clone();
            let pod_filter = pod_filter.clone();
            let leader_cache = leader_cache.clone();
            let client = client.clone();
            let metrics = metrics.clone();
            let config = config.clone();
            move |pod: Pod| {
                if pod.metadata.deletion_timestamp.is_some() {
                    demux::handle_pod_deleted(&pod_filter, &leader_cache, &pod);
                }
                if !pod_filter.should_enqueue(&pod) {
                    return Vec::new();
                }
                // Opt-In Index namespace miss (spec §4.B): refresh from the
                // API outside the lock, then re-query, before this delivery
                // is translated into reconcile keys.
                if let Some(ns) = pod.metadata.namespace.as_deref() {
                    if !opt_in_index.has_namespace(ns) {
                        let client = client.clone();
                        let opt_in_index = opt_in_index.clone();
                        let metrics = metrics.clone();
                        let deadline = config.cache_refresh_deadline;
                        let max_size = config.max_cache_size_per_namespace;
                        let ns = ns.to_string();
                        tokio::task::block_in_place(|| {
                            tokio::runtime::Handle::current().block_on(async move {
                                opt_in_index
                                    .refresh_from_api(&client, &ns, deadline, max_size, &metrics)
                                    .await;
                            });
                        });
                    }
                }
                demux::map_pod_to_reconcile_keys(&opt_in_index, &pod)
                    .into_iter()
                    .map(|(ns, name)| ObjectRef::<Service>::new(&name).within(&ns))
                    .collect::<Vec<_>>()
            }
        })
        .watches(slices, watch_cfg, {
            let leader_name_index = leader_name_index.clone();
            move |slice: EndpointSlice| {
                demux::map_endpointslice_to_source(&slice, |ns, leader_name| leader_name_index.get(ns, leader_name))
                    .map(|(ns, name)| ObjectRef::<Service>::new(&name).within(&ns))
            }
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, _action)) => info!(name = %obj_ref.name, namespace = ?obj_ref.namespace, "reconciled"),
                Err(err) => error!(%err, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

/// Periodically refreshes the cluster-wide gauges named in spec §6.4
/// (`leader_services_total`, `endpointslices_total`, `cache_size`) that no
/// single reconcile call can observe on its own, under the 5s metrics-sample
/// deadline from spec §4.H.
async fn sample_metrics_loop(
    client: Client,
    metrics: Arc<Metrics>,
    opt_in_index: Arc<OptInIndex>,
    leader_cache: Arc<LeaderPodCache>,
    config: Config,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        ticker.tick().await;
        let sample = tokio::time::timeout(
            config.metrics_sample_deadline,
            sample_once(&client, &metrics),
        )
        .await;
        if sample.is_err() {
            metrics.timeout("cluster", "metrics_sample");
            warn!("metrics sample scan exceeded its deadline");
            continue;
        }
        if let Err(err) = sample.unwrap() {
            warn!(%err, "metrics sample scan failed");
        }
        for namespace in opt_in_index.namespaces() {
            metrics.set_cache_size(&namespace, opt_in_index.size(&namespace) as i64);
        }
        // The Leader-Pod Cache has no namespace boundary in its own storage;
        // report its total size under a synthetic "all" label rather than
        // misattributing it to one namespace.
        metrics.set_cache_size("all", leader_cache.len() as i64);
    }
}

async fn sample_once(client: &Client, metrics: &Metrics) -> kube::Result<()> {
    let selector = format!(
        "{}={}",
        crate::model::LABEL_MANAGED_BY,
        crate::model::LABEL_MANAGED_BY_VALUE
    );
    let services: Api<Service> = Api::all(client.clone());
    let leader_services = services
        .list(&kube::api::ListParams::default().labels(&selector))
        .await?;
    metrics.set_leader_services_total(leader_services.items.len() as i64);

    let slice_selector = format!(
        "{}={}",
        crate::model::LABEL_ENDPOINTSLICE_MANAGED_BY,
        crate::model::LABEL_MANAGED_BY_VALUE
    );
    let slices: Api<EndpointSlice> = Api::all(client.clone());
    let managed_slices = slices
        .list(&kube::api::ListParams::default().labels(&slice_selector))
        .await?;
    metrics.set_endpointslices_total(managed_slices.items.len() as i64);

    for svc in &leader_services.items {
        let has_endpoints = managed_slices.items.iter().any(|s| {
            s.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(crate::model::LABEL_ENDPOINTSLICE_SERVICE_NAME))
                == svc.metadata.name.as_ref()
                && !s.endpoints.is_empty()
        });
        if let (Some(ns), Some(source)) = (
            svc.metadata.namespace.as_deref(),
            svc.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(crate::model::LABEL_SOURCE_SERVICE)),
        ) {
            metrics.set_endpoints_empty(ns, source, !has_endpoints);
        }
    }

    Ok(())
}
