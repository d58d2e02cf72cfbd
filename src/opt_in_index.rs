//! Opt-In Index (spec §4.B): a per-namespace, process-local map from pod
//! labels to the source Services whose selector matches them, used only to
//! translate Pod watch events into reconcile keys. It is never consulted to
//! decide reconciler behaviour — G always re-reads authoritative state.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::warn;

use crate::metrics::Metrics;
use crate::model::SourceService;

/// One opted-in source Service as far as the index cares.
#[derive(Debug, Clone)]
pub struct OptInEntry {
    pub name: String,
    pub match_labels: BTreeMap<String, String>,
}

impl OptInEntry {
    pub fn from_selector(name: String, selector: &LabelSelector) -> Self {
        Self {
            name,
            match_labels: selector.match_labels.clone().unwrap_or_default(),
        }
    }

    fn matches(&self, pod_labels: &BTreeMap<String, String>) -> bool {
        !self.match_labels.is_empty()
            && self
                .match_labels
                .iter()
                .all(|(k, v)| pod_labels.get(k) == Some(v))
    }
}

type NamespaceSnapshot = Arc<Vec<OptInEntry>>;

/// Readers-writer discipline per spec §4.B / §5: many readers, rare writers,
/// writers never hold the lock across an API call — every write here
/// constructs a fresh `Vec` and swaps it in, so readers never observe a
/// partially-updated entry set.
#[derive(Default)]
pub struct OptInIndex {
    namespaces: RwLock<BTreeMap<String, NamespaceSnapshot>>,
}

impl OptInIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` on a namespace miss — the caller must `refresh` and
    /// re-query (spec §4.B).
    pub fn lookup(&self, namespace: &str, pod_labels: &BTreeMap<String, String>) -> Option<Vec<String>> {
        let guard = self.namespaces.read().expect("opt-in index lock poisoned");
        let snapshot = guard.get(namespace)?.clone();
        drop(guard);
        Some(
            snapshot
                .iter()
                .filter(|e| e.matches(pod_labels))
                .map(|e| e.name.clone())
                .collect(),
        )
    }

    /// Replaces a namespace's entry set atomically, evicting deterministically
    /// (lexicographic on service name, spec §9) down to `max_size` if needed.
    pub fn refresh(&self, namespace: &str, mut entries: Vec<OptInEntry>, max_size: usize) {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.truncate(max_size);
        let snapshot = Arc::new(entries);
        let mut guard = self.namespaces.write().expect("opt-in index lock poisoned");
        guard.insert(namespace.to_string(), snapshot);
    }

    /// Refresh(namespace) (spec §4.B): lists all Services in `namespace` via
    /// the API, retains those carrying the opt-in annotation, and replaces
    /// the namespace entry atomically. Wrapped in the cache-refresh scoped
    /// deadline; on timeout or a list error the previous contents are
    /// preserved, matching the "stale index is still correct" failure mode
    /// (spec §4.B, §4.H).
    pub async fn refresh_from_api(
        &self,
        client: &Client,
        namespace: &str,
        deadline: Duration,
        max_size: usize,
        metrics: &Metrics,
    ) {
        let start = Instant::now();
        let services: Api<Service> = Api::namespaced(client.clone(), namespace);
        match tokio::time::timeout(deadline, services.list(&ListParams::default())).await {
            Err(_) => {
                metrics.timeout(namespace, "cache_refresh");
                warn!(namespace, "opt-in index refresh exceeded its deadline, retaining stale entries");
            }
            Ok(Err(err)) => {
                warn!(namespace, %err, "opt-in index refresh failed, retaining stale entries");
            }
            Ok(Ok(list)) => {
                let entries: Vec<OptInEntry> = list
                    .items
                    .iter()
                    .filter_map(|svc| {
                        let source = SourceService::from_service(svc)?;
                        if !source.is_opted_in() {
                            return None;
                        }
                        let selector = source.selector.as_ref()?;
                        Some(OptInEntry::from_selector(source.name.clone(), selector))
                    })
                    .collect();
                self.refresh(namespace, entries, max_size);
                metrics.observe_cache_update(namespace, start.elapsed().as_secs_f64());
            }
        }
    }

    /// Fast-path update on a single Service upsert; builds a new slice rather
    /// than mutating in place, to avoid aliasing with concurrent readers.
    pub fn upsert(&self, namespace: &str, entry: OptInEntry, max_size: usize) {
        let mut guard = self.namespaces.write().expect("opt-in index lock poisoned");
        let mut entries: Vec<OptInEntry> = guard
            .get(namespace)
            .map(|s| s.as_ref().clone())
            .unwrap_or_default();
        entries.retain(|e| e.name != entry.name);
        entries.push(entry);
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries.truncate(max_size);
        guard.insert(namespace.to_string(), Arc::new(entries));
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        let mut guard = self.namespaces.write().expect("opt-in index lock poisoned");
        if let Some(snapshot) = guard.get(namespace) {
            let entries: Vec<OptInEntry> = snapshot
                .iter()
                .filter(|e| e.name != name)
                .cloned()
                .collect();
            guard.insert(namespace.to_string(), Arc::new(entries));
        }
    }

    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.namespaces
            .read()
            .expect("opt-in index lock poisoned")
            .contains_key(namespace)
    }

    pub fn size(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .expect("opt-in index lock poisoned")
            .get(namespace)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Namespaces the index currently has an entry set for, used only to
    /// drive the `zen_lead_cache_size` gauge sample (spec §6.4).
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces
            .read()
            .expect("opt-in index lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn entry(name: &str, pairs: &[(&str, &str)]) -> OptInEntry {
        OptInEntry {
            name: name.to_string(),
            match_labels: labels(pairs),
        }
    }

    #[test]
    fn miss_on_unknown_namespace() {
        let idx = OptInIndex::new();
        assert!(idx.lookup("ns", &labels(&[("app", "api")])).is_none());
    }

    #[test]
    fn refresh_then_lookup_matches_selector() {
        let idx = OptInIndex::new();
        idx.refresh(
            "ns",
            vec![entry("svc-a", &[("app", "api")]), entry("svc-b", &[("app", "web")])],
            500,
        );
        let hits = idx.lookup("ns", &labels(&[("app", "api")])).unwrap();
        assert_eq!(hits, vec!["svc-a".to_string()]);
    }

    #[test]
    fn eviction_is_deterministic_lexicographic() {
        let idx = OptInIndex::new();
        idx.refresh(
            "ns",
            vec![entry("c", &[("app", "x")]), entry("a", &[("app", "x")]), entry("b", &[("app", "x")])],
            2,
        );
        assert_eq!(idx.size("ns"), 2);
        let hits = idx.lookup("ns", &labels(&[("app", "x")])).unwrap();
        assert_eq!(hits, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn upsert_replaces_existing_entry_without_duplication() {
        let idx = OptInIndex::new();
        idx.refresh("ns", vec![entry("svc-a", &[("app", "api")])], 500);
        idx.upsert("ns", entry("svc-a", &[("app", "v2")]), 500);
        assert_eq!(idx.size("ns"), 1);
        assert!(idx.lookup("ns", &labels(&[("app", "v2")])).unwrap().contains(&"svc-a".to_string()));
        assert!(idx.lookup("ns", &labels(&[("app", "api")])).unwrap().is_empty());
    }

    #[test]
    fn remove_drops_entry() {
        let idx = OptInIndex::new();
        idx.refresh("ns", vec![entry("svc-a", &[("app", "api")])], 500);
        idx.remove("ns", "svc-a");
        assert_eq!(idx.size("ns"), 0);
    }

    #[test]
    fn empty_selector_never_matches() {
        let idx = OptInIndex::new();
        idx.refresh("ns", vec![entry("svc-a", &[])], 500);
        assert!(idx.lookup("ns", &labels(&[("app", "api")])).unwrap().is_empty());
    }
}
