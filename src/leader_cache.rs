//! Leader-Pod Cache (spec §4.C): a bounded TTL cache keyed by
//! `(namespace, sourceServiceName)` recording the currently-selected leader
//! pod identity. It is a latency optimisation only — the EndpointSlice
//! remains the source of truth (spec §9) and every entry must tolerate being
//! stale or missing.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::model::LeaderIdentity;

pub type CacheKey = (String, String);

#[derive(Debug, Clone)]
struct CacheEntry {
    identity: LeaderIdentity,
    expires_at: Instant,
}

#[derive(Default)]
pub struct LeaderPodCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl LeaderPodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` on a miss or an expired entry. Does not touch the API
    /// server and never resurrects an invalidated entry.
    pub fn get(&self, key: &CacheKey, now: Instant) -> Option<LeaderIdentity> {
        let guard = self.entries.read().expect("leader cache lock poisoned");
        guard.get(key).and_then(|e| {
            if e.expires_at > now {
                Some(e.identity.clone())
            } else {
                None
            }
        })
    }

    pub fn put(&self, key: CacheKey, identity: LeaderIdentity, now: Instant, ttl: Duration) {
        let mut guard = self.entries.write().expect("leader cache lock poisoned");
        guard.insert(
            key,
            CacheEntry {
                identity,
                expires_at: now + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &CacheKey) {
        let mut guard = self.entries.write().expect("leader cache lock poisoned");
        guard.remove(key);
    }

    /// Invalidates every entry whose recorded pod UID matches a deleted pod,
    /// regardless of which source Service it belongs to (spec §4.D.2).
    pub fn invalidate_by_pod_uid(&self, pod_uid: &str) {
        let mut guard = self.entries.write().expect("leader cache lock poisoned");
        guard.retain(|_, e| e.identity.pod_uid != pod_uid);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("leader cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
