//! Leader Selector (spec §4.F): a pure function from candidate pods and the
//! previous leader identity to the new leader. No randomness, no I/O — two
//! controller replicas evaluating the same inputs must agree.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::{CandidatePod, LeaderIdentity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    NoLeader,
    Leader { pod: CandidatePod, sticky_hit: bool },
}

fn eligible(pod: &CandidatePod, now: DateTime<Utc>, min_ready_duration: Duration) -> bool {
    if !pod.ready || pod.terminating || pod.pod_ip.is_empty() {
        return false;
    }
    match pod.ready_since {
        Some(since) => {
            let dwell = now.signed_duration_since(since);
            dwell >= chrono::Duration::from_std(min_ready_duration).unwrap_or(chrono::Duration::zero())
        }
        // No recorded PodReady transition time but currently Ready: treat as
        // having dwelled since always, matching the "no dwell requirement" default.
        None => min_ready_duration.is_zero(),
    }
}

/// Selects the leader per spec §4.F: sticky retention first, then a
/// deterministic `(readySince, creationTimestamp, name)` sort.
pub fn select_leader(
    candidates: &[CandidatePod],
    previous: Option<&LeaderIdentity>,
    sticky: bool,
    now: DateTime<Utc>,
    min_ready_duration: Duration,
) -> Selection {
    let mut eligible_pods: Vec<&CandidatePod> = candidates
        .iter()
        .filter(|p| eligible(p, now, min_ready_duration))
        .collect();

    if eligible_pods.is_empty() {
        return Selection::NoLeader;
    }

    if sticky {
        if let Some(prev) = previous {
            if let Some(pod) = eligible_pods.iter().find(|p| p.uid == prev.pod_uid) {
                return Selection::Leader {
                    pod: (*pod).clone(),
                    sticky_hit: true,
                };
            }
        }
    }

    eligible_pods.sort_by(|a, b| {
        let a_ready = a.ready_since.unwrap_or(a.creation_timestamp);
        let b_ready = b.ready_since.unwrap_or(b.creation_timestamp);
        a_ready
            .cmp(&b_ready)
            .then(a.creation_timestamp.cmp(&b.creation_timestamp))
            .then(a.name.cmp(&b.name))
    });

    Selection::Leader {
        pod: eligible_pods[0].clone(),
        sticky_hit: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn pod(name: &str, uid: &str, ready: bool, ready_since_min: i64, created_min: i64) -> CandidatePod {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        CandidatePod {
            name: name.to_string(),
            uid: uid.to_string(),
            namespace: "ns".to_string(),
            ready,
            terminating: false,
            deletion_timestamp: None,
            pod_ip: "10.0.0.1".to_string(),
            ready_since: Some(base + chrono::Duration::minutes(ready_since_min)),
            creation_timestamp: base + chrono::Duration::minutes(created_min),
            container_ports: vec![],
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 11, 0, 0).unwrap()
    }

    #[test]
    fn s1_initial_election_picks_earliest_ready_since() {
        let pods = vec![pod("p1", "u1", true, 0, 0), pod("p2", "u2", true, 1, 1), pod("p3", "u3", true, 2, 2)];
        let sel = select_leader(&pods, None, true, now(), Duration::ZERO);
        match sel {
            Selection::Leader { pod, sticky_hit } => {
                assert_eq!(pod.name, "p1");
                assert!(!sticky_hit);
            }
            Selection::NoLeader => panic!("expected a leader"),
        }
    }

    #[test]
    fn s2_sticky_hold_keeps_previous_leader_despite_newer_ready_since() {
        let pods = vec![pod("p1", "u1", true, 0, 0), pod("p2", "u2", true, -5, 1)];
        let prev = LeaderIdentity { pod_name: "p1".into(), pod_uid: "u1".into() };
        let sel = select_leader(&pods, Some(&prev), true, now(), Duration::ZERO);
        match sel {
            Selection::Leader { pod, sticky_hit } => {
                assert_eq!(pod.name, "p1");
                assert!(sticky_hit);
            }
            Selection::NoLeader => panic!("expected a leader"),
        }
    }

    #[test]
    fn s3_failover_on_not_ready_falls_back_deterministically() {
        let mut pods = vec![pod("p1", "u1", false, 0, 0), pod("p2", "u2", true, 1, 1), pod("p3", "u3", true, 2, 2)];
        pods[0].terminating = false;
        let prev = LeaderIdentity { pod_name: "p1".into(), pod_uid: "u1".into() };
        let sel = select_leader(&pods, Some(&prev), true, now(), Duration::ZERO);
        match sel {
            Selection::Leader { pod, sticky_hit } => {
                assert_eq!(pod.name, "p2");
                assert!(!sticky_hit);
            }
            Selection::NoLeader => panic!("expected a leader"),
        }
    }

    #[test]
    fn s4_drain_to_empty_yields_no_leader() {
        let pods = vec![pod("p1", "u1", false, 0, 0), pod("p2", "u2", false, 1, 1)];
        let prev = LeaderIdentity { pod_name: "p1".into(), pod_uid: "u1".into() };
        let sel = select_leader(&pods, Some(&prev), true, now(), Duration::ZERO);
        assert_eq!(sel, Selection::NoLeader);
    }

    #[test]
    fn sticky_is_ignored_if_previous_leader_uid_no_longer_present() {
        let pods = vec![pod("p2", "u2", true, 1, 1)];
        let prev = LeaderIdentity { pod_name: "p1".into(), pod_uid: "u1".into() };
        let sel = select_leader(&pods, Some(&prev), true, now(), Duration::ZERO);
        match sel {
            Selection::Leader { pod, sticky_hit } => {
                assert_eq!(pod.name, "p2");
                assert!(!sticky_hit);
            }
            Selection::NoLeader => panic!("expected a leader"),
        }
    }

    #[test]
    fn min_ready_duration_dwell_excludes_recently_ready_pods() {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let mut fresh = pod("p1", "u1", true, 59, 0);
        fresh.ready_since = Some(base + chrono::Duration::minutes(59));
        let sel = select_leader(&[fresh], None, true, now(), Duration::from_secs(120));
        assert_eq!(sel, Selection::NoLeader);
    }

    #[test]
    fn terminating_pod_is_never_eligible_even_if_ready() {
        let mut p = pod("p1", "u1", true, 0, 0);
        p.terminating = true;
        let sel = select_leader(&[p], None, true, now(), Duration::ZERO);
        assert_eq!(sel, Selection::NoLeader);
    }

    #[test]
    fn pod_without_ip_is_never_eligible() {
        let mut p = pod("p1", "u1", true, 0, 0);
        p.pod_ip = String::new();
        let sel = select_leader(&[p], None, true, now(), Duration::ZERO);
        assert_eq!(sel, Selection::NoLeader);
    }

    #[test]
    fn non_sticky_always_uses_deterministic_fallback() {
        let pods = vec![pod("p1", "u1", true, 0, 0), pod("p2", "u2", true, -5, 1)];
        let prev = LeaderIdentity { pod_name: "p1".into(), pod_uid: "u1".into() };
        let sel = select_leader(&pods, Some(&prev), false, now(), Duration::ZERO);
        match sel {
            Selection::Leader { pod, sticky_hit } => {
                assert_eq!(pod.name, "p2");
                assert!(!sticky_hit);
            }
            Selection::NoLeader => panic!("expected a leader"),
        }
    }
}
