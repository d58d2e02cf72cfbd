//! Port Resolver (spec §4.E). Maps each source Service port to a numeric
//! endpoint port using the leader pod's declared container ports. Fails
//! closed: an unresolved named port is dropped, never silently rerouted to
//! the Service's own `port`.

use crate::model::{CandidatePod, SourcePort, TargetPort};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPort {
    pub name: Option<String>,
    pub port: i32,
    pub protocol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortResolution {
    pub resolved: Vec<ResolvedPort>,
    /// Names (or `"<unnamed>"`) of service ports that failed to resolve.
    pub failed: Vec<String>,
}

impl PortResolution {
    /// Per spec §4.E: if every declared port is unresolved, the caller must
    /// render an empty endpoint set rather than a partially-wired one.
    pub fn all_failed(&self) -> bool {
        self.resolved.is_empty() && !self.failed.is_empty()
    }
}

/// Resolves every port of `ports` against `pod`'s declared container ports,
/// searched in container order. Numeric `targetPort`s pass through
/// unchanged and never fail.
pub fn resolve_ports(ports: &[SourcePort], pod: &CandidatePod) -> PortResolution {
    let mut resolution = PortResolution::default();
    for sp in ports {
        match &sp.target_port {
            TargetPort::Number(n) => resolution.resolved.push(ResolvedPort {
                name: sp.name.clone(),
                port: *n,
                protocol: sp.protocol.clone(),
            }),
            TargetPort::Name(target_name) => {
                let found = pod
                    .container_ports
                    .iter()
                    .find(|cp| cp.name.as_deref() == Some(target_name.as_str()));
                match found {
                    Some(cp) => resolution.resolved.push(ResolvedPort {
                        name: sp.name.clone(),
                        port: cp.container_port,
                        protocol: sp.protocol.clone(),
                    }),
                    None => resolution
                        .failed
                        .push(sp.name.clone().unwrap_or_else(|| "<unnamed>".to_string())),
                }
            }
        }
    }
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ContainerPortView;
    use chrono::Utc;

    fn pod_with_ports(ports: Vec<(&str, i32)>) -> CandidatePod {
        CandidatePod {
            name: "p1".into(),
            uid: "u1".into(),
            namespace: "ns".into(),
            ready: true,
            terminating: false,
            deletion_timestamp: None,
            pod_ip: "10.0.0.1".into(),
            ready_since: Some(Utc::now()),
            creation_timestamp: Utc::now(),
            container_ports: ports
                .into_iter()
                .map(|(n, p)| ContainerPortView {
                    name: Some(n.to_string()),
                    container_port: p,
                    protocol: "TCP".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn numeric_target_port_passes_through() {
        let ports = vec![SourcePort {
            name: Some("http".into()),
            port: 80,
            target_port: TargetPort::Number(8080),
            protocol: "TCP".into(),
        }];
        let pod = pod_with_ports(vec![]);
        let res = resolve_ports(&ports, &pod);
        assert_eq!(res.resolved, vec![ResolvedPort { name: Some("http".into()), port: 8080, protocol: "TCP".into() }]);
        assert!(res.failed.is_empty());
    }

    #[test]
    fn named_target_port_resolves_by_container_port_name() {
        let ports = vec![SourcePort {
            name: Some("http".into()),
            port: 80,
            target_port: TargetPort::Name("http".into()),
            protocol: "TCP".into(),
        }];
        let pod = pod_with_ports(vec![("http", 8080)]);
        let res = resolve_ports(&ports, &pod);
        assert_eq!(res.resolved[0].port, 8080);
        assert!(res.failed.is_empty());
    }

    #[test]
    fn s5_unresolved_named_port_fails_closed() {
        let ports = vec![SourcePort {
            name: Some("http".into()),
            port: 80,
            target_port: TargetPort::Name("nonexistent".into()),
            protocol: "TCP".into(),
        }];
        let pod = pod_with_ports(vec![("http", 8080)]);
        let res = resolve_ports(&ports, &pod);
        assert!(res.resolved.is_empty());
        assert_eq!(res.failed, vec!["http".to_string()]);
        assert!(res.all_failed());
    }

    #[test]
    fn partial_resolution_keeps_resolved_subset() {
        let ports = vec![
            SourcePort { name: Some("http".into()), port: 80, target_port: TargetPort::Name("http".into()), protocol: "TCP".into() },
            SourcePort { name: Some("admin".into()), port: 9090, target_port: TargetPort::Name("missing".into()), protocol: "TCP".into() },
        ];
        let pod = pod_with_ports(vec![("http", 8080)]);
        let res = resolve_ports(&ports, &pod);
        assert_eq!(res.resolved.len(), 1);
        assert_eq!(res.failed, vec!["admin".to_string()]);
        assert!(!res.all_failed());
    }

    #[test]
    fn resolution_is_deterministic_across_calls() {
        let ports = vec![SourcePort { name: Some("http".into()), port: 80, target_port: TargetPort::Name("http".into()), protocol: "TCP".into() }];
        let pod = pod_with_ports(vec![("http", 8080)]);
        assert_eq!(resolve_ports(&ports, &pod), resolve_ports(&ports, &pod));
    }
}
