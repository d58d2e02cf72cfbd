//! Environment-driven tuning knobs (spec §2 row H, §4.H, §5). There is no CRD
//! or config file; everything here is a process-wide default that per-Service
//! annotations (spec §6.1) may further override at reconcile time.

use std::time::Duration;

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| humantime::parse_duration(&v).ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Upper bound on distinct reconcile keys in flight at once (spec §4.D, §5).
    pub max_concurrent_reconciles: usize,
    /// Per-namespace opt-in index size ceiling (spec §4.B).
    pub max_cache_size_per_namespace: usize,
    /// TTL of a Leader-Pod Cache entry (spec §4.C).
    pub leader_pod_cache_ttl: Duration,
    /// Scoped deadline wrapping an Opt-In Index namespace refresh (spec §4.H).
    pub cache_refresh_deadline: Duration,
    /// Scoped deadline wrapping a metrics-sample scan (spec §4.H).
    pub metrics_sample_deadline: Duration,
    pub standard_retry: RetryConfig,
    pub fast_retry: RetryConfig,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            max_concurrent_reconciles: env_usize("ZEN_LEAD_MAX_CONCURRENT_RECONCILES", 10),
            max_cache_size_per_namespace: env_usize("ZEN_LEAD_MAX_CACHE_SIZE_PER_NAMESPACE", 500),
            leader_pod_cache_ttl: env_duration("ZEN_LEAD_LEADER_POD_CACHE_TTL", Duration::from_secs(30)),
            cache_refresh_deadline: env_duration("ZEN_LEAD_CACHE_REFRESH_DEADLINE", Duration::from_secs(10)),
            metrics_sample_deadline: env_duration("ZEN_LEAD_METRICS_SAMPLE_DEADLINE", Duration::from_secs(5)),
            standard_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
            },
            fast_retry: RetryConfig {
                max_attempts: 2,
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(500),
                multiplier: 2.0,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_profiles() {
        let cfg = Config::from_env();
        assert_eq!(cfg.standard_retry.max_attempts, 3);
        assert_eq!(cfg.standard_retry.initial_delay, Duration::from_millis(100));
        assert_eq!(cfg.fast_retry.max_attempts, 2);
        assert_eq!(cfg.fast_retry.initial_delay, Duration::from_millis(20));
        assert_eq!(cfg.max_concurrent_reconciles, 10);
    }
}
