//! Retry/timing policy (spec §4.H). Two profiles — standard and fast — wrap
//! individual API operations with bounded, jittered exponential backoff.
//! Only the final failure of a retry loop surfaces to the caller; successful
//! retries are invisible except through the `*_retry_attempts_total` and
//! `*_retry_success_after_retry_total` metrics.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::Error;
use crate::metrics::Metrics;

/// Which timing profile a retried operation uses (spec §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryProfile {
    Standard,
    Fast,
}

/// Transient API errors are retried; anything else is returned immediately.
/// Conflicts on write are treated as transient per spec §7 — the next
/// reconcile will reconverge regardless, but retrying inside the same
/// attempt reduces needless queue churn.
pub fn is_transient(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            matches!(resp.code, 409 | 429 | 500 | 502 | 503 | 504)
        }
        kube::Error::Service(_) => true,
        _ => false,
    }
}

fn delay_for_attempt(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg.multiplier.powi(attempt as i32 - 1);
    let raw = (cfg.initial_delay.as_secs_f64() * exp).min(cfg.max_delay.as_secs_f64());
    let jitter = rand::thread_rng().gen_range(0.5..1.0);
    Duration::from_secs_f64(raw * jitter)
}

/// Runs `op` under the named retry profile, recording attempt/success
/// metrics. `op` is retried only on [`is_transient`] `kube::Error`s wrapped
/// in [`Error::Kube`]; any other error (validation, timeout) returns
/// immediately without consuming an attempt.
pub async fn retry<T, F, Fut>(
    profile: RetryProfile,
    cfg: &RetryConfig,
    metrics: &Metrics,
    namespace: &str,
    service: &str,
    operation: &'static str,
    mut op: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        metrics.retry_attempt(namespace, service, operation, attempt);
        match op().await {
            Ok(v) => {
                if attempt > 1 {
                    metrics.retry_success_after_retry();
                    debug!(namespace, service, operation, attempt, "retry succeeded");
                }
                return Ok(v);
            }
            Err(Error::Kube(kube_err)) if is_transient(&kube_err) && attempt < cfg.max_attempts => {
                let delay = delay_for_attempt(cfg, attempt);
                warn!(
                    namespace,
                    service,
                    operation,
                    attempt,
                    ?profile,
                    delay_ms = delay.as_millis() as u64,
                    error = %kube_err,
                    "retrying transient error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(Error::Kube(kube_err)) if attempt >= cfg.max_attempts => {
                return Err(Error::Kube(kube_err));
            }
            Err(other) => return Err(other),
        }
    }
}
