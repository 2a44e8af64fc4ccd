//! Retry/timeout/jitter policies for outbound I/O.
//!
//! Every integration carries two policies: one for establishing connections,
//! one for individual operations.  The [`retry`] combinator wraps an attempt
//! factory, bounds each attempt by the policy timeout, sleeps the computed
//! backoff between attempts, and gives up after `max_retries + 1` attempts or
//! on the first non-transient error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Constant,
    Linear,
    Exponential,
}

impl std::str::FromStr for Backoff {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff type '{other}' (constant, linear, exponential)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    pub use_jitter: bool,
    /// Jitter amplitude in percent: each delay is multiplied by
    /// `1 ± U(0, jitter_percentage / 100)`.
    pub jitter_percentage: u8,
    pub timeout_seconds: u64,
}

impl Policy {
    /// Default connection policy: 3 retries, 2 s initial delay, exponential
    /// backoff with 25 % jitter.
    pub fn connection_default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 2000,
            backoff: Backoff::Exponential,
            use_jitter: true,
            jitter_percentage: 25,
            timeout_seconds: 10,
        }
    }

    /// Default operation policy: 2 retries, 200 ms initial delay.
    pub fn operation_default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 200,
            backoff: Backoff::Exponential,
            use_jitter: true,
            jitter_percentage: 25,
            timeout_seconds: 5,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Base delay before attempt `attempt + 1` (so `attempt` starts at 1 for
    /// the delay after the first failure).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        let ms = match self.backoff {
            Backoff::Constant => base,
            Backoff::Linear => base.saturating_mul(u64::from(attempt)),
            Backoff::Exponential => base.saturating_mul(1u64 << (attempt - 1).min(20)),
        };
        Duration::from_millis(ms)
    }

    /// Base delay with jitter applied.  Never negative.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.use_jitter || self.jitter_percentage == 0 {
            return base;
        }
        let amplitude = f64::from(self.jitter_percentage) / 100.0;
        let factor = 1.0 + rand::thread_rng().gen_range(-amplitude..=amplitude);
        base.mul_f64(factor.max(0.0))
    }
}

/// Connection + operation policy pair carried by every service config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServicePolicies {
    pub connection: Policy,
    pub operation: Policy,
}

impl Default for ServicePolicies {
    fn default() -> Self {
        Self {
            connection: Policy::connection_default(),
            operation: Policy::operation_default(),
        }
    }
}

/// Run `op` under `policy`.  The factory receives the 1-based attempt number
/// and is invoked at most `max_retries + 1` times; each invocation is bounded
/// by the policy timeout.  Cancellation wins over everything and surfaces as
/// [`Error::Cancelled`].
pub async fn retry<T, F, Fut>(
    label: &str,
    policy: &Policy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut last_err = Error::internal(format!("{label}: retry loop made no attempt"));

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bounded = tokio::time::timeout(policy.attempt_timeout(), op(attempt));
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            outcome = bounded => outcome,
        };

        match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
            Ok(Err(e)) if !e.is_transient() => return Err(e),
            Ok(Err(e)) => {
                debug!("{label}: attempt {attempt}/{attempts} failed: {e}");
                last_err = e;
            }
            Err(_) => {
                debug!(
                    "{label}: attempt {attempt}/{attempts} timed out after {}s",
                    policy.timeout_seconds
                );
                last_err = Error::timeout(format!("{label} attempt {attempt}"));
            }
        }

        if attempt < attempts {
            let delay = policy.delay(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    warn!("{label}: giving up after {attempts} attempts: {last_err}");
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn no_jitter(max_retries: u32, delay_ms: u64, backoff: Backoff) -> Policy {
        Policy {
            max_retries,
            retry_delay_ms: delay_ms,
            backoff,
            use_jitter: false,
            jitter_percentage: 0,
            timeout_seconds: 1,
        }
    }

    #[test]
    fn backoff_progression() {
        let exp = no_jitter(3, 200, Backoff::Exponential);
        assert_eq!(exp.base_delay(1), Duration::from_millis(200));
        assert_eq!(exp.base_delay(2), Duration::from_millis(400));
        assert_eq!(exp.base_delay(3), Duration::from_millis(800));

        let lin = no_jitter(3, 100, Backoff::Linear);
        assert_eq!(lin.base_delay(3), Duration::from_millis(300));

        let cst = no_jitter(3, 150, Backoff::Constant);
        assert_eq!(cst.base_delay(5), Duration::from_millis(150));
    }

    #[test]
    fn jitter_stays_in_band_and_non_negative() {
        let mut p = no_jitter(1, 1000, Backoff::Constant);
        p.use_jitter = true;
        p.jitter_percentage = 25;
        for _ in 0..500 {
            let d = p.delay(1);
            assert!(d >= Duration::from_millis(750), "{d:?}");
            assert!(d <= Duration::from_millis(1250), "{d:?}");
        }
        p.jitter_percentage = 100;
        for _ in 0..500 {
            assert!(p.delay(1) <= Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn invokes_at_most_max_retries_plus_one() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let policy = no_jitter(2, 10, Backoff::Exponential);

        let calls2 = calls.clone();
        let result: Result<()> = retry("test", &policy, &cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport("boom"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_later_attempt() {
        let cancel = CancellationToken::new();
        let policy = no_jitter(3, 10, Backoff::Constant);
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result = retry("test", &policy, &cancel, move |attempt| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(Error::transport("flaky"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_short_circuit() {
        let cancel = CancellationToken::new();
        let policy = no_jitter(5, 10, Backoff::Constant);
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<()> = retry("test", &policy, &cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_found("zone 7"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_delays_accumulate_between_attempts() {
        // 2 retries at 200 ms exponential: delays of 200 ms and 400 ms
        let cancel = CancellationToken::new();
        let policy = no_jitter(2, 200, Backoff::Exponential);

        let started = tokio::time::Instant::now();
        let result: Result<()> = retry("test", &policy, &cancel, |_| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(Error::transport("gateway unreachable"))
        })
        .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        // 3 × 100 ms attempts + 600 ms of backoff
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let policy = no_jitter(5, 10, Backoff::Constant);

        let result: Result<()> =
            retry("test", &policy, &cancel, |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_counts_as_transient() {
        let cancel = CancellationToken::new();
        let policy = no_jitter(1, 10, Backoff::Constant);
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let result: Result<()> = retry("test", &policy, &cancel, move |_| {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
