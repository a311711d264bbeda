//! Jittered exponential backoff shared by every remote call.

use crate::attempt::StageCounter;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// How a failed call should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the policy's computed delay.
    Retry,
    /// Retry after a server-provided delay (capped at `max_delay`).
    RetryAfter(Duration),
    /// Stop immediately.
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Total attempts including the first call. Always at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the uniform random delay added to each backoff.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    /// Same attempt budget, no waiting. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `retry` (1-based), with jitter.
    pub fn delay_for<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        self.backoff(retry) + jitter
    }
}

/// Server-provided wait: a `Retry-After` header value in seconds, else a
/// "retry after N seconds" style hint in the response body.
pub fn parse_retry_after(header: Option<&str>, body: &str) -> Option<Duration> {
    if let Some(secs) = header.and_then(|h| h.trim().parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    let lower = body.to_lowercase();
    let pos = lower.find("retry")?;
    lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_ascii_digit())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
        .map(Duration::from_secs)
}

/// Run `op` under `policy`, recording every call and retry in `counter`.
///
/// `op` receives the 1-based attempt number. The last error is returned once
/// the budget is spent or `classify` says the error is fatal.
pub async fn retry<T, E, Op, Fut, C>(
    policy: &BackoffPolicy,
    counter: &mut StageCounter,
    operation: &str,
    classify: C,
    mut op: Op,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDecision,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        counter.calls += 1;
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let decision = classify(&err);
        if decision == RetryDecision::Fatal {
            tracing::debug!(operation, attempt, error = %err, "fatal error; not retrying");
            return Err(err);
        }
        if attempt >= attempts {
            tracing::debug!(operation, attempt, error = %err, "retry budget exhausted");
            return Err(err);
        }

        let delay = match decision {
            RetryDecision::RetryAfter(hint) => hint.min(policy.max_delay),
            _ => {
                let mut rng = rand::thread_rng();
                policy.delay_for(attempt, &mut rng)
            }
        };
        tracing::warn!(
            operation,
            attempt,
            max_attempts = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );
        counter.retries += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        attempt += 1;
    }
}
