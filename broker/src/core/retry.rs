//! Bounded retry with exponential backoff for transport attempts.

use std::{
    future::Future,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use backoff::backoff::Backoff;
use tracing::debug;

use crate::{
    call::CallContext,
    error::{BrokerError, ErrorKind, TransportError},
};

/// Retry settings of one service.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `max_retries + 1` attempts in total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
    /// Upper bound for a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// delay = min(base_delay * backoff_multiplier^retry, max_delay), retry counted from 0
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }
}

/// Jitter-free backoff that stops after `max_retries` delays.
struct BoundedBackoff {
    policy: RetryPolicy,
    retries: u32,
}

impl BoundedBackoff {
    fn new(policy: RetryPolicy) -> Self {
        Self { policy, retries: 0 }
    }
}

impl Backoff for BoundedBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let delay = self.policy.delay_for(self.retries);
        self.retries += 1;
        Some(delay)
    }
}

/// Successful outcome together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Run `transport_call` until it succeeds, fails permanently or the policy
/// runs out of retries.
///
/// Each attempt is bounded by `policy.attempt_timeout`; a timeout counts as a
/// transient failure. Backoff delays are async sleeps, so other calls keep
/// running while this one waits.
pub async fn invoke_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    ctx: &CallContext,
    mut transport_call: F,
) -> Result<Attempted<T>, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let attempts = AtomicU32::new(0);
    let attempt_timeout = policy.attempt_timeout;

    let result = backoff::future::retry_notify(
        BoundedBackoff::new(*policy),
        || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let fut = transport_call();
            async move {
                let outcome = match tokio::time::timeout(attempt_timeout, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(TransportError::Timeout(attempt_timeout)),
                };
                match outcome {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_transient() => {
                        debug!(attempt, error = %e, "Transport attempt failed");
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "Transport attempt rejected, not retrying");
                        Err(backoff::Error::permanent(e))
                    }
                }
            }
        },
        |e: TransportError, delay: Duration| {
            debug!(
                correlation_id = %ctx.correlation_id,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Retrying {}.{}",
                ctx.service,
                ctx.tool
            );
        },
    )
    .await;

    let attempts = attempts.load(Ordering::Relaxed);
    match result {
        Ok(value) => Ok(Attempted { value, attempts }),
        // A transient error only surfaces once the backoff is spent.
        Err(e) if e.is_transient() => Err(ctx.error(ErrorKind::RetriesExhausted {
            attempts,
            last: Box::new(e.into()),
        })),
        Err(e) => Err(ctx.error(e)),
    }
}
