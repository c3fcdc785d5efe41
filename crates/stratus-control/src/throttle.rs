//! Pacing and retry-on-throttle for outbound control plane calls.
//!
//! Every call to the control plane goes through a [`ThrottleGuard`]. The guard
//! enforces a minimum interval between the starts of consecutive calls and
//! retries calls the control plane rejected with a throttling response, using
//! bounded exponential backoff. Any other error is returned immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ThrottleConfig;
use crate::error::{ControlError, ControlResult};

/// Attempt bound and backoff schedule for throttled calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first attempt included.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single backoff.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
            max_backoff,
        }
    }

    /// Delay before retry number `retry` (0-indexed): `initial * 2^retry`, capped.
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.initial_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    /// Default: 5 attempts, 500ms initial backoff, 10s cap.
    fn default() -> Self {
        Self::from(&ThrottleConfig::default())
    }
}

impl From<&ThrottleConfig> for RetryPolicy {
    fn from(config: &ThrottleConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Wraps control plane calls with pacing and retry-on-throttle.
#[derive(Debug)]
pub struct ThrottleGuard {
    min_interval_ms: AtomicU64,
    policy: RetryPolicy,
    last_call: Mutex<Option<Instant>>,
}

impl ThrottleGuard {
    /// Create a guard from configuration.
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self::with_policy(config.min_interval(), RetryPolicy::from(config))
    }

    /// Create a guard with explicit settings.
    #[must_use]
    pub fn with_policy(min_interval: Duration, policy: RetryPolicy) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(duration_millis(min_interval)),
            policy,
            last_call: Mutex::new(None),
        }
    }

    /// A guard that neither paces nor waits long between retries.
    #[must_use]
    pub fn unthrottled() -> Self {
        Self::with_policy(Duration::ZERO, RetryPolicy::default())
    }

    /// Current minimum interval between calls.
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the minimum interval; applies from the next call on.
    pub fn set_min_interval(&self, interval: Duration) {
        self.min_interval_ms
            .store(duration_millis(interval), Ordering::Relaxed);
    }

    /// Retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `call`, pacing it and retrying throttling rejections.
    ///
    /// `call` is invoked once per attempt. Only [`ControlError::Throttled`] is
    /// retried; once `max_attempts` attempts were throttled the call fails with
    /// [`ControlError::ThrottlingExhausted`].
    pub async fn call<T, F, Fut>(&self, operation: &str, mut call: F) -> ControlResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ControlResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            self.pace().await;
            attempt += 1;

            match call().await {
                Err(e) if e.is_throttling() => {
                    if attempt >= self.policy.max_attempts {
                        warn!(operation, attempts = attempt, "giving up on throttled request");
                        return Err(ControlError::ThrottlingExhausted {
                            operation: operation.to_owned(),
                            attempts: attempt,
                        });
                    }
                    let delay = self.policy.backoff(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = duration_millis(delay),
                        "request throttled, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    /// Block until the minimum interval since the previous call has elapsed.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        let interval = self.min_interval();
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let remaining = interval - elapsed;
                debug!(wait_ms = duration_millis(remaining), "pacing control plane call");
                tokio::time::sleep(remaining).await;
            }
        }
        *last = Some(Instant::now());
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;

    fn counting_call(
        calls: &Arc<AtomicU32>,
        throttled_first: u32,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = ControlResult<u32>> + Send>> {
        let calls = Arc::clone(calls);
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= throttled_first {
                    Err(ControlError::throttled("describe"))
                } else {
                    Ok(n)
                }
            })
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = RetryPolicy::new(8, Duration::from_millis(500), Duration::from_secs(3));
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_secs(3));
        assert_eq!(policy.backoff(40), Duration::from_secs(3));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        let config = ThrottleConfig {
            max_attempts: 0,
            ..ThrottleConfig::default()
        };
        assert_eq!(RetryPolicy::from(&config).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_calls_respect_min_interval() {
        let guard = ThrottleGuard::with_policy(Duration::from_millis(1000), RetryPolicy::default());

        let first = guard.call("a", || async { Ok(Instant::now()) }).await.unwrap();
        let second = guard.call("b", || async { Ok(Instant::now()) }).await.unwrap();

        assert!(second - first >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn unthrottled_guard_does_not_wait() {
        let guard = ThrottleGuard::unthrottled();
        let start = Instant::now();
        guard.call("a", || async { Ok(()) }).await.unwrap();
        guard.call("b", || async { Ok(()) }).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_call_is_retried_transparently() {
        let guard = ThrottleGuard::unthrottled();
        let calls = Arc::new(AtomicU32::new(0));

        let result = guard.call("describe", counting_call(&calls, 2)).await.unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_throttling_surfaces_after_bound() {
        let guard = ThrottleGuard::unthrottled();
        let calls = Arc::new(AtomicU32::new(0));

        let err = guard
            .call("describe", counting_call(&calls, u32::MAX))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ControlError::ThrottlingExhausted { attempts: 5, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let guard = ThrottleGuard::unthrottled();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let err = guard
            .call("terminate", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ControlError::service("access denied"))
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Service(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn min_interval_can_be_changed_at_runtime() {
        let guard = ThrottleGuard::unthrottled();
        guard.set_min_interval(Duration::from_millis(250));
        assert_eq!(guard.min_interval(), Duration::from_millis(250));

        let first = guard.call("a", || async { Ok(Instant::now()) }).await.unwrap();
        let second = guard.call("b", || async { Ok(Instant::now()) }).await.unwrap();
        assert!(second - first >= Duration::from_millis(250));
    }
}
