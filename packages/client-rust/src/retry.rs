//! Retry driver for resumable calls.
//!
//! [`RetryHelper::run_with_retries`] invokes a [`RetryableCallable`] until it
//! succeeds, the [`RetryPredicate`] declares the failure terminal, the retry
//! budget runs out, or the caller cancels. Backoff is exponential with
//! optional jitter; elapsed time is measured with an injected clock.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use spanrpc_core::{ClockSource, Code};
use tokio_util::sync::CancellationToken;

use crate::error::RpcError;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySettings {
    pub initial_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    pub max_retry_delay: Duration,
    /// Timeout of the first attempt.
    pub initial_rpc_timeout: Duration,
    pub rpc_timeout_multiplier: f64,
    pub max_rpc_timeout: Duration,
    /// Budget across all attempts and delays.
    pub total_timeout: Duration,
    /// Total attempts allowed; 0 means bounded only by `total_timeout`.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(20),
            retry_delay_multiplier: 1.5,
            max_retry_delay: Duration::from_secs(45),
            initial_rpc_timeout: Duration::from_secs(30),
            rpc_timeout_multiplier: 1.0,
            max_rpc_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(48 * 60 * 60),
            max_attempts: 0,
            jitter: true,
        }
    }
}

/// Parameters of one attempt, handed to the callable.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptSettings {
    /// Zero-based attempt number.
    pub attempt: u32,
    pub rpc_timeout: Duration,
    /// Delay that preceded this attempt.
    pub retry_delay: Duration,
}

impl AttemptSettings {
    fn first(settings: &RetrySettings) -> Self {
        Self {
            attempt: 0,
            rpc_timeout: settings.initial_rpc_timeout,
            retry_delay: Duration::ZERO,
        }
    }

    fn next(&self, settings: &RetrySettings) -> Self {
        let retry_delay = if self.attempt == 0 {
            settings.initial_retry_delay
        } else {
            scale(self.retry_delay, settings.retry_delay_multiplier, settings.max_retry_delay)
        };
        Self {
            attempt: self.attempt + 1,
            rpc_timeout: scale(
                self.rpc_timeout,
                settings.rpc_timeout_multiplier,
                settings.max_rpc_timeout,
            ),
            retry_delay,
        }
    }
}

pub(crate) fn scale(base: Duration, multiplier: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(base.as_secs_f64() * multiplier.max(1.0))
        .map_or(max, |scaled| scaled.min(max))
}

fn jittered(delay: Duration, jitter: bool) -> Duration {
    if !jitter || delay.is_zero() {
        return delay;
    }
    #[allow(clippy::cast_possible_truncation)]
    let max_ms = delay.as_millis() as u64;
    Duration::from_millis(rand::rng().random_range(0..=max_ms))
}

/// Decides whether a failed attempt may be retried.
pub trait RetryPredicate: Send + Sync {
    fn should_retry(&self, error: &RpcError) -> bool;
}

/// Retries only transport failures classified as `DEADLINE_EXCEEDED` or
/// `UNAVAILABLE`. Cancellation and every other error are terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationRetryPolicy;

impl OperationRetryPolicy {
    pub const RETRYABLE_CODES: [Code; 2] = [Code::DeadlineExceeded, Code::Unavailable];
}

impl RetryPredicate for OperationRetryPolicy {
    fn should_retry(&self, error: &RpcError) -> bool {
        error
            .code()
            .is_some_and(|code| Self::RETRYABLE_CODES.contains(&code))
    }
}

/// A unit of work the retry driver can invoke repeatedly.
#[async_trait]
pub trait RetryableCallable: Send {
    type Output: Send;

    async fn call(&mut self, attempt: &AttemptSettings) -> Result<Self::Output, RpcError>;
}

/// Drives a [`RetryableCallable`] to completion.
pub struct RetryHelper;

impl RetryHelper {
    /// Runs `callable` until it succeeds or a terminal condition is reached.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, the last retryable error once
    /// the budget is exhausted, or [`RpcError::Cancelled`] if `cancel` fires.
    pub async fn run_with_retries<C>(
        callable: &mut C,
        settings: &RetrySettings,
        predicate: &dyn RetryPredicate,
        clock: &dyn ClockSource,
        cancel: &CancellationToken,
    ) -> Result<C::Output, RpcError>
    where
        C: RetryableCallable + ?Sized,
    {
        let started_ms = clock.now_millis();
        let mut attempt = AttemptSettings::first(settings);

        loop {
            if cancel.is_cancelled() {
                return Err(RpcError::cancelled("retry loop cancelled"));
            }

            let error = match callable.call(&attempt).await {
                Ok(output) => return Ok(output),
                Err(e) => e,
            };

            if error.is_cancelled() || !predicate.should_retry(&error) {
                return Err(error);
            }

            let next = attempt.next(settings);
            if settings.max_attempts > 0 && next.attempt >= settings.max_attempts {
                tracing::warn!(attempts = next.attempt, error = %error, "retry attempts exhausted");
                return Err(error);
            }

            let delay = jittered(next.retry_delay, settings.jitter);
            let elapsed = Duration::from_millis(clock.now_millis().saturating_sub(started_ms));
            if elapsed.saturating_add(delay) > settings.total_timeout {
                tracing::warn!(
                    elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "retry budget exhausted"
                );
                return Err(error);
            }

            metrics::counter!("spanrpc_retries_total").increment(1);
            tracing::debug!(
                attempt = next.attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying after transient failure"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RpcError::cancelled("cancelled during retry backoff"));
                }
                () = tokio::time::sleep(delay) => {}
            }
            attempt = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use spanrpc_core::{ManualClock, Status};

    use super::*;

    struct Scripted {
        outcomes: VecDeque<Result<u32, RpcError>>,
        seen: Vec<AttemptSettings>,
        clock: Option<(std::sync::Arc<ManualClock>, Duration)>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<u32, RpcError>>) -> Self {
            Self {
                outcomes: outcomes.into(),
                seen: Vec::new(),
                clock: None,
            }
        }
    }

    #[async_trait]
    impl RetryableCallable for Scripted {
        type Output = u32;

        async fn call(&mut self, attempt: &AttemptSettings) -> Result<u32, RpcError> {
            self.seen.push(attempt.clone());
            if let Some((clock, step)) = &self.clock {
                clock.advance(*step);
            }
            self.outcomes
                .pop_front()
                .unwrap_or_else(|| Err(RpcError::from(Status::unavailable("script exhausted"))))
        }
    }

    fn fast_settings() -> RetrySettings {
        RetrySettings {
            initial_retry_delay: Duration::from_millis(1),
            retry_delay_multiplier: 2.0,
            max_retry_delay: Duration::from_millis(4),
            initial_rpc_timeout: Duration::from_millis(100),
            rpc_timeout_multiplier: 2.0,
            max_rpc_timeout: Duration::from_millis(300),
            total_timeout: Duration::from_secs(60),
            max_attempts: 0,
            jitter: false,
        }
    }

    #[test]
    fn policy_retries_only_transient_codes() {
        let policy = OperationRetryPolicy;
        assert!(policy.should_retry(&Status::unavailable("x").into()));
        assert!(policy.should_retry(&Status::deadline_exceeded("x").into()));
        assert!(!policy.should_retry(&Status::new(Code::PermissionDenied, "x").into()));
        assert!(!policy.should_retry(&RpcError::cancelled("interrupted")));
        assert!(!policy.should_retry(&RpcError::Closed));
    }

    #[test]
    fn unbounded_timeouts_scale_without_overflow() {
        let settings = RetrySettings {
            initial_retry_delay: Duration::MAX,
            max_retry_delay: Duration::MAX,
            initial_rpc_timeout: Duration::MAX,
            max_rpc_timeout: Duration::MAX,
            ..RetrySettings::default()
        };
        let second = AttemptSettings::first(&settings).next(&settings);
        let third = second.next(&settings);
        assert_eq!(second.rpc_timeout, Duration::MAX);
        assert_eq!(third.rpc_timeout, Duration::MAX);
        assert_eq!(third.retry_delay, Duration::MAX);
        assert_eq!(scale(Duration::from_secs(2), 1.5, Duration::from_secs(10)), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let mut callable = Scripted::new(vec![
            Err(Status::unavailable("blip").into()),
            Err(Status::deadline_exceeded("slow").into()),
            Ok(7),
        ]);
        let out = RetryHelper::run_with_retries(
            &mut callable,
            &fast_settings(),
            &OperationRetryPolicy,
            &ManualClock::new(0),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out, 7);
        let attempts: Vec<u32> = callable.seen.iter().map(|a| a.attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
        let timeouts: Vec<u64> = callable
            .seen
            .iter()
            .map(|a| u64::try_from(a.rpc_timeout.as_millis()).unwrap())
            .collect();
        assert_eq!(timeouts, vec![100, 200, 300]);
        assert_eq!(callable.seen[1].retry_delay, Duration::from_millis(1));
        assert_eq!(callable.seen[2].retry_delay, Duration::from_millis(2));
    }

    #[tokio::test]
    async fn terminal_error_stops_immediately() {
        let mut callable = Scripted::new(vec![
            Err(Status::new(Code::PermissionDenied, "nope").into()),
            Ok(1),
        ]);
        let err = RetryHelper::run_with_retries(
            &mut callable,
            &fast_settings(),
            &OperationRetryPolicy,
            &ManualClock::new(0),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(Code::PermissionDenied));
        assert_eq!(callable.seen.len(), 1);
    }

    #[tokio::test]
    async fn max_attempts_bounds_retries() {
        let mut callable = Scripted::new(vec![]);
        let settings = RetrySettings {
            max_attempts: 3,
            ..fast_settings()
        };
        let err = RetryHelper::run_with_retries(
            &mut callable,
            &settings,
            &OperationRetryPolicy,
            &ManualClock::new(0),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        assert_eq!(callable.seen.len(), 3);
    }

    #[tokio::test]
    async fn total_timeout_measured_on_injected_clock() {
        let clock = std::sync::Arc::new(ManualClock::new(0));
        let mut callable = Scripted::new(vec![]);
        callable.clock = Some((clock.clone(), Duration::from_secs(25)));
        let err = RetryHelper::run_with_retries(
            &mut callable,
            &fast_settings(),
            &OperationRetryPolicy,
            clock.as_ref(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), Some(Code::Unavailable));
        // 25s, 50s elapsed are within 60s; the third attempt pushes past it.
        assert_eq!(callable.seen.len(), 3);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_is_terminal() {
        let mut callable = Scripted::new(vec![]);
        let settings = RetrySettings {
            initial_retry_delay: Duration::from_secs(60),
            ..fast_settings()
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = RetryHelper::run_with_retries(
            &mut callable,
            &RetrySettings {
                total_timeout: Duration::from_secs(3600),
                ..settings
            },
            &OperationRetryPolicy,
            &ManualClock::new(0),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(callable.seen.len(), 1);
    }

    #[test]
    fn jitter_stays_within_delay() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(50), true);
            assert!(d <= Duration::from_millis(50));
        }
        assert_eq!(
            jittered(Duration::from_millis(50), false),
            Duration::from_millis(50)
        );
    }
}
