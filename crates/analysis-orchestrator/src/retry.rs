//! Timeout + retry wrapper around single upstream calls.

use analysis_core::{AnalysisError, ErrorCategory, UserFriendlyError};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancellationFlag;
use crate::classifier::classify;
use crate::config::OrchestratorConfig;

/// Failure crossing from a pipeline step back to the run loop
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("request cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(UserFriendlyError),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            timeout: config.fetch_timeout,
            max_retries: config.max_retries,
            base_backoff: config.base_backoff,
        }
    }

    /// Delay after the failure of attempt `attempt` (0-based): `base * 2^attempt`, no jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.base_backoff
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(Duration::MAX)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&OrchestratorConfig::default())
    }
}

/// Race `fut` against `timeout`.
///
/// The call runs as its own task; on timeout the task is left to finish in the
/// background and its result is discarded.
pub async fn with_timeout<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, AnalysisError>
where
    T: Send + 'static,
    Fut: Future<Output = Result<T, AnalysisError>> + Send + 'static,
{
    let handle = tokio::spawn(fut);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(AnalysisError::Unknown(format!(
            "upstream task aborted: {}",
            join_err
        ))),
        Err(_) => Err(AnalysisError::Timeout(format!(
            "no response within {}s",
            timeout.as_secs_f64()
        ))),
    }
}

/// Run `operation` with per-attempt timeout, exponential backoff and cooperative cancellation.
///
/// `cancel` is checked before every attempt and right after every failure. Once
/// the retry budget is spent the last error is classified with a `network` fallback.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationFlag,
    label: &str,
    mut operation: F,
) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AnalysisError>> + Send + 'static,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let err = match with_timeout(policy.timeout, operation()).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("{} succeeded on attempt {}/{}", label, attempt + 1, policy.max_attempts());
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        if attempt >= policy.max_retries {
            tracing::warn!("{} failed after {} attempts: {}", label, attempt + 1, err);
            return Err(PipelineError::Failed(classify(&err, Some(ErrorCategory::Network))));
        }

        let delay = policy.backoff_for(attempt);
        tracing::warn!(
            "{} failed (attempt {}/{}): {}. Retrying in {}ms",
            label,
            attempt + 1,
            policy.max_attempts(),
            err,
            delay.as_millis()
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn flaky(calls: Arc<AtomicU32>, failures: u32, message: &'static str) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<u32, AnalysisError>> + Send>> {
        move || {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Err(AnalysisError::ApiError(message.to_string()))
                } else {
                    Ok(n + 1)
                }
            })
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt_after_two_backoffs() {
        let calls: Arc<std::sync::Mutex<Vec<Instant>>> = Arc::default();
        let recorder = Arc::clone(&calls);

        let result = execute_with_retry(
            &RetryPolicy::default(),
            &CancellationFlag::new(),
            "snapshot",
            move || {
                let attempt = {
                    let mut calls = recorder.lock().unwrap();
                    calls.push(Instant::now());
                    calls.len() as u32
                };
                async move {
                    if attempt < 3 {
                        Err(AnalysisError::ApiError("connection reset".to_string()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
        let calls = calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 3);
        let gaps: Vec<Duration> = calls.windows(2).map(|pair| pair[1] - pair[0]).collect();
        for (gap, expected) in gaps.iter().zip([500u64, 1000]) {
            let expected = Duration::from_millis(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(5),
                "gaps {:?}",
                gaps
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_yield_network_error() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = execute_with_retry(
            &RetryPolicy::default(),
            &CancellationFlag::new(),
            "snapshot",
            flaky(Arc::clone(&calls), u32::MAX, "upstream returned garbage"),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(PipelineError::Failed(err)) => {
                assert_eq!(err.category, ErrorCategory::Network);
                assert!(!err.message.contains("garbage"));
            }
            other => panic!("expected classified failure, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_each_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let start = Instant::now();

        let result: Result<u32, _> = execute_with_retry(
            &RetryPolicy::default(),
            &CancellationFlag::new(),
            "snapshot",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<u32, AnalysisError>>()
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(31_500));
        match result {
            Err(PipelineError::Failed(err)) => {
                assert_eq!(err.category, ErrorCategory::Network);
                assert!(err.message.contains("too long"));
            }
            other => panic!("expected timeout failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationFlag::new();
        cancel.cancel();

        let result = execute_with_retry(
            &RetryPolicy::default(),
            &cancel,
            "snapshot",
            flaky(Arc::clone(&calls), 0, ""),
        )
        .await;

        assert_eq!(result, Err(PipelineError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_failure_stops_retrying() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationFlag::new();
        let counter = Arc::clone(&calls);
        let flag = cancel.clone();

        let result: Result<u32, _> = execute_with_retry(
            &RetryPolicy::default(),
            &cancel,
            "snapshot",
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                flag.cancel();
                async { Err(AnalysisError::ApiError("connection refused".to_string())) }
            },
        )
        .await;

        assert_eq!(result, Err(PipelineError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
