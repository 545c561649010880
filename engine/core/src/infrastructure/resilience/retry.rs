// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Retry with exponential backoff.
//!
//! Only classified-transient failures are retried. Cancellation observed
//! during the inter-attempt sleep aborts immediately with the *original*
//! failure, never with a cancellation error.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::config::RetryConfig;
use crate::domain::llm::ModelError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` up to `max_attempts` times.
    pub async fn call<T, F, Fut>(
        &self,
        cancellation: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ModelError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        if cancellation.is_cancelled() {
            return Err(ModelError::Cancelled);
        }

        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if !error.is_transient() => return Err(error),
                Err(error) if attempt >= self.config.max_attempts => {
                    return Err(ModelError::RetriesExhausted {
                        attempts: attempt,
                        source: Box::new(error),
                    });
                }
                Err(error) => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient backend failure, backing off"
                    );
                    tokio::select! {
                        _ = cancellation.cancelled() => return Err(error),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// `initial × multiplier^(attempt-1)`, capped, with ±25% jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.config.initial_delay.as_secs_f64() * exp;
        let capped = base.min(self.config.max_delay.as_secs_f64());
        let jitter = rand::rng().random_range(0.75..=1.25);
        Duration::from_secs_f64(capped * jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn transient_failures_retry_until_success() {
        let policy = fast_policy(4);
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let calls_in = calls.clone();
        let result = policy
            .call(&token, move || {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ModelError::Http(503, "busy".into()))
                    } else {
                        Ok("done".to_string())
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_failures_are_never_retried() {
        let policy = fast_policy(4);
        let calls = Arc::new(AtomicU32::new(0));
        let token = CancellationToken::new();

        let calls_in = calls.clone();
        let result: Result<(), _> = policy
            .call(&token, move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ModelError::Authentication("bad key".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(ModelError::Authentication(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts_and_original_error() {
        let policy = fast_policy(3);
        let token = CancellationToken::new();

        let result: Result<(), _> = policy
            .call(&token, || async { Err(ModelError::Network("reset".into())) })
            .await;

        match result {
            Err(ModelError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*source, ModelError::Network(_)));
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_during_backoff_returns_original_failure() {
        let policy = RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        });
        let token = CancellationToken::new();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), _> = policy
            .call(&token, || async { Err(ModelError::Overloaded("overloaded".into())) })
            .await;

        // Aborted promptly with the original failure, not Cancelled, and
        // did not wait out the 5 s backoff.
        assert!(matches!(result, Err(ModelError::Overloaded(_))));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn already_cancelled_returns_cancelled_without_calling() {
        let policy = fast_policy(3);
        let token = CancellationToken::new();
        token.cancel();

        let result = policy
            .call(&token, || async { Ok::<_, ModelError>("unreachable") })
            .await;
        assert!(matches!(result, Err(ModelError::Cancelled)));
    }

    #[test]
    fn backoff_grows_exponentially_within_cap_and_jitter() {
        let policy = fast_policy(6);
        for attempt in 1..=6 {
            let delay = policy.backoff_delay(attempt).as_secs_f64();
            let base = (0.005 * 2.0f64.powi(attempt as i32 - 1)).min(0.050);
            assert!(delay >= base * 0.75 - f64::EPSILON, "attempt {attempt}: {delay}");
            assert!(delay <= base * 1.25 + f64::EPSILON, "attempt {attempt}: {delay}");
        }
    }
}
