// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Circuit breaker, one instance per external dependency.
//!
//! Closed passes calls through and counts failures in a sliding time
//! window; crossing the threshold opens the circuit. While open, calls
//! fail fast until the reset timeout elapses, then exactly one caller is
//! let through as a half-open probe. Concurrent callers during the probe
//! are rejected, not queued. Probe success closes the circuit and clears
//! the window; probe failure re-opens it immediately.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Instant;

use tracing::{info, warn};

use crate::domain::config::BreakerConfig;
use crate::domain::llm::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: parking_lot::Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Run `operation` under the breaker. Fails fast with
    /// [`ModelError::CircuitOpen`] without invoking the operation while the
    /// circuit is open or a probe is already in flight.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, ModelError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let probing = self.admit()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(ModelError::Cancelled) => {
                // Cancellation says nothing about dependency health.
                self.release_probe(probing);
                Err(ModelError::Cancelled)
            }
            Err(error) => {
                self.record_failure(probing);
                Err(error)
            }
        }
    }

    /// Decide admission. `Ok(true)` marks the caller as the half-open probe.
    fn admit(&self) -> Result<bool, ModelError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.config.reset_timeout && !inner.probe_in_flight {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    Ok(true)
                } else {
                    Err(ModelError::CircuitOpen(self.name.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(ModelError::CircuitOpen(self.name.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self, probing: bool) {
        let mut inner = self.inner.lock();
        if probing {
            warn!(breaker = %self.name, "half-open probe failed, re-opening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
            return;
        }

        let now = Instant::now();
        inner.failures.push_back(now);
        let window = self.config.window;
        while inner
            .failures
            .front()
            .is_some_and(|&at| now.duration_since(at) > window)
        {
            inner.failures.pop_front();
        }
        if inner.state == CircuitState::Closed
            && inner.failures.len() >= self.config.failure_threshold
        {
            warn!(
                breaker = %self.name,
                failures = inner.failures.len(),
                "failure threshold crossed, opening circuit"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }

    /// A cancelled probe neither closes nor re-opens: the circuit returns
    /// to open with its original timestamp so the next caller may probe.
    fn release_probe(&self, probing: bool) {
        if !probing {
            return;
        }
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn breaker(threshold: usize, reset_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "backend",
            BreakerConfig {
                failure_threshold: threshold,
                window: Duration::from_secs(10),
                reset_timeout: Duration::from_millis(reset_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), ModelError> {
        b.call(|| async { Err(ModelError::Http(500, "boom".into())) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_failures_within_window() {
        let b = breaker(3, 10_000);
        for _ in 0..2 {
            assert!(fail(&b).await.is_err());
            assert_eq!(b.state(), CircuitState::Closed);
        }
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_invoking() {
        let b = breaker(1, 10_000);
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let result = b
            .call(move || {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ModelError>(())
                }
            })
            .await;

        assert!(matches!(result, Err(ModelError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn exactly_one_probe_admitted_at_half_open() {
        let b = Arc::new(breaker(1, 10));
        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        // First caller becomes the probe and holds the slot.
        let b_probe = b.clone();
        let probe = tokio::spawn(async move {
            b_probe
                .call(|| async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ModelError>("probe ok")
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Concurrent caller during the probe is rejected, not queued.
        let concurrent = b.call(|| async { Ok::<_, ModelError>("second") }).await;
        assert!(matches!(concurrent, Err(ModelError::CircuitOpen(_))));

        assert_eq!(probe.await.unwrap().unwrap(), "probe ok");
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_success_closes_and_clears_window() {
        let b = breaker(2, 10);
        assert!(fail(&b).await.is_err());
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;
        b.call(|| async { Ok::<_, ModelError>(()) }).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);

        // Window cleared: one fresh failure is below the threshold again.
        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn probe_failure_reopens_immediately() {
        let b = breaker(1, 10);
        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(fail(&b).await.is_err());
        assert_eq!(b.state(), CircuitState::Open);

        // Fresh reset timeout applies from the probe failure.
        let fast = b.call(|| async { Ok::<_, ModelError>(()) }).await;
        assert!(matches!(fast, Err(ModelError::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn cancelled_probe_releases_slot_without_counting() {
        let b = breaker(1, 10);
        assert!(fail(&b).await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = b
            .call(|| async { Err::<(), _>(ModelError::Cancelled) })
            .await;
        assert!(matches!(result, Err(ModelError::Cancelled)));
        assert_eq!(b.state(), CircuitState::Open);

        // Next caller may probe straight away (reset timeout long elapsed).
        b.call(|| async { Ok::<_, ModelError>(()) }).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
