// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Resilience wrapper around the model backend: retry-with-backoff inside
//! a per-dependency circuit breaker.
//!
//! Composition order matters: the breaker wraps retry, so a call failing
//! fast on an open circuit burns no retry attempts.

pub mod breaker;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitState};
pub use retry::RetryPolicy;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::domain::config::{BreakerConfig, RetryConfig};
use crate::domain::llm::{Completion, CompletionRequest, ModelBackend, ModelError};

/// Model backend wrapped in the full resilience stack.
pub struct ResilientBackend {
    inner: Arc<dyn ModelBackend>,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl ResilientBackend {
    pub fn new(
        dependency: impl Into<String>,
        inner: Arc<dyn ModelBackend>,
        retry: RetryConfig,
        breaker: BreakerConfig,
    ) -> Self {
        Self {
            inner,
            retry: RetryPolicy::new(retry),
            breaker: CircuitBreaker::new(dependency, breaker),
        }
    }

    pub async fn complete(
        &self,
        request: CompletionRequest,
        cancellation: &CancellationToken,
    ) -> Result<Completion, ModelError> {
        self.breaker
            .call(|| {
                self.retry
                    .call(cancellation, || self.inner.complete(request.clone()))
            })
            .await
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }
}
