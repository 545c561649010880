// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Engine configuration.
//!
//! Deserializable so embedders can load it from their config files;
//! durations use humantime syntax ("500ms", "2m").

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on delegation depth.
    pub max_depth: u32,
    /// Times one agent may be invoked within a single call tree.
    pub invocation_cap: u32,
    /// Model-backend turns an agent's loop may consume before the engine
    /// falls back to the last produced text.
    pub turn_budget: u32,
    pub mailbox_capacity: usize,
    #[serde(with = "humantime_serde")]
    pub mailbox_ttl: Duration,
    pub max_agents_per_conversation: usize,
    /// Instances older than this are evicted under capacity pressure.
    #[serde(with = "humantime_serde")]
    pub eviction_age: Duration,
    /// Instances with no heartbeat for this long are force-shut-down.
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Orchestration locks older than this are treated as abandoned.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub detector_interval: Duration,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            invocation_cap: default_invocation_cap(),
            turn_budget: default_turn_budget(),
            mailbox_capacity: default_mailbox_capacity(),
            mailbox_ttl: Duration::from_secs(120),
            max_agents_per_conversation: default_max_agents(),
            eviction_age: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(900),
            detector_interval: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failures within the window before the circuit opens.
    pub failure_threshold: usize,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window: Duration::from_secs(60),
            reset_timeout: Duration::from_secs(30),
        }
    }
}

fn default_max_depth() -> u32 { 5 }
fn default_invocation_cap() -> u32 { 3 }
fn default_turn_budget() -> u32 { 12 }
fn default_mailbox_capacity() -> usize { 32 }
fn default_max_agents() -> usize { 48 }
fn default_max_attempts() -> u32 { 4 }
fn default_failure_threshold() -> usize { 5 }
