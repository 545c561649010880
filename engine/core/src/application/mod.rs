// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

pub mod deadlock;
pub mod engine;

pub use deadlock::{find_cycles, DeadlockDetector};
pub use engine::{sentinel, EngineError, ExecutionEngine, InvocationCounts};
