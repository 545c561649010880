// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0
//! Conclave core
//!
//! Multi-agent execution and coordination engine: agent pool, mailbox
//! rendezvous, execution lifecycle, orchestration lock, deadlock
//! detection, and the resilience stack around model-backend calls.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Implements agent coordination

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use domain::*;
