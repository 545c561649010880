// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod mailbox;
pub mod memory;
pub mod orchestration_lock;
pub mod pool;
pub mod resilience;

pub use mailbox::{Delivery, Mailbox, MailboxMessage, Responder, SendOutcome};
pub use pool::{AgentInstance, AgentPool, PoolMetrics};
