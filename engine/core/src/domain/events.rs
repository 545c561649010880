// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Coordination events published on the live fan-out.
//!
//! Best-effort, at-most-once: the engine functions identically with zero
//! subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentState, ConversationId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinationEvent {
    AgentSpawned {
        agent_id: AgentId,
        spawned_at: DateTime<Utc>,
    },
    AgentStateChanged {
        agent_id: AgentId,
        state: AgentState,
    },
    DelegationStarted {
        agent_id: AgentId,
        targets: Vec<AgentId>,
    },
    DelegationCompleted {
        agent_id: AgentId,
        targets: Vec<AgentId>,
    },
    ResultSubmitted {
        agent_id: AgentId,
        submitted_at: DateTime<Utc>,
    },
    Escalated {
        agent_id: AgentId,
        reason: String,
    },
    DeadlockDetected {
        participants: Vec<AgentId>,
        detected_at: DateTime<Utc>,
    },
    ConversationCancelled {
        cancelled_at: DateTime<Utc>,
    },
    ConversationCompleted {
        completed_at: DateTime<Utc>,
    },
}

/// Envelope pairing an event with the conversation it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub conversation_id: ConversationId,
    pub event: CoordinationEvent,
}
