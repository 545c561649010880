// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handle into the agent directory. The directory collaborator owns
/// the mapping from id to profile; the engine never interprets the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One logical job: one pool, one orchestration lock, one cancellation root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Correlates an asynchronous mailbox reply back to the exact message it
/// answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Agent profile as served by the directory collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: AgentId,
    /// Unique agent name (used in delegation targets and prompts).
    pub name: String,
    pub role: AgentRole,
    pub system_prompt: String,
    pub model: ModelParams,
    /// Agents this agent is allowed to delegate to or ask.
    pub connections: Vec<AgentId>,
}

/// Position of the agent in the hierarchy. Drives which operations the
/// agent's loop exposes; resolved once at spawn time, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Delegates and aggregates; top of a subtree.
    Manager,
    /// Executes tasks itself; leaf of the hierarchy.
    Worker,
}

/// Model configuration carried opaquely to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParams {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: Some(4096),
            temperature: Some(0.7),
        }
    }
}

/// Closed enumeration of the operations an agent's loop can expose.
///
/// Dynamic per-call tool discovery is deliberately not supported: the set
/// is resolved from role and connections when the instance spawns and is
/// fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCapability {
    Delegate,
    Ask,
    SubmitResult,
    WaitForMessages,
    RespondToMessage,
    Escalate,
}

impl AgentCapability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delegate => "delegate",
            Self::Ask => "ask",
            Self::SubmitResult => "submit_result",
            Self::WaitForMessages => "wait_for_messages",
            Self::RespondToMessage => "respond_to_message",
            Self::Escalate => "escalate",
        }
    }
}

/// Resolve the capability set for a profile.
///
/// Every agent can submit a result and service its mailbox. Delegation and
/// asking require connections to exist; escalation is a worker-side valve.
pub fn resolve_capabilities(profile: &AgentProfile) -> HashSet<AgentCapability> {
    let mut caps = HashSet::from([
        AgentCapability::SubmitResult,
        AgentCapability::WaitForMessages,
        AgentCapability::RespondToMessage,
    ]);
    if !profile.connections.is_empty() {
        caps.insert(AgentCapability::Ask);
        if profile.role == AgentRole::Manager {
            caps.insert(AgentCapability::Delegate);
        }
    }
    if profile.role == AgentRole::Worker {
        caps.insert(AgentCapability::Escalate);
    }
    caps
}

/// Per-instance lifecycle state. Observability only: transitions are
/// recorded for events and metrics, never consulted for control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Created,
    Running,
    Delegating,
    AwaitingMailbox,
    ResultSubmitted,
    Standby,
    Terminated,
    TerminatedWithError,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(role: AgentRole, connections: Vec<AgentId>) -> AgentProfile {
        AgentProfile {
            id: AgentId::new(),
            name: "test".to_string(),
            role,
            system_prompt: "You are a test agent.".to_string(),
            model: ModelParams::default(),
            connections,
        }
    }

    #[test]
    fn manager_with_connections_can_delegate_and_ask() {
        let caps = resolve_capabilities(&profile(AgentRole::Manager, vec![AgentId::new()]));
        assert!(caps.contains(&AgentCapability::Delegate));
        assert!(caps.contains(&AgentCapability::Ask));
        assert!(caps.contains(&AgentCapability::SubmitResult));
        assert!(!caps.contains(&AgentCapability::Escalate));
    }

    #[test]
    fn manager_without_connections_cannot_delegate() {
        let caps = resolve_capabilities(&profile(AgentRole::Manager, vec![]));
        assert!(!caps.contains(&AgentCapability::Delegate));
        assert!(!caps.contains(&AgentCapability::Ask));
    }

    #[test]
    fn worker_gets_escalate_but_not_delegate() {
        let caps = resolve_capabilities(&profile(AgentRole::Worker, vec![AgentId::new()]));
        assert!(caps.contains(&AgentCapability::Escalate));
        assert!(caps.contains(&AgentCapability::Ask));
        assert!(!caps.contains(&AgentCapability::Delegate));
    }
}
