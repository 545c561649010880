// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Collaborator ports.
//!
//! The engine consumes these interfaces; implementations belong to the
//! embedding application (directory/storage backends, UI push channels).
//! In-memory implementations ship in `infrastructure::memory` and
//! `infrastructure::event_bus`.

use async_trait::async_trait;

use crate::domain::agent::{AgentId, AgentProfile, ConversationId};
use crate::domain::events::CoordinationEvent;

/// Read-only lookup into the agent directory.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn get_agent(&self, agent_id: AgentId) -> anyhow::Result<AgentProfile>;
}

/// Role attached to a persisted conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

/// Persistence sink for conversation history and activity.
///
/// Fire-and-forget from the engine's point of view: failures are logged by
/// the caller, never propagated into the delegation tree.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()>;

    async fn append_activity_event(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        kind: &str,
        detail: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// At-most-once push to live observers. Must succeed (as a no-op) with
/// zero subscribers.
pub trait EventSink: Send + Sync {
    fn emit(&self, conversation_id: ConversationId, event: CoordinationEvent);
}
