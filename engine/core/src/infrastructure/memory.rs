// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! In-memory collaborator implementations.
//!
//! Suitable for tests and single-process embeddings; production directory
//! and persistence backends live with the embedding application.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::agent::{AgentId, AgentProfile, ConversationId};
use crate::domain::repository::{AgentDirectory, ConversationStore, MessageRole};

/// Directory backed by a map of profiles.
pub struct InMemoryDirectory {
    agents: RwLock<HashMap<AgentId, AgentProfile>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self { agents: RwLock::new(HashMap::new()) }
    }

    pub async fn insert(&self, profile: AgentProfile) {
        self.agents.write().await.insert(profile.id, profile);
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryDirectory {
    async fn get_agent(&self, agent_id: AgentId) -> anyhow::Result<AgentProfile> {
        self.agents
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("agent {} not found in directory", agent_id))
    }
}

/// A persisted conversation message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub agent_id: Option<AgentId>,
    pub role: MessageRole,
    pub content: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// A persisted activity event.
#[derive(Debug, Clone)]
pub struct StoredActivity {
    pub agent_id: Option<AgentId>,
    pub kind: String,
    pub detail: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only store over per-conversation vectors.
pub struct InMemoryConversationStore {
    messages: RwLock<HashMap<ConversationId, Vec<StoredMessage>>>,
    activity: RwLock<HashMap<ConversationId, Vec<StoredActivity>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self {
            messages: RwLock::new(HashMap::new()),
            activity: RwLock::new(HashMap::new()),
        }
    }

    pub async fn messages(&self, conversation_id: ConversationId) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn activity(&self, conversation_id: ConversationId) -> Vec<StoredActivity> {
        self.activity
            .read()
            .await
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append_message(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        role: MessageRole,
        content: &str,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.messages
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .push(StoredMessage {
                agent_id,
                role,
                content: content.to_string(),
                metadata,
                recorded_at: Utc::now(),
            });
        Ok(())
    }

    async fn append_activity_event(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        kind: &str,
        detail: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.activity
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .push(StoredActivity {
                agent_id,
                kind: kind.to_string(),
                detail,
                recorded_at: Utc::now(),
            });
        Ok(())
    }
}
