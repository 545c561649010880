// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

// Model Backend Domain Interface (Anti-Corruption Layer)
//
// Defines the domain interface for language-model backends. Prevents
// vendor lock-in by abstracting external model APIs; implementations live
// with the embedding application, not in this crate.
//
// The engine requires completion to be idempotent-safe to retry: no side
// effects beyond token billing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::agent::ModelParams;

/// Domain interface for model backends.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Produce one completion turn: free text plus zero or more tool calls.
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, ModelError>;
}

/// One request to the backend capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub turns: Vec<Turn>,
    /// Operations the running agent may invoke this turn.
    pub tools: Vec<ToolSpec>,
    pub params: ModelParams,
}

/// A single conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: TurnRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Assistant, content: content.into() }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: TurnRole::Tool, content: content.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    Tool,
}

/// Declaration of an operation exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema for the arguments.
    pub parameters: serde_json::Value,
}

/// Backend response: text and any tool calls the model issued.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), tool_calls: Vec::new() }
    }
}

/// One tool invocation issued by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Errors that can occur during backend operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ModelError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP status {0}: {1}")]
    Http(u16, String),

    #[error("Provider overloaded: {0}")]
    Overloaded(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Circuit open for dependency '{0}'")]
    CircuitOpen(String),

    #[error("Retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ModelError>,
    },
}

impl ModelError {
    /// Transient failures are eligible for retry. Everything else fails the
    /// call immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Overloaded(_) => true,
            Self::Http(status, _) => matches!(status, 408 | 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ModelError::Network("connection reset".into()).is_transient());
        assert!(ModelError::Overloaded("overloaded_error".into()).is_transient());
        for status in [408, 429, 500, 502, 503, 504] {
            assert!(ModelError::Http(status, "busy".into()).is_transient());
        }
        assert!(!ModelError::Http(401, "unauthorized".into()).is_transient());
        assert!(!ModelError::Http(404, "missing".into()).is_transient());
        assert!(!ModelError::Authentication("bad key".into()).is_transient());
        assert!(!ModelError::InvalidInput("empty prompt".into()).is_transient());
        assert!(!ModelError::Cancelled.is_transient());
        assert!(!ModelError::CircuitOpen("backend".into()).is_transient());
    }
}
