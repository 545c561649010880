// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Live Coordination Event Fan-Out
//
// In-memory pub/sub over tokio broadcast channels. Feeds dashboards,
// conversation viewers, and operator tooling. At-most-once, best-effort:
// publishing succeeds with zero subscribers and slow subscribers lag
// rather than block the engine.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::agent::ConversationId;
use crate::domain::events::{ConversationEvent, CoordinationEvent};
use crate::domain::repository::EventSink;

/// Broadcast-backed implementation of [`EventSink`].
#[derive(Clone)]
pub struct BroadcastEventSink {
    sender: Arc<broadcast::Sender<ConversationEvent>>,
}

impl BroadcastEventSink {
    /// Capacity determines how many events are buffered before old ones
    /// are dropped for lagging subscribers.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender: Arc::new(sender) }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    /// Subscribe to all coordination events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver { receiver: self.sender.subscribe() }
    }

    /// Subscribe filtered to one conversation.
    pub fn subscribe_conversation(&self, conversation_id: ConversationId) -> ConversationEventReceiver {
        ConversationEventReceiver {
            receiver: self.sender.subscribe(),
            conversation_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, conversation_id: ConversationId, event: CoordinationEvent) {
        debug!(%conversation_id, ?event, "emitting coordination event");
        let receiver_count = self
            .sender
            .send(ConversationEvent { conversation_id, event })
            .unwrap_or(0);
        if receiver_count == 0 {
            debug!("no subscribers listening to event");
        }
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<ConversationEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<ConversationEvent, EventBusError> {
        self.receiver.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => EventBusError::Closed,
            broadcast::error::RecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }

    pub fn try_recv(&mut self) -> Result<ConversationEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver filtered to a single conversation's events.
pub struct ConversationEventReceiver {
    receiver: broadcast::Receiver<ConversationEvent>,
    conversation_id: ConversationId,
}

impl ConversationEventReceiver {
    pub async fn recv(&mut self) -> Result<CoordinationEvent, EventBusError> {
        loop {
            let envelope = self.receiver.recv().await.map_err(|e| match e {
                broadcast::error::RecvError::Closed => EventBusError::Closed,
                broadcast::error::RecvError::Lagged(n) => {
                    warn!("event receiver lagged by {} events", n);
                    EventBusError::Lagged(n)
                }
            })?;
            if envelope.conversation_id == self.conversation_id {
                return Ok(envelope.event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}
