// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Agent pool registry.
//!
//! Process-wide map of `conversation -> agent -> AgentInstance` with
//! capacity bounds, staleness eviction, and bulk shutdown. Invariant: at
//! most one instance per `(conversation, agent)` pair at any time; this is
//! what makes "ask the already-running agent" routing correct instead of
//! spawning duplicates.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::agent::{AgentId, AgentState, ConversationId};
use crate::domain::config::EngineConfig;
use crate::infrastructure::mailbox::Mailbox;

/// Single-assignment result slot. Exactly one `resolve` ever succeeds;
/// later writes are no-ops.
pub struct ResultCell {
    tx: parking_lot::Mutex<Option<oneshot::Sender<String>>>,
}

impl ResultCell {
    pub fn new() -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: parking_lot::Mutex::new(Some(tx)) }, rx)
    }

    /// Returns `true` only for the write that actually resolved the cell.
    pub fn resolve(&self, result: impl Into<String>) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(result.into());
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// One actively running agent within one conversation.
pub struct AgentInstance {
    pub agent_id: AgentId,
    /// Exclusively owned by this instance; shut down when the instance is
    /// destroyed.
    pub mailbox: Arc<Mailbox>,
    pub result: ResultCell,
    /// Logical AND of the conversation's cancellation and this instance's
    /// own: cancelling the conversation cancels the instance, cancelling
    /// the instance does not propagate upward.
    pub cancellation: CancellationToken,
    pub registered_at: Instant,
    last_activity: parking_lot::Mutex<Instant>,
    /// Agents this instance is currently blocked on. Consumed only by the
    /// deadlock detector; `None` while not blocked.
    waiting_for: parking_lot::Mutex<Option<HashSet<AgentId>>>,
    state: parking_lot::Mutex<AgentState>,
    receiving: AtomicBool,
}

impl AgentInstance {
    /// Build an instance whose cancellation derives from the conversation
    /// token. Returns the instance and the receiving half of its result.
    pub fn new(
        agent_id: AgentId,
        conversation_token: &CancellationToken,
        mailbox_capacity: usize,
        mailbox_ttl: Duration,
    ) -> (Arc<Self>, oneshot::Receiver<String>) {
        let (result, result_rx) = ResultCell::new();
        let instance = Arc::new(Self {
            agent_id,
            mailbox: Arc::new(Mailbox::new(mailbox_capacity, mailbox_ttl)),
            result,
            cancellation: conversation_token.child_token(),
            registered_at: Instant::now(),
            last_activity: parking_lot::Mutex::new(Instant::now()),
            waiting_for: parking_lot::Mutex::new(None),
            state: parking_lot::Mutex::new(AgentState::Created),
            receiving: AtomicBool::new(false),
        });
        (instance, result_rx)
    }

    /// Heartbeat for staleness accounting.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    pub fn set_state(&self, state: AgentState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> AgentState {
        self.state.lock().clone()
    }

    /// Declare the agents this instance is about to block on. Must be
    /// cleared with [`clear_waiting_for`](Self::clear_waiting_for) once
    /// unblocked.
    pub fn declare_waiting_for(&self, targets: impl IntoIterator<Item = AgentId>) {
        *self.waiting_for.lock() = Some(targets.into_iter().collect());
    }

    pub fn clear_waiting_for(&self) {
        *self.waiting_for.lock() = None;
    }

    pub fn waiting_for(&self) -> Option<HashSet<AgentId>> {
        self.waiting_for.lock().clone()
    }

    pub fn set_receiving(&self, receiving: bool) {
        self.receiving.store(receiving, Ordering::Relaxed);
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::Relaxed)
    }

    /// Shut the instance down: mailbox drained with sentinels, own
    /// cancellation signalled. Does not touch siblings or the parent.
    pub async fn shutdown(&self) {
        self.cancellation.cancel();
        self.mailbox.shutdown().await;
        self.set_state(AgentState::Terminated);
    }
}

/// Read-only operational snapshot.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PoolMetrics {
    pub conversations: usize,
    pub total_agents: usize,
    pub agents_receiving: usize,
    pub queued_messages: usize,
    pub oldest_instance_age: Option<Duration>,
    pub stale_instances: usize,
}

/// Registry of live agent instances, keyed by conversation.
pub struct AgentPool {
    conversations: RwLock<HashMap<ConversationId, HashMap<AgentId, Arc<AgentInstance>>>>,
    max_agents_per_conversation: usize,
    eviction_age: Duration,
    stale_after: Duration,
    sweep_interval: Duration,
}

impl AgentPool {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_agents_per_conversation: config.max_agents_per_conversation,
            eviction_age: config.eviction_age,
            stale_after: config.stale_after,
            sweep_interval: config.sweep_interval,
        }
    }

    pub async fn get(
        &self,
        conversation_id: ConversationId,
        agent_id: AgentId,
    ) -> Option<Arc<AgentInstance>> {
        self.conversations
            .read()
            .await
            .get(&conversation_id)
            .and_then(|agents| agents.get(&agent_id))
            .cloned()
    }

    /// Register an instance, replacing any resident for the same agent.
    /// Under capacity pressure, instances older than the eviction age are
    /// shut down first; the incoming registration is never dropped.
    pub async fn register(&self, conversation_id: ConversationId, instance: Arc<AgentInstance>) {
        let evicted = {
            let mut conversations = self.conversations.write().await;
            let agents = conversations.entry(conversation_id).or_default();
            let evicted = self.make_room(conversation_id, agents);
            debug!(%conversation_id, agent_id = %instance.agent_id, "registering agent instance");
            agents.insert(instance.agent_id, instance);
            evicted
        };

        for old in evicted {
            old.shutdown().await;
        }
    }

    /// Atomic check-and-register. When an instance already exists for the
    /// `(conversation, agent)` pair, the pool is left untouched and that
    /// resident is returned so the caller can route to it; otherwise the
    /// new instance is inserted and `None` is returned. This is the only
    /// registration path that preserves the one-instance invariant under
    /// concurrent spawns.
    pub async fn register_or_get(
        &self,
        conversation_id: ConversationId,
        instance: Arc<AgentInstance>,
    ) -> Option<Arc<AgentInstance>> {
        let (existing, evicted) = {
            let mut conversations = self.conversations.write().await;
            let agents = conversations.entry(conversation_id).or_default();
            match agents.get(&instance.agent_id) {
                Some(resident) => (Some(resident.clone()), Vec::new()),
                None => {
                    let evicted = self.make_room(conversation_id, agents);
                    debug!(%conversation_id, agent_id = %instance.agent_id, "registering agent instance");
                    agents.insert(instance.agent_id, instance);
                    (None, evicted)
                }
            }
        };

        for old in evicted {
            old.shutdown().await;
        }
        existing
    }

    /// Evict over-age residents when the conversation is at capacity.
    /// Caller holds the write lock; returned instances must be shut down
    /// outside it.
    fn make_room(
        &self,
        conversation_id: ConversationId,
        agents: &mut HashMap<AgentId, Arc<AgentInstance>>,
    ) -> Vec<Arc<AgentInstance>> {
        let mut evicted = Vec::new();
        if agents.len() >= self.max_agents_per_conversation {
            let over_age: Vec<AgentId> = agents
                .values()
                .filter(|i| i.age() > self.eviction_age)
                .map(|i| i.agent_id)
                .collect();
            warn!(
                %conversation_id,
                count = agents.len(),
                evicting = over_age.len(),
                "agent pool at capacity, evicting over-age instances"
            );
            for agent_id in over_age {
                if let Some(old) = agents.remove(&agent_id) {
                    evicted.push(old);
                }
            }
        }
        evicted
    }

    /// Remove without side effects on the instance itself; the caller is
    /// responsible for having resolved its result and mailbox.
    pub async fn remove(
        &self,
        conversation_id: ConversationId,
        agent_id: AgentId,
    ) -> Option<Arc<AgentInstance>> {
        let mut conversations = self.conversations.write().await;
        let agents = conversations.get_mut(&conversation_id)?;
        let removed = agents.remove(&agent_id);
        if agents.is_empty() {
            conversations.remove(&conversation_id);
        }
        removed
    }

    /// Shut down every instance belonging to a conversation and clear its
    /// map. The only sanctioned way to guarantee no agent of a finished
    /// conversation is still waiting anywhere.
    pub async fn shutdown_conversation(&self, conversation_id: ConversationId) {
        let agents = {
            let mut conversations = self.conversations.write().await;
            conversations.remove(&conversation_id).unwrap_or_default()
        };
        if agents.is_empty() {
            return;
        }
        info!(%conversation_id, count = agents.len(), "shutting down conversation pool");
        for instance in agents.into_values() {
            instance.shutdown().await;
        }
    }

    /// Force-shut-down and remove every instance with no heartbeat within
    /// the staleness timeout, even mid-conversation. Also purges expired
    /// mailbox messages so idle senders observe TTL outcomes.
    pub async fn sweep_stale(&self) -> usize {
        let mut stale = Vec::new();
        let mut live = Vec::new();
        {
            let mut conversations = self.conversations.write().await;
            for (conversation_id, agents) in conversations.iter_mut() {
                let stale_ids: Vec<AgentId> = agents
                    .values()
                    .filter(|i| i.idle_for() > self.stale_after)
                    .map(|i| i.agent_id)
                    .collect();
                for agent_id in stale_ids {
                    if let Some(instance) = agents.remove(&agent_id) {
                        warn!(
                            %conversation_id,
                            %agent_id,
                            idle_secs = instance.idle_for().as_secs(),
                            "evicting stale agent instance"
                        );
                        stale.push(instance);
                    }
                }
                live.extend(agents.values().cloned());
            }
            conversations.retain(|_, agents| !agents.is_empty());
        }

        let count = stale.len();
        for instance in stale {
            instance.shutdown().await;
        }
        for instance in live {
            instance.mailbox.purge_expired().await;
        }
        count
    }

    /// Background staleness sweeper; runs until the token is cancelled.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("pool sweeper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let swept = self.sweep_stale().await;
                    if swept > 0 {
                        info!(swept, "stale sweep removed instances");
                    }
                }
            }
        }
    }

    /// Operational counters; read-only, no behavioral effect.
    pub async fn metrics(&self) -> PoolMetrics {
        let conversations = self.conversations.read().await;
        let mut metrics = PoolMetrics {
            conversations: conversations.len(),
            ..Default::default()
        };
        let mut oldest: Option<Duration> = None;
        for agents in conversations.values() {
            for instance in agents.values() {
                metrics.total_agents += 1;
                if instance.is_receiving() {
                    metrics.agents_receiving += 1;
                }
                if instance.idle_for() > self.stale_after {
                    metrics.stale_instances += 1;
                }
                metrics.queued_messages += instance.mailbox.len().await;
                let age = instance.age();
                if oldest.is_none_or(|o| age > o) {
                    oldest = Some(age);
                }
            }
        }
        metrics.oldest_instance_age = oldest;
        metrics
    }

    /// Conversations with at least one live instance.
    pub async fn conversation_ids(&self) -> Vec<ConversationId> {
        self.conversations.read().await.keys().copied().collect()
    }

    /// Declared wait-for edges of a conversation, for the deadlock
    /// detector. Agents that declared nothing are absent.
    pub async fn waiting_snapshot(
        &self,
        conversation_id: ConversationId,
    ) -> HashMap<AgentId, HashSet<AgentId>> {
        let conversations = self.conversations.read().await;
        let Some(agents) = conversations.get(&conversation_id) else {
            return HashMap::new();
        };
        agents
            .values()
            .filter_map(|i| i.waiting_for().map(|w| (i.agent_id, w)))
            .collect()
    }
}
