// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Per-agent execution lifecycle.
//!
//! `execute` is the single entry point for running an agent: guard checks,
//! route-or-spawn against the pool, then the model-backed task loop with
//! delegate / ask / submit_result / wait_for_messages / respond_to_message /
//! escalate operations. Guard rejections and missing-reply outcomes travel
//! as sentinel strings, never as errors, so a failing branch can never abort
//! a sibling's join.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::deadlock::DeadlockDetector;
use crate::domain::agent::{
    resolve_capabilities, AgentCapability, AgentId, AgentProfile, AgentState, ConversationId,
    MessageId,
};
use crate::domain::config::EngineConfig;
use crate::domain::events::CoordinationEvent;
use crate::domain::llm::{CompletionRequest, ModelBackend, ToolSpec};
use crate::domain::repository::{AgentDirectory, ConversationStore, EventSink, MessageRole};
use crate::infrastructure::mailbox::{Delivery, Responder, SendOutcome};
use crate::infrastructure::orchestration_lock::OrchestrationLocks;
use crate::infrastructure::pool::{AgentInstance, AgentPool, PoolMetrics};
use crate::infrastructure::resilience::ResilientBackend;

/// Well-known terminal strings. Expected, frequent outcomes that must flow
/// through delegation joins as ordinary results.
pub mod sentinel {
    /// Cancellation was already signalled when the call arrived.
    pub const STOPPED: &str = "[stopped: conversation cancelled]";
    /// The call tree reached the hard depth ceiling.
    pub const MAX_DEPTH: &str = "[stopped: maximum delegation depth reached]";
    /// The target agent hit its per-tree invocation cap.
    pub const LOOP_GUARD: &str = "[stopped: agent invocation cap reached]";
    /// A routed message's recipient shut down before replying.
    pub const RECIPIENT_GONE: &str = "[no reply: agent shut down before responding]";
    /// A routed message was evicted by mailbox overflow.
    pub const MESSAGE_DROPPED: &str = "[no reply: message dropped by mailbox overflow]";
    /// A routed message outlived the mailbox TTL unread.
    pub const MESSAGE_EXPIRED: &str = "[no reply: message expired before the agent read it]";
    /// The task loop ended without the agent producing any text.
    pub const NO_OUTPUT: &str = "[no result: agent produced no output]";
    /// Appended when an agent claimed it would wait but never did.
    pub const PREMATURE_WAIT_WARNING: &str =
        "\n\n[warning: agent said it would wait for messages but never waited; \
         delegated work may be incomplete]";
}

/// Fatal engine-level failures. Everything recoverable is text.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Conversation {0} already has an orchestration run in flight")]
    Contended(ConversationId),

    #[error("Agent directory lookup failed: {0}")]
    Directory(#[source] anyhow::Error),
}

/// Per-call-tree invocation counter shared down the recursion. Cloning
/// shares the underlying counts.
#[derive(Clone, Default)]
pub struct InvocationCounts(Arc<parking_lot::Mutex<HashMap<AgentId, u32>>>);

impl InvocationCounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count this invocation and return the new total for the agent.
    fn bump(&self, agent_id: AgentId) -> u32 {
        let mut counts = self.0.lock();
        let entry = counts.entry(agent_id).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// The coordination engine. Explicitly constructed and shared by `Arc`;
/// owns the pool, the lock table, the deadlock detector, and the resilience
/// stack around the model backend.
pub struct ExecutionEngine {
    config: EngineConfig,
    pool: Arc<AgentPool>,
    locks: OrchestrationLocks,
    detector: Arc<DeadlockDetector>,
    directory: Arc<dyn AgentDirectory>,
    store: Arc<dyn ConversationStore>,
    events: Arc<dyn EventSink>,
    backend: Arc<ResilientBackend>,
    /// Root cancellation token per in-flight conversation run.
    conversations: parking_lot::Mutex<HashMap<ConversationId, CancellationToken>>,
}

impl ExecutionEngine {
    pub fn new(
        config: EngineConfig,
        directory: Arc<dyn AgentDirectory>,
        store: Arc<dyn ConversationStore>,
        events: Arc<dyn EventSink>,
        backend: Arc<dyn ModelBackend>,
    ) -> Arc<Self> {
        let pool = Arc::new(AgentPool::new(&config));
        let detector = Arc::new(DeadlockDetector::new(pool.clone(), events.clone()));
        let backend = Arc::new(ResilientBackend::new(
            "model-backend",
            backend,
            config.retry.clone(),
            config.breaker.clone(),
        ));
        Arc::new(Self {
            locks: OrchestrationLocks::new(config.lock_timeout),
            config,
            pool,
            detector,
            directory,
            store,
            events,
            backend,
            conversations: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    /// Start the staleness sweeper and the deadlock detector; both run until
    /// the token is cancelled.
    pub fn start_background(&self, shutdown: CancellationToken) {
        tokio::spawn(self.pool.clone().run_sweeper(shutdown.clone()));
        tokio::spawn(
            self.detector
                .clone()
                .run(self.config.detector_interval, shutdown),
        );
    }

    /// Top-level orchestration run: single-flight per conversation.
    ///
    /// Acquires the orchestration lock, executes the root agent, then shuts
    /// the conversation's pool down and releases the lock regardless of how
    /// execution ended.
    pub async fn run_conversation(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        root_agent: AgentId,
        task: impl Into<String>,
    ) -> Result<String, EngineError> {
        let holder = format!("run:{root_agent}");
        if !self.locks.try_acquire(conversation_id, &holder) {
            warn!(%conversation_id, "orchestration run refused, lock held");
            return Err(EngineError::Contended(conversation_id));
        }

        let root_token = CancellationToken::new();
        self.conversations
            .lock()
            .insert(conversation_id, root_token.clone());

        info!(%conversation_id, %root_agent, "orchestration run started");
        let result = self
            .execute(
                root_agent,
                task.into(),
                conversation_id,
                0,
                InvocationCounts::new(),
                root_token,
            )
            .await;

        self.pool.shutdown_conversation(conversation_id).await;
        self.conversations.lock().remove(&conversation_id);
        self.locks.release(conversation_id);
        self.events.emit(
            conversation_id,
            CoordinationEvent::ConversationCompleted { completed_at: Utc::now() },
        );
        info!(%conversation_id, ok = result.is_ok(), "orchestration run finished");
        result
    }

    /// Cancel a conversation: signals the root token (which propagates to
    /// every instance spawned under it) and tears the pool down.
    pub async fn cancel_conversation(&self, conversation_id: ConversationId) {
        if let Some(token) = self.conversations.lock().remove(&conversation_id) {
            token.cancel();
        }
        self.pool.shutdown_conversation(conversation_id).await;
        self.events.emit(
            conversation_id,
            CoordinationEvent::ConversationCancelled { cancelled_at: Utc::now() },
        );
        info!(%conversation_id, "conversation cancelled");
    }

    pub async fn pool_metrics(&self) -> PoolMetrics {
        self.pool.metrics().await
    }

    pub async fn detect_deadlocks(&self, conversation_id: ConversationId) -> Vec<AgentId> {
        self.detector.detect(conversation_id).await
    }

    pub fn pool(&self) -> Arc<AgentPool> {
        self.pool.clone()
    }

    /// Execute one agent call. Sole recursive entry point.
    ///
    /// Guards fire before anything is registered; an existing instance is
    /// routed to through its mailbox instead of spawning a duplicate; only
    /// a genuinely new agent spawns a fresh instance and task loop.
    pub fn execute(
        self: &Arc<Self>,
        agent_id: AgentId,
        task: String,
        conversation_id: ConversationId,
        depth: u32,
        invocations: InvocationCounts,
        cancellation: CancellationToken,
    ) -> BoxFuture<'static, Result<String, EngineError>> {
        let engine = self.clone();
        Box::pin(async move {
            engine
                .execute_inner(agent_id, task, conversation_id, depth, invocations, cancellation)
                .await
        })
    }

    async fn execute_inner(
        self: Arc<Self>,
        agent_id: AgentId,
        task: String,
        conversation_id: ConversationId,
        depth: u32,
        invocations: InvocationCounts,
        cancellation: CancellationToken,
    ) -> Result<String, EngineError> {
        // Guards, enforced on every call, not only the first.
        if cancellation.is_cancelled() {
            debug!(%conversation_id, %agent_id, "call rejected, already cancelled");
            return Ok(sentinel::STOPPED.to_string());
        }
        if depth > self.config.max_depth {
            warn!(%conversation_id, %agent_id, depth, "call rejected, depth ceiling");
            return Ok(sentinel::MAX_DEPTH.to_string());
        }
        if invocations.bump(agent_id) > self.config.invocation_cap {
            warn!(%conversation_id, %agent_id, "call rejected, invocation cap");
            return Ok(sentinel::LOOP_GUARD.to_string());
        }

        // Routing: an already-running agent answers through its mailbox.
        if let Some(instance) = self.pool.get(conversation_id, agent_id).await {
            debug!(%conversation_id, %agent_id, "routing task to running instance");
            return Ok(Self::route_task(&instance, task).await);
        }

        // Spawn path.
        let profile = self
            .directory
            .get_agent(agent_id)
            .await
            .map_err(EngineError::Directory)?;
        let (instance, result_rx) = AgentInstance::new(
            agent_id,
            &cancellation,
            self.config.mailbox_capacity,
            self.config.mailbox_ttl,
        );
        // The directory lookup suspends between the routing check and
        // registration, so a concurrent call for the same agent may have
        // registered meanwhile. Registration is atomic: the loser discards
        // its fresh instance and routes to the resident.
        if let Some(resident) = self
            .pool
            .register_or_get(conversation_id, instance.clone())
            .await
        {
            debug!(%conversation_id, %agent_id, "lost spawn race, routing to resident instance");
            return Ok(Self::route_task(&resident, task).await);
        }
        self.events.emit(
            conversation_id,
            CoordinationEvent::AgentSpawned { agent_id, spawned_at: Utc::now() },
        );
        self.persist_activity(
            conversation_id,
            Some(agent_id),
            "agent_spawned",
            json!({ "name": profile.name, "depth": depth }),
        );

        let engine = self.clone();
        tokio::spawn(async move {
            engine
                .run_agent_loop(instance, profile, task, conversation_id, depth, invocations)
                .await;
        });

        // Resolves at submit_result or at fallback resolution; the loop may
        // keep running in standby after this returns.
        match result_rx.await {
            Ok(result) => Ok(result),
            Err(_) => Ok(sentinel::STOPPED.to_string()),
        }
    }

    /// Deliver a task to a running instance and map the mailbox outcome to
    /// reply text.
    async fn route_task(instance: &Arc<AgentInstance>, task: String) -> String {
        instance.touch();
        match instance.mailbox.send(task).await {
            SendOutcome::Replied(reply) => reply,
            SendOutcome::ShutDown => sentinel::RECIPIENT_GONE.to_string(),
            SendOutcome::Dropped => sentinel::MESSAGE_DROPPED.to_string(),
            SendOutcome::Expired => sentinel::MESSAGE_EXPIRED.to_string(),
        }
    }

    /// The agent's task loop. Runs as its own task so the instance can stay
    /// alive in standby after the result resolves.
    async fn run_agent_loop(
        self: Arc<Self>,
        instance: Arc<AgentInstance>,
        profile: AgentProfile,
        task: String,
        conversation_id: ConversationId,
        depth: u32,
        invocations: InvocationCounts,
    ) {
        let agent_id = instance.agent_id;
        let capabilities = resolve_capabilities(&profile);
        let tools = build_tool_specs(&capabilities, &profile.connections);

        self.set_state(conversation_id, &instance, AgentState::Running);
        self.persist_message(
            conversation_id,
            Some(agent_id),
            MessageRole::User,
            task.clone(),
            json!({ "agent": profile.name, "depth": depth }),
        );

        let mut turns = vec![crate::domain::llm::Turn::user(task)];
        // Reply handles for messages taken off the mailbox but not yet
        // answered; dropped unresolved handles resolve their senders with
        // the shutdown sentinel.
        let mut pending_replies: HashMap<MessageId, Responder> = HashMap::new();
        let mut last_text = String::new();
        let mut wait_called = false;
        let mut errored = false;

        'turns: for _ in 0..self.config.turn_budget {
            instance.touch();
            if instance.cancellation.is_cancelled() {
                debug!(%conversation_id, %agent_id, "agent loop observed cancellation");
                break;
            }

            let request = CompletionRequest {
                system_prompt: profile.system_prompt.clone(),
                turns: turns.clone(),
                tools: tools.clone(),
                params: profile.model.clone(),
            };
            let completion = match self.backend.complete(request, &instance.cancellation).await {
                Ok(completion) => completion,
                Err(model_error) => {
                    error!(%conversation_id, %agent_id, %model_error, "model backend failed");
                    last_text = format!("[error: model backend failed: {model_error}]");
                    errored = true;
                    break;
                }
            };

            if !completion.text.is_empty() {
                last_text = completion.text.clone();
                turns.push(crate::domain::llm::Turn::assistant(completion.text.clone()));
                self.persist_message(
                    conversation_id,
                    Some(agent_id),
                    MessageRole::Assistant,
                    completion.text.clone(),
                    json!({ "agent": profile.name }),
                );
            }

            if completion.tool_calls.is_empty() {
                break;
            }

            for call in completion.tool_calls {
                let outcome = self
                    .dispatch_tool(
                        &instance,
                        &profile,
                        &capabilities,
                        conversation_id,
                        depth,
                        &invocations,
                        &mut pending_replies,
                        &mut wait_called,
                        &call.name,
                        &call.arguments,
                    )
                    .await;
                match outcome {
                    ToolOutcome::Reply(text) => {
                        self.persist_message(
                            conversation_id,
                            Some(agent_id),
                            MessageRole::Tool,
                            text.clone(),
                            json!({ "tool": call.name }),
                        );
                        turns.push(crate::domain::llm::Turn::tool(text));
                    }
                    ToolOutcome::EndLoop => break 'turns,
                }
            }
        }

        // Fallback resolution: the loop ended without an explicit submit.
        if !instance.result.is_resolved() {
            let mut text = if last_text.is_empty() {
                sentinel::NO_OUTPUT.to_string()
            } else {
                last_text
            };
            if !wait_called && sounds_like_waiting(&text) {
                warn!(%conversation_id, %agent_id, "agent claimed to wait without waiting");
                text.push_str(sentinel::PREMATURE_WAIT_WARNING);
            }
            instance.result.resolve(text);
        }

        // Cleanup at loop end, not at submit time: the instance stays
        // reachable through the standby phase above.
        self.pool.remove(conversation_id, agent_id).await;
        instance.shutdown().await;
        if errored {
            instance.set_state(AgentState::TerminatedWithError);
        }
        self.events.emit(
            conversation_id,
            CoordinationEvent::AgentStateChanged { agent_id, state: instance.state() },
        );
        debug!(%conversation_id, %agent_id, errored, "agent loop finished");
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_tool(
        self: &Arc<Self>,
        instance: &Arc<AgentInstance>,
        profile: &AgentProfile,
        capabilities: &std::collections::HashSet<AgentCapability>,
        conversation_id: ConversationId,
        depth: u32,
        invocations: &InvocationCounts,
        pending_replies: &mut HashMap<MessageId, Responder>,
        wait_called: &mut bool,
        name: &str,
        arguments: &serde_json::Value,
    ) -> ToolOutcome {
        let capability = capabilities.iter().find(|c| c.name() == name);
        let Some(capability) = capability else {
            return ToolOutcome::Reply(format!("[error: operation '{name}' not available]"));
        };

        match capability {
            AgentCapability::Delegate => {
                let Some(targets) = arg_id_list(arguments, "targets") else {
                    return ToolOutcome::Reply("[error: delegate requires 'targets']".to_string());
                };
                let Some(task) = arg_str(arguments, "task") else {
                    return ToolOutcome::Reply("[error: delegate requires 'task']".to_string());
                };
                ToolOutcome::Reply(
                    self.delegate(instance, profile, conversation_id, depth, invocations, targets, task)
                        .await,
                )
            }
            AgentCapability::Ask => {
                let Some(target) = arg_str(arguments, "target").and_then(|s| parse_id(&s)) else {
                    return ToolOutcome::Reply("[error: ask requires a valid 'target']".to_string());
                };
                let Some(question) = arg_str(arguments, "question") else {
                    return ToolOutcome::Reply("[error: ask requires 'question']".to_string());
                };
                ToolOutcome::Reply(
                    self.ask(instance, profile, conversation_id, depth, invocations, target, question)
                        .await,
                )
            }
            AgentCapability::SubmitResult => {
                let Some(result) = arg_str(arguments, "result") else {
                    return ToolOutcome::Reply("[error: submit_result requires 'result']".to_string());
                };
                if instance.result.resolve(result) {
                    self.set_state(conversation_id, instance, AgentState::ResultSubmitted);
                    self.events.emit(
                        conversation_id,
                        CoordinationEvent::ResultSubmitted {
                            agent_id: instance.agent_id,
                            submitted_at: Utc::now(),
                        },
                    );
                    self.set_state(conversation_id, instance, AgentState::Standby);
                    ToolOutcome::Reply(
                        "result recorded; you remain reachable for follow-up questions"
                            .to_string(),
                    )
                } else {
                    ToolOutcome::Reply("result was already submitted; ignored".to_string())
                }
            }
            AgentCapability::WaitForMessages => {
                *wait_called = true;
                self.wait_for_messages(instance, conversation_id, arguments, pending_replies)
                    .await
            }
            AgentCapability::RespondToMessage => {
                let id = arg_str(arguments, "message_id")
                    .and_then(|s| uuid::Uuid::parse_str(&s).ok())
                    .map(MessageId);
                let Some(id) = id else {
                    return ToolOutcome::Reply(
                        "[error: respond_to_message requires a valid 'message_id']".to_string(),
                    );
                };
                let Some(reply) = arg_str(arguments, "reply") else {
                    return ToolOutcome::Reply(
                        "[error: respond_to_message requires 'reply']".to_string(),
                    );
                };
                match pending_replies.remove(&id) {
                    Some(responder) => {
                        responder.respond(reply);
                        ToolOutcome::Reply(format!("reply delivered for message {id}"))
                    }
                    None => ToolOutcome::Reply(format!(
                        "[error: unknown or already answered message {id}]"
                    )),
                }
            }
            AgentCapability::Escalate => {
                let reason = arg_str(arguments, "reason")
                    .unwrap_or_else(|| "unspecified".to_string());
                warn!(%conversation_id, agent_id = %instance.agent_id, %reason, "agent escalated");
                self.events.emit(
                    conversation_id,
                    CoordinationEvent::Escalated { agent_id: instance.agent_id, reason: reason.clone() },
                );
                self.persist_activity(
                    conversation_id,
                    Some(instance.agent_id),
                    "escalated",
                    json!({ "reason": reason }),
                );
                ToolOutcome::Reply("escalation recorded".to_string())
            }
        }
    }

    /// Parallel fan-out to subordinates; joins all branches before
    /// returning. Branch failures arrive as text and never abort siblings.
    async fn delegate(
        self: &Arc<Self>,
        instance: &Arc<AgentInstance>,
        profile: &AgentProfile,
        conversation_id: ConversationId,
        depth: u32,
        invocations: &InvocationCounts,
        targets: Vec<AgentId>,
        task: String,
    ) -> String {
        let unknown: Vec<AgentId> = targets
            .iter()
            .copied()
            .filter(|t| !profile.connections.contains(t))
            .collect();
        if !unknown.is_empty() {
            return format!("[error: not connected to agents {unknown:?}]");
        }

        self.set_state(conversation_id, instance, AgentState::Delegating);
        instance.declare_waiting_for(targets.iter().copied());
        self.events.emit(
            conversation_id,
            CoordinationEvent::DelegationStarted {
                agent_id: instance.agent_id,
                targets: targets.clone(),
            },
        );

        let branches = targets.iter().map(|&target| {
            self.execute(
                target,
                task.clone(),
                conversation_id,
                depth + 1,
                invocations.clone(),
                instance.cancellation.clone(),
            )
        });
        let results = join_all(branches).await;

        instance.clear_waiting_for();
        self.events.emit(
            conversation_id,
            CoordinationEvent::DelegationCompleted {
                agent_id: instance.agent_id,
                targets: targets.clone(),
            },
        );
        self.set_state(conversation_id, instance, AgentState::Running);

        let mut combined = String::new();
        for (target, result) in targets.iter().zip(results) {
            let text = match result {
                Ok(text) => text,
                Err(engine_error) => format!("[delegation to {target} failed: {engine_error}]"),
            };
            combined.push_str(&format!("[{target}]\n{text}\n\n"));
        }
        combined.trim_end().to_string()
    }

    /// Single question to one connected agent; routed like any other call.
    async fn ask(
        self: &Arc<Self>,
        instance: &Arc<AgentInstance>,
        profile: &AgentProfile,
        conversation_id: ConversationId,
        depth: u32,
        invocations: &InvocationCounts,
        target: AgentId,
        question: String,
    ) -> String {
        if !profile.connections.contains(&target) {
            return format!("[error: not connected to agent {target}]");
        }

        instance.declare_waiting_for([target]);
        let result = self
            .execute(
                target,
                question,
                conversation_id,
                depth + 1,
                invocations.clone(),
                instance.cancellation.clone(),
            )
            .await;
        instance.clear_waiting_for();

        match result {
            Ok(text) => text,
            Err(engine_error) => format!("[ask of {target} failed: {engine_error}]"),
        }
    }

    /// Block on the instance's own mailbox, observing cancellation.
    async fn wait_for_messages(
        &self,
        instance: &Arc<AgentInstance>,
        conversation_id: ConversationId,
        arguments: &serde_json::Value,
        pending_replies: &mut HashMap<MessageId, Responder>,
    ) -> ToolOutcome {
        let timeout = arguments
            .get("timeout_secs")
            .and_then(|v| v.as_u64())
            .map(std::time::Duration::from_secs);

        self.set_state(conversation_id, instance, AgentState::AwaitingMailbox);
        instance.set_receiving(true);
        let delivery = tokio::select! {
            _ = instance.cancellation.cancelled() => Some(Delivery::Shutdown),
            delivery = async {
                match timeout {
                    Some(timeout) => instance.mailbox.receive_with_timeout(timeout).await,
                    None => Some(instance.mailbox.receive().await),
                }
            } => delivery,
        };
        instance.set_receiving(false);
        instance.touch();

        match delivery {
            None => {
                self.set_state(conversation_id, instance, AgentState::Running);
                ToolOutcome::Reply("no message arrived within the timeout".to_string())
            }
            Some(Delivery::Shutdown) => ToolOutcome::EndLoop,
            Some(Delivery::Message(message)) => {
                self.set_state(conversation_id, instance, AgentState::Running);
                let text = format!(
                    "message {} received:\n{}\n\nanswer it with respond_to_message",
                    message.id, message.content
                );
                pending_replies.insert(message.id, message.responder);
                ToolOutcome::Reply(text)
            }
        }
    }

    fn set_state(
        &self,
        conversation_id: ConversationId,
        instance: &Arc<AgentInstance>,
        state: AgentState,
    ) {
        instance.set_state(state.clone());
        self.events.emit(
            conversation_id,
            CoordinationEvent::AgentStateChanged { agent_id: instance.agent_id, state },
        );
    }

    /// Fire-and-forget persistence; failures are logged, never propagated.
    fn persist_message(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        role: MessageRole,
        content: String,
        metadata: serde_json::Value,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(persist_error) = store
                .append_message(conversation_id, agent_id, role, &content, metadata)
                .await
            {
                warn!(%conversation_id, %persist_error, "failed to persist conversation message");
            }
        });
    }

    fn persist_activity(
        &self,
        conversation_id: ConversationId,
        agent_id: Option<AgentId>,
        kind: &'static str,
        detail: serde_json::Value,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Err(persist_error) = store
                .append_activity_event(conversation_id, agent_id, kind, detail)
                .await
            {
                warn!(%conversation_id, %persist_error, "failed to persist activity event");
            }
        });
    }
}

enum ToolOutcome {
    /// Feed this text back into the agent's loop as a tool turn.
    Reply(String),
    /// The mailbox shut down; end the loop cleanly.
    EndLoop,
}

fn arg_str(arguments: &serde_json::Value, key: &str) -> Option<String> {
    arguments.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

fn parse_id(s: &str) -> Option<AgentId> {
    AgentId::from_string(s).ok()
}

fn arg_id_list(arguments: &serde_json::Value, key: &str) -> Option<Vec<AgentId>> {
    let values = arguments.get(key)?.as_array()?;
    let ids: Vec<AgentId> = values
        .iter()
        .filter_map(|v| v.as_str())
        .filter_map(parse_id)
        .collect();
    if ids.is_empty() || ids.len() != values.len() {
        return None;
    }
    Some(ids)
}

/// Operation declarations handed to the model, resolved once per spawn.
fn build_tool_specs(
    capabilities: &std::collections::HashSet<AgentCapability>,
    connections: &[AgentId],
) -> Vec<ToolSpec> {
    let connection_list = connections
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    const ORDER: [AgentCapability; 6] = [
        AgentCapability::Delegate,
        AgentCapability::Ask,
        AgentCapability::SubmitResult,
        AgentCapability::WaitForMessages,
        AgentCapability::RespondToMessage,
        AgentCapability::Escalate,
    ];

    ORDER
        .iter()
        .filter(|c| capabilities.contains(*c))
        .map(|capability| match capability {
            AgentCapability::Delegate => ToolSpec {
                name: "delegate".to_string(),
                description: format!(
                    "Fan a task out to one or more connected agents in parallel and \
                     collect all of their replies. Connected agents: {connection_list}"
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "targets": { "type": "array", "items": { "type": "string" } },
                        "task": { "type": "string" }
                    },
                    "required": ["targets", "task"]
                }),
            },
            AgentCapability::Ask => ToolSpec {
                name: "ask".to_string(),
                description: format!(
                    "Ask one connected agent a question and wait for its reply. \
                     Connected agents: {connection_list}"
                ),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "target": { "type": "string" },
                        "question": { "type": "string" }
                    },
                    "required": ["target", "question"]
                }),
            },
            AgentCapability::SubmitResult => ToolSpec {
                name: "submit_result".to_string(),
                description: "Report your final result to your caller. You stay reachable \
                              for follow-up questions afterwards."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "result": { "type": "string" } },
                    "required": ["result"]
                }),
            },
            AgentCapability::WaitForMessages => ToolSpec {
                name: "wait_for_messages".to_string(),
                description: "Wait for the next message addressed to you. Optionally give \
                              up after timeout_secs."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "timeout_secs": { "type": "integer" } }
                }),
            },
            AgentCapability::RespondToMessage => ToolSpec {
                name: "respond_to_message".to_string(),
                description: "Answer a message previously received via wait_for_messages, \
                              identified by its message_id."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "message_id": { "type": "string" },
                        "reply": { "type": "string" }
                    },
                    "required": ["message_id", "reply"]
                }),
            },
            AgentCapability::Escalate => ToolSpec {
                name: "escalate".to_string(),
                description: "Flag that you are blocked and need operator attention."
                    .to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "reason": { "type": "string" } },
                    "required": ["reason"]
                }),
            },
        })
        .collect()
}

/// Best-effort safety net, not a correctness guarantee: did the agent's
/// final text claim it would wait for responses?
fn sounds_like_waiting(text: &str) -> bool {
    let lowered = text.to_lowercase();
    [
        "i'll wait",
        "i will wait",
        "waiting for",
        "wait for the response",
        "wait for their response",
        "once i hear back",
        "once they respond",
    ]
    .iter()
    .any(|phrase| lowered.contains(phrase))
}
