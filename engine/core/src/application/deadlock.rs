// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Wait-for-graph deadlock detector.
//!
//! Builds a directed graph from each instance's declared `waiting_for`
//! set and reports every agent participating in a cycle. Read-only:
//! detection makes the condition observable for operators, it does not
//! break the cycle. The detector trusts the declarations and never
//! infers blocking from mailbox state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::agent::{AgentId, ConversationId};
use crate::domain::events::CoordinationEvent;
use crate::domain::repository::EventSink;
use crate::infrastructure::pool::AgentPool;

/// Agents participating in at least one wait cycle, via iterative
/// depth-first search with an on-stack marker. A back edge to a node
/// still on the path marks every node from there to the path top.
pub fn find_cycles(graph: &HashMap<AgentId, HashSet<AgentId>>) -> Vec<AgentId> {
    let mut visited: HashSet<AgentId> = HashSet::new();
    let mut in_cycle: HashSet<AgentId> = HashSet::new();

    for &start in graph.keys() {
        if !visited.contains(&start) {
            explore(start, graph, &mut visited, &mut in_cycle);
        }
    }

    let mut participants: Vec<AgentId> = in_cycle.into_iter().collect();
    participants.sort_by_key(|id| id.0);
    participants
}

/// One traversal frame: a node's outgoing edges and the next one to take.
struct Frame {
    targets: Vec<AgentId>,
    next: usize,
}

fn frame(graph: &HashMap<AgentId, HashSet<AgentId>>, node: AgentId) -> Frame {
    Frame {
        targets: graph
            .get(&node)
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default(),
        next: 0,
    }
}

/// Depth-first traversal from `start` on an explicit frame stack, so the
/// path length is bounded by the pool and not the call stack.
fn explore(
    start: AgentId,
    graph: &HashMap<AgentId, HashSet<AgentId>>,
    visited: &mut HashSet<AgentId>,
    in_cycle: &mut HashSet<AgentId>,
) {
    let mut path = vec![start];
    let mut path_pos: HashMap<AgentId, usize> = HashMap::from([(start, 0)]);
    let mut frames = vec![frame(graph, start)];
    visited.insert(start);

    while let Some(top) = frames.last_mut() {
        let Some(&target) = top.targets.get(top.next) else {
            frames.pop();
            if let Some(node) = path.pop() {
                path_pos.remove(&node);
            }
            continue;
        };
        top.next += 1;

        // Edges to agents that declared nothing are dead ends: an
        // unblocked agent can always make progress.
        if let Some(&pos) = path_pos.get(&target) {
            // Back edge: everything from the target to the path top is on
            // a cycle.
            in_cycle.extend(path[pos..].iter().copied());
        } else if !visited.contains(&target) && graph.contains_key(&target) {
            visited.insert(target);
            path_pos.insert(target, path.len());
            path.push(target);
            frames.push(frame(graph, target));
        }
    }
}

/// Periodic detector service over the agent pool.
pub struct DeadlockDetector {
    pool: Arc<AgentPool>,
    events: Arc<dyn EventSink>,
}

impl DeadlockDetector {
    pub fn new(pool: Arc<AgentPool>, events: Arc<dyn EventSink>) -> Self {
        Self { pool, events }
    }

    /// One scan of one conversation.
    pub async fn detect(&self, conversation_id: ConversationId) -> Vec<AgentId> {
        let graph = self.pool.waiting_snapshot(conversation_id).await;
        let participants = find_cycles(&graph);
        if !participants.is_empty() {
            warn!(
                %conversation_id,
                participants = ?participants,
                "wait-for cycle detected"
            );
            self.events.emit(
                conversation_id,
                CoordinationEvent::DeadlockDetected {
                    participants: participants.clone(),
                    detected_at: Utc::now(),
                },
            );
        }
        participants
    }

    /// Scan every live conversation on an interval until cancelled.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("deadlock detector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    for conversation_id in self.pool.conversation_ids().await {
                        self.detect(conversation_id).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(AgentId, &[AgentId])]) -> HashMap<AgentId, HashSet<AgentId>> {
        edges
            .iter()
            .map(|(from, to)| (*from, to.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn empty_graph_has_no_cycles() {
        assert!(find_cycles(&HashMap::new()).is_empty());
    }

    #[test]
    fn chain_is_not_a_cycle() {
        let (a, b, c) = (AgentId::new(), AgentId::new(), AgentId::new());
        // a waits on b, b waits on c, c waits on nobody (absent).
        let g = graph(&[(a, &[b]), (b, &[c])]);
        assert!(find_cycles(&g).is_empty());
    }

    #[test]
    fn two_cycle_reports_both_participants() {
        let (a, b) = (AgentId::new(), AgentId::new());
        let g = graph(&[(a, &[b]), (b, &[a])]);
        let participants = find_cycles(&g);
        assert_eq!(participants.len(), 2);
        assert!(participants.contains(&a));
        assert!(participants.contains(&b));
    }

    #[test]
    fn self_wait_is_a_cycle() {
        let a = AgentId::new();
        let g = graph(&[(a, &[a])]);
        assert_eq!(find_cycles(&g), vec![a]);
    }

    #[test]
    fn cycle_with_attached_chain_only_reports_cycle_members() {
        let (a, b, c, d) = (AgentId::new(), AgentId::new(), AgentId::new(), AgentId::new());
        // d waits into the a->b->c->a cycle but is not part of it.
        let g = graph(&[(a, &[b]), (b, &[c]), (c, &[a]), (d, &[a])]);
        let participants = find_cycles(&g);
        assert_eq!(participants.len(), 3);
        assert!(!participants.contains(&d));
    }

    #[test]
    fn disjoint_cycles_all_reported() {
        let (a, b, c, d) = (AgentId::new(), AgentId::new(), AgentId::new(), AgentId::new());
        let g = graph(&[(a, &[b]), (b, &[a]), (c, &[d]), (d, &[c])]);
        assert_eq!(find_cycles(&g).len(), 4);
    }

    #[test]
    fn long_cycle_reports_every_participant() {
        // A ring far longer than any reasonable call depth still resolves
        // on the explicit frame stack.
        let ids: Vec<AgentId> = (0..500).map(|_| AgentId::new()).collect();
        let mut g: HashMap<AgentId, HashSet<AgentId>> = ids
            .windows(2)
            .map(|pair| (pair[0], HashSet::from([pair[1]])))
            .collect();
        g.insert(ids[499], HashSet::from([ids[0]]));
        assert_eq!(find_cycles(&g).len(), 500);
    }

    #[tokio::test]
    async fn detector_reads_pool_declarations() {
        use crate::domain::config::EngineConfig;
        use crate::infrastructure::event_bus::BroadcastEventSink;
        use crate::infrastructure::pool::AgentInstance;

        let pool = Arc::new(AgentPool::new(&EngineConfig::default()));
        let sink = Arc::new(BroadcastEventSink::new(16));
        let mut receiver = sink.subscribe();
        let detector = DeadlockDetector::new(pool.clone(), sink);

        let conversation = ConversationId::new();
        let root = CancellationToken::new();
        let (a, _ra) = AgentInstance::new(
            AgentId::new(),
            &root,
            8,
            std::time::Duration::from_secs(60),
        );
        let (b, _rb) = AgentInstance::new(
            AgentId::new(),
            &root,
            8,
            std::time::Duration::from_secs(60),
        );
        a.declare_waiting_for([b.agent_id]);
        b.declare_waiting_for([a.agent_id]);
        pool.register(conversation, a.clone()).await;
        pool.register(conversation, b.clone()).await;

        let participants = detector.detect(conversation).await;
        assert_eq!(participants.len(), 2);

        match receiver.recv().await.unwrap().event {
            CoordinationEvent::DeadlockDetected { participants, .. } => {
                assert_eq!(participants.len(), 2);
            }
            other => panic!("wrong event: {:?}", other),
        }

        // Clearing a declaration breaks the reported cycle.
        a.clear_waiting_for();
        assert!(detector.detect(conversation).await.is_empty());
    }
}
