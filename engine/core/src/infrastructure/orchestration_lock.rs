// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Per-conversation single-flight orchestration lock.
//!
//! A second top-level run on a conversation while one is in flight would
//! double-deliver the user's message into the hierarchy, so it is refused.
//! A crashed run must not wedge the conversation forever: a lock older
//! than the timeout is treated as abandoned and silently replaced.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::domain::agent::ConversationId;

#[derive(Debug, Clone)]
struct LockEntry {
    acquired_at: Instant,
    holder: String,
}

pub struct OrchestrationLocks {
    locks: parking_lot::Mutex<HashMap<ConversationId, LockEntry>>,
    timeout: Duration,
}

impl OrchestrationLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: parking_lot::Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Atomic check-and-set. Installs the lock when none exists or the
    /// existing one has expired; otherwise returns `false` with no side
    /// effects.
    pub fn try_acquire(&self, conversation_id: ConversationId, holder: &str) -> bool {
        let mut locks = self.locks.lock();
        match locks.get(&conversation_id) {
            Some(entry) if entry.acquired_at.elapsed() <= self.timeout => false,
            existing => {
                if let Some(stale) = existing {
                    warn!(
                        %conversation_id,
                        previous_holder = %stale.holder,
                        age_secs = stale.acquired_at.elapsed().as_secs(),
                        "stealing expired orchestration lock"
                    );
                }
                locks.insert(
                    conversation_id,
                    LockEntry { acquired_at: Instant::now(), holder: holder.to_string() },
                );
                debug!(%conversation_id, holder, "orchestration lock acquired");
                true
            }
        }
    }

    /// Idempotent.
    pub fn release(&self, conversation_id: ConversationId) {
        if self.locks.lock().remove(&conversation_id).is_some() {
            debug!(%conversation_id, "orchestration lock released");
        }
    }

    /// Current holder of a live (non-expired) lock, for diagnostics.
    pub fn holder(&self, conversation_id: ConversationId) -> Option<String> {
        self.locks
            .lock()
            .get(&conversation_id)
            .filter(|e| e.acquired_at.elapsed() <= self.timeout)
            .map(|e| e.holder.clone())
    }
}
