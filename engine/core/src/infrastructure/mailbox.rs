// Copyright (c) 2026 Conclave Labs
// SPDX-License-Identifier: AGPL-3.0

//! Single-recipient rendezvous mailbox.
//!
//! Multi-producer, single-consumer, bounded, with message expiry. Every
//! `send` future completes with exactly one [`SendOutcome`]: a reply, or a
//! sentinel for shutdown, queue overflow, or TTL expiry. A producer never
//! blocks indefinitely on a full queue and never hangs on a dead recipient.
//!
//! All mutation happens inside one critical section, so a send racing a
//! receive neither loses the message nor delivers it twice.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::domain::agent::MessageId;

/// Terminal outcome observed by a sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The recipient replied.
    Replied(String),
    /// The mailbox was shut down before a reply was produced, or the
    /// recipient went away without responding.
    ShutDown,
    /// Evicted as the oldest message when the bounded queue overflowed.
    Dropped,
    /// Unclaimed longer than the mailbox TTL.
    Expired,
}

/// What a `receive` call yields.
#[derive(Debug)]
pub enum Delivery {
    Message(MailboxMessage),
    /// Distinguished sentinel: the mailbox is shut down and will never
    /// deliver again.
    Shutdown,
}

/// A message handed to the recipient. The responder stays valid after the
/// message leaves the queue, so a reply can be sent asynchronously later,
/// correlated by `id`.
#[derive(Debug)]
pub struct MailboxMessage {
    pub id: MessageId,
    pub content: String,
    pub sent_at: Instant,
    pub responder: Responder,
}

/// Single-use reply handle. Resolving twice is a no-op, not an error.
#[derive(Debug)]
pub struct Responder {
    id: MessageId,
    tx: parking_lot::Mutex<Option<oneshot::Sender<SendOutcome>>>,
}

impl Responder {
    fn new(id: MessageId, tx: oneshot::Sender<SendOutcome>) -> Self {
        Self { id, tx: parking_lot::Mutex::new(Some(tx)) }
    }

    pub fn message_id(&self) -> MessageId {
        self.id
    }

    /// Complete the sender's pending future with a reply. Returns `false`
    /// when the message was already resolved.
    pub fn respond(&self, reply: impl Into<String>) -> bool {
        self.resolve(SendOutcome::Replied(reply.into()))
    }

    fn resolve(&self, outcome: SendOutcome) -> bool {
        match self.tx.lock().take() {
            // Send failure means the sender stopped waiting; the outcome
            // still counts as delivered once.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }
}

struct Inner {
    queue: VecDeque<MailboxMessage>,
    waiter: Option<oneshot::Sender<Delivery>>,
    shut_down: bool,
}

/// Mailbox serving exactly one logical recipient.
pub struct Mailbox {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl Mailbox {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                waiter: None,
                shut_down: false,
            }),
            capacity,
            ttl,
        }
    }

    /// Enqueue a message and wait for the recipient's reply.
    pub async fn send(&self, content: impl Into<String>) -> SendOutcome {
        let id = MessageId::new();
        let (tx, rx) = oneshot::channel();
        let message = MailboxMessage {
            id,
            content: content.into(),
            sent_at: Instant::now(),
            responder: Responder::new(id, tx),
        };

        {
            let mut inner = self.inner.lock().await;
            if inner.shut_down {
                return SendOutcome::ShutDown;
            }
            Self::purge(&mut inner, self.ttl);

            // Hand straight to a pending waiter when one exists.
            let message = match inner.waiter.take() {
                Some(waiter) => match waiter.send(Delivery::Message(message)) {
                    Ok(()) => None,
                    // Waiter future was dropped without deregistering;
                    // fall back to queueing.
                    Err(Delivery::Message(message)) => Some(message),
                    Err(Delivery::Shutdown) => unreachable!("waiter handed a sent message"),
                },
                None => Some(message),
            };

            if let Some(message) = message {
                if inner.queue.len() >= self.capacity {
                    if let Some(evicted) = inner.queue.pop_front() {
                        warn!(message_id = %evicted.id, "mailbox overflow, dropping oldest message");
                        evicted.responder.resolve(SendOutcome::Dropped);
                    }
                }
                inner.queue.push_back(message);
            }
        }

        rx.await.unwrap_or(SendOutcome::ShutDown)
    }

    /// Dequeue the next message, suspending until one arrives or the
    /// mailbox shuts down.
    pub async fn receive(&self) -> Delivery {
        let rx = {
            let mut inner = self.inner.lock().await;
            match self.claim_or_register(&mut inner) {
                Ok(delivery) => return delivery,
                Err(rx) => rx,
            }
        };
        rx.await.unwrap_or(Delivery::Shutdown)
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    ///
    /// A message arriving concurrently with the timeout firing is delivered
    /// to exactly one of the two: the "which fires first" decision is made
    /// under the mailbox lock.
    pub async fn receive_with_timeout(&self, timeout: Duration) -> Option<Delivery> {
        let rx = {
            let mut inner = self.inner.lock().await;
            match self.claim_or_register(&mut inner) {
                Ok(delivery) => return Some(delivery),
                Err(rx) => rx,
            }
        };

        let mut rx = std::pin::pin!(rx);
        tokio::select! {
            delivery = &mut rx => Some(delivery.unwrap_or(Delivery::Shutdown)),
            _ = tokio::time::sleep(timeout) => {
                let mut inner = self.inner.lock().await;
                match inner.waiter.take() {
                    // Timeout won: our sender half is still registered.
                    Some(_stale) => None,
                    // A sender (or shutdown) claimed the waiter first; the
                    // delivery is already in flight on the channel.
                    None => {
                        drop(inner);
                        Some(rx.await.unwrap_or(Delivery::Shutdown))
                    }
                }
            }
        }
    }

    /// Idempotent. Wakes the pending waiter with [`Delivery::Shutdown`] and
    /// resolves every still-queued message with [`SendOutcome::ShutDown`].
    /// All later sends and receives return sentinels immediately.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if inner.shut_down {
            return;
        }
        inner.shut_down = true;
        if let Some(waiter) = inner.waiter.take() {
            let _ = waiter.send(Delivery::Shutdown);
        }
        for message in inner.queue.drain(..) {
            message.responder.resolve(SendOutcome::ShutDown);
        }
        debug!("mailbox shut down");
    }

    /// Evict messages that outlived the TTL. Called internally on every
    /// send/receive and periodically by the pool sweeper so senders observe
    /// expiry even when the recipient never receives.
    pub async fn purge_expired(&self) {
        let mut inner = self.inner.lock().await;
        Self::purge(&mut inner, self.ttl);
    }

    /// Queued (undelivered) message count.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_shut_down(&self) -> bool {
        self.inner.lock().await.shut_down
    }

    /// Either pop a queued message / observe shutdown, or register the one
    /// pending waiter and hand back its receiving half.
    fn claim_or_register(
        &self,
        inner: &mut Inner,
    ) -> Result<Delivery, oneshot::Receiver<Delivery>> {
        if inner.shut_down {
            return Ok(Delivery::Shutdown);
        }
        Self::purge(inner, self.ttl);
        if let Some(message) = inner.queue.pop_front() {
            return Ok(Delivery::Message(message));
        }
        let (tx, rx) = oneshot::channel();
        // One recipient contract: a replaced waiter resolves as shutdown.
        inner.waiter = Some(tx);
        Err(rx)
    }

    fn purge(inner: &mut Inner, ttl: Duration) {
        // FIFO arrival order makes a front-only scan sufficient.
        while inner
            .queue
            .front()
            .is_some_and(|m| m.sent_at.elapsed() > ttl)
        {
            let expired = inner.queue.pop_front().expect("front checked above");
            warn!(message_id = %expired.id, "mailbox message expired before delivery");
            expired.responder.resolve(SendOutcome::Expired);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_completes_with_reply() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

        let mb = mailbox.clone();
        let recipient = tokio::spawn(async move {
            match mb.receive().await {
                Delivery::Message(message) => {
                    assert_eq!(message.content, "status?");
                    assert!(message.responder.respond("all green"));
                }
                Delivery::Shutdown => panic!("unexpected shutdown"),
            }
        });

        let outcome = mailbox.send("status?").await;
        assert_eq!(outcome, SendOutcome::Replied("all green".to_string()));
        recipient.await.unwrap();
    }

    #[tokio::test]
    async fn send_completes_under_shutdown() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

        // Queued before shutdown: resolved with the shutdown sentinel.
        let mb = mailbox.clone();
        let pending = tokio::spawn(async move { mb.send("never answered").await });
        tokio::task::yield_now().await;

        mailbox.shutdown().await;
        assert_eq!(pending.await.unwrap(), SendOutcome::ShutDown);

        // Sent after shutdown: immediate sentinel, no hang.
        assert_eq!(mailbox.send("too late").await, SendOutcome::ShutDown);
    }

    #[tokio::test]
    async fn send_completes_under_overflow() {
        let mailbox = std::sync::Arc::new(Mailbox::new(1, Duration::from_secs(60)));

        let mb = mailbox.clone();
        let first = tokio::spawn(async move { mb.send("first").await });
        tokio::task::yield_now().await;

        // Second send evicts the first (capacity 1); the evicted sender
        // observes the overflow sentinel rather than blocking.
        let mb = mailbox.clone();
        let second = tokio::spawn(async move { mb.send("second").await });
        tokio::task::yield_now().await;

        assert_eq!(first.await.unwrap(), SendOutcome::Dropped);
        assert_eq!(mailbox.len().await, 1);

        match mailbox.receive().await {
            Delivery::Message(message) => {
                assert_eq!(message.content, "second");
                message.responder.respond("ok");
            }
            Delivery::Shutdown => panic!("unexpected shutdown"),
        }
        assert_eq!(second.await.unwrap(), SendOutcome::Replied("ok".to_string()));
    }

    #[tokio::test]
    async fn send_completes_under_ttl_expiry() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_millis(20)));

        let mb = mailbox.clone();
        let stale = tokio::spawn(async move { mb.send("stale").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        mailbox.purge_expired().await;
        assert_eq!(stale.await.unwrap(), SendOutcome::Expired);
        assert!(mailbox.is_empty().await);
    }

    #[tokio::test]
    async fn receive_with_timeout_returns_none_when_idle() {
        let mailbox = Mailbox::new(8, Duration::from_secs(60));
        let delivery = mailbox.receive_with_timeout(Duration::from_millis(20)).await;
        assert!(delivery.is_none());
        // Waiter slot is cleared; a later send queues instead of racing a
        // dead waiter.
        assert!(mailbox.inner.lock().await.waiter.is_none());
    }

    #[tokio::test]
    async fn concurrent_send_and_timeout_deliver_exactly_once() {
        // Race a receive_with_timeout against a send landing near the
        // deadline, many times. The message must go to exactly one of
        // {delivery, queue}: never both, never neither.
        for _ in 0..50 {
            let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

            let mb = mailbox.clone();
            let receiver =
                tokio::spawn(
                    async move { mb.receive_with_timeout(Duration::from_millis(2)).await },
                );

            let mb = mailbox.clone();
            let sender = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                mb.send("racy").await
            });

            let received = receiver.await.unwrap();
            let delivered_live = matches!(received, Some(Delivery::Message(ref m)) if m.content == "racy");
            if let Some(Delivery::Message(message)) = received {
                message.responder.respond("done");
            }

            let queued = mailbox.len().await;
            if delivered_live {
                assert_eq!(queued, 0, "delivered message must not also be queued");
                assert_eq!(sender.await.unwrap(), SendOutcome::Replied("done".to_string()));
            } else {
                // Timeout won; the send must have queued (or is about to
                // resolve via shutdown below), never vanished.
                mailbox.shutdown().await;
                assert_eq!(sender.await.unwrap(), SendOutcome::ShutDown);
            }
        }
    }

    #[tokio::test]
    async fn shutdown_wakes_pending_receiver() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

        let mb = mailbox.clone();
        let receiver = tokio::spawn(async move { mb.receive().await });
        tokio::task::yield_now().await;

        mailbox.shutdown().await;
        assert!(matches!(receiver.await.unwrap(), Delivery::Shutdown));

        // Idempotent, and receive never blocks post-shutdown.
        mailbox.shutdown().await;
        assert!(matches!(mailbox.receive().await, Delivery::Shutdown));
    }

    #[tokio::test]
    async fn responder_is_idempotent() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

        let mb = mailbox.clone();
        let sender = tokio::spawn(async move { mb.send("ping").await });
        tokio::task::yield_now().await;

        match mailbox.receive().await {
            Delivery::Message(message) => {
                assert!(message.responder.respond("pong"));
                assert!(!message.responder.respond("pong again"));
            }
            Delivery::Shutdown => panic!("unexpected shutdown"),
        }
        assert_eq!(sender.await.unwrap(), SendOutcome::Replied("pong".to_string()));
    }

    #[tokio::test]
    async fn queued_messages_deliver_in_fifo_order() {
        let mailbox = std::sync::Arc::new(Mailbox::new(8, Duration::from_secs(60)));

        for content in ["one", "two", "three"] {
            let mb = mailbox.clone();
            tokio::spawn(async move { mb.send(content).await });
            tokio::task::yield_now().await;
        }

        for expected in ["one", "two", "three"] {
            match mailbox.receive().await {
                Delivery::Message(message) => {
                    assert_eq!(message.content, expected);
                    message.responder.respond("ack");
                }
                Delivery::Shutdown => panic!("unexpected shutdown"),
            }
        }
    }
}
