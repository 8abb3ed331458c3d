//! Single-shot request/reply rendezvous keyed by 64-bit ids.
//!
//! Waiters subscribe once under an id; the event loop broadcasts the outcome
//! when the matching entry commits (or fails). A global broadcast path wakes
//! every waiter at once when the cluster loses its leader.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{RaftError, Result};

/// Value delivered to a subscription: a leader index for read-index
/// requests, zero for plain completion, or the failure.
pub(crate) type Payload = Result<u64>;

/// Id-keyed map of one-shot reply sinks.
pub(crate) struct MsgBus {
    shared: Arc<Shared>,
}

struct Shared {
    subs: DashMap<u64, oneshot::Sender<Payload>>,
    closed: AtomicBool,
}

impl MsgBus {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                subs: DashMap::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a single-use receiver for `id`.
    ///
    /// On a closed bus the subscription resolves immediately as stopped.
    pub(crate) fn subscribe_once(&self, id: u64) -> Subscription {
        let (tx, rx) = oneshot::channel();
        if !self.shared.closed.load(Ordering::Acquire) {
            self.shared.subs.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Deliver `value` to the subscription for `id`, if any. Never blocks.
    pub(crate) fn broadcast(&self, id: u64, value: Payload) {
        if let Some((_, tx)) = self.shared.subs.remove(&id) {
            let _ = tx.send(value);
        }
    }

    /// Deliver `err` to every live subscription.
    pub(crate) fn broadcast_err_to_all(&self, err: RaftError) {
        let ids: Vec<u64> = self.shared.subs.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.shared.subs.remove(&id) {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }

    /// Release all subscriptions and refuse further ones. Pending waiters
    /// resolve as stopped.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.subs.clear();
    }
}

/// A single-use receiver registered on the bus.
///
/// Dropping the subscription releases its slot; release is idempotent.
pub(crate) struct Subscription {
    id: u64,
    rx: oneshot::Receiver<Payload>,
    shared: Arc<Shared>,
}

impl Subscription {
    /// The receive channel. Resolves with the broadcast payload, or an error
    /// once the bus drops the sender (unsubscribed or closed).
    pub(crate) fn chan(&mut self) -> &mut oneshot::Receiver<Payload> {
        &mut self.rx
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.subs.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_reaches_subscriber() {
        let bus = MsgBus::new();
        let mut sub = bus.subscribe_once(7);
        bus.broadcast(7, Ok(42));
        assert_eq!(sub.chan().await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn broadcast_without_subscriber_is_noop() {
        let bus = MsgBus::new();
        bus.broadcast(1, Ok(0));
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = MsgBus::new();
        {
            let _sub = bus.subscribe_once(9);
        }
        assert!(bus.shared.subs.is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_all_delivers_error() {
        let bus = MsgBus::new();
        let mut a = bus.subscribe_once(1);
        let mut b = bus.subscribe_once(2);
        bus.broadcast_err_to_all(RaftError::NoLeader);
        assert!(matches!(
            a.chan().await.unwrap(),
            Err(RaftError::NoLeader)
        ));
        assert!(matches!(
            b.chan().await.unwrap(),
            Err(RaftError::NoLeader)
        ));
    }

    #[tokio::test]
    async fn close_wakes_pending_waiters() {
        let bus = MsgBus::new();
        let mut sub = bus.subscribe_once(3);
        bus.close();
        assert!(sub.chan().await.is_err());
        // Subscriptions taken after close resolve the same way.
        let mut late = bus.subscribe_once(4);
        assert!(late.chan().await.is_err());
    }
}
