//! In-process transport: delivers messages into per-member mailboxes.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use raft::eraftpb::Message;
use tokio::sync::mpsc;

use crate::types::MemberInfo;

use super::{Transport, TransportError};

/// A shared router for clusters living inside one process.
///
/// Each member registers a mailbox under its id; sends from any member are
/// delivered there. Unregistering makes the member unreachable, which is
/// how tests take nodes down.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<DashMap<u64, mpsc::Sender<Message>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mailbox for `id` and return its receiving end.
    pub fn register(&self, id: u64, capacity: usize) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.routes.insert(id, tx);
        rx
    }

    /// Drop the route to `id`.
    pub fn unregister(&self, id: u64) {
        self.routes.remove(&id);
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, to: &MemberInfo, msg: Message) -> Result<(), TransportError> {
        let tx = self
            .routes
            .get(&to.id)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(to.id))?;
        tx.send(msg)
            .await
            .map_err(|_| TransportError::Closed(to.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::eraftpb::MessageType;

    fn msg(to: u64) -> Message {
        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgHeartbeat);
        m.to = to;
        m
    }

    #[tokio::test]
    async fn delivers_to_registered_mailbox() {
        let net = LocalNetwork::new();
        let mut rx = net.register(2, 16);

        net.send(&MemberInfo::voter(2, "local"), msg(2))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.to, 2);
    }

    #[tokio::test]
    async fn unknown_member_is_unreachable() {
        let net = LocalNetwork::new();
        let err = net
            .send(&MemberInfo::voter(9, "local"), msg(9))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(9)));
    }

    #[tokio::test]
    async fn unregister_cuts_the_route() {
        let net = LocalNetwork::new();
        let _rx = net.register(3, 16);
        net.unregister(3);
        assert!(net
            .send(&MemberInfo::voter(3, "local"), msg(3))
            .await
            .is_err());
    }
}
