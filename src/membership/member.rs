//! A single cluster member.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use raft::eraftpb::Message;

use crate::error::{RaftError, Result};
use crate::transport::Transport;
use crate::types::{MemberInfo, MemberKind};

/// A member of the cluster as tracked by the pool.
///
/// Remote members deliver through the pool's transport and track liveness
/// from send outcomes. The local member never sends; the engine steps
/// self-addressed messages directly.
pub struct Member {
    info: RwLock<MemberInfo>,
    transport: Option<Arc<dyn Transport>>,
    active: AtomicBool,
    active_since: Mutex<Option<Instant>>,
}

impl Member {
    pub(crate) fn remote(info: MemberInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            info: RwLock::new(info),
            transport: Some(transport),
            active: AtomicBool::new(true),
            active_since: Mutex::new(None),
        }
    }

    pub(crate) fn local(info: MemberInfo) -> Self {
        Self {
            info: RwLock::new(info),
            transport: None,
            active: AtomicBool::new(true),
            active_since: Mutex::new(Some(Instant::now())),
        }
    }

    pub fn id(&self) -> u64 {
        self.info.read().id
    }

    pub fn address(&self) -> String {
        self.info.read().address.clone()
    }

    pub fn kind(&self) -> MemberKind {
        self.info.read().kind
    }

    /// The member record as carried in conf changes and snapshots.
    pub fn raw(&self) -> MemberInfo {
        self.info.read().clone()
    }

    pub fn is_local(&self) -> bool {
        self.transport.is_none()
    }

    /// Whether the last delivery attempt succeeded. The local member is
    /// always active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// When the member was first reached, if ever.
    pub fn active_since(&self) -> Option<Instant> {
        *self.active_since.lock()
    }

    pub(crate) fn update(&self, info: MemberInfo) {
        *self.info.write() = info;
    }

    /// Deliver a protocol message to this member.
    pub async fn send(&self, msg: Message) -> Result<()> {
        let Some(transport) = &self.transport else {
            return Err(RaftError::Membership(
                "cannot send to the local member".into(),
            ));
        };

        let info = self.raw();
        match transport.send(&info, msg).await {
            Ok(()) => {
                self.active.store(true, Ordering::Release);
                self.active_since.lock().get_or_insert_with(Instant::now);
                Ok(())
            }
            Err(e) => {
                self.active.store(false, Ordering::Release);
                Err(RaftError::Transport(e.to_string()))
            }
        }
    }
}
