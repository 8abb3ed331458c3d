//! Cluster membership pool.
//!
//! The pool tracks every known member and its transport liveness. The
//! engine keeps it consistent with committed conf changes: additions are
//! upserts (a record for an existing id updates it in place, which also
//! carries staging → voter promotions), removals leave a tombstone so a
//! removed member is never re-registered from a stale record.

mod member;

pub use member::Member;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{RaftError, Result};
use crate::transport::Transport;
use crate::types::{MemberInfo, MemberKind};

/// The set of cluster members known to the local node.
pub struct Pool {
    transport: Arc<dyn Transport>,
    members: DashMap<u64, Arc<Member>>,
    removed: DashMap<u64, ()>,
    local_id: AtomicU64,
    closed: AtomicBool,
}

impl Pool {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            members: DashMap::new(),
            removed: DashMap::new(),
            local_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn set_local_id(&self, id: u64) {
        self.local_id.store(id, Ordering::Release);
    }

    pub fn local_id(&self) -> u64 {
        self.local_id.load(Ordering::Acquire)
    }

    /// All known members.
    pub fn members(&self) -> Vec<Arc<Member>> {
        self.members.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn get(&self, id: u64) -> Option<Arc<Member>> {
        self.members.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Register or update a member.
    pub fn add(&self, info: MemberInfo) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RaftError::Stopped);
        }
        if self.removed.contains_key(&info.id) {
            return Err(RaftError::Membership(format!(
                "member {:x} was removed from the cluster",
                info.id
            )));
        }
        if info.kind == MemberKind::Removed {
            self.removed.insert(info.id, ());
            self.members.remove(&info.id);
            return Ok(());
        }

        if let Some(existing) = self.members.get(&info.id) {
            existing.update(info);
            return Ok(());
        }

        let member = if info.id == self.local_id() {
            Member::local(info)
        } else {
            Member::remote(info, Arc::clone(&self.transport))
        };
        self.members.insert(member.id(), Arc::new(member));
        Ok(())
    }

    /// Update an existing member.
    pub fn update(&self, info: MemberInfo) -> Result<()> {
        match self.members.get(&info.id) {
            Some(existing) => {
                existing.update(info);
                Ok(())
            }
            None => Err(RaftError::Membership(format!(
                "unknown member {:x}",
                info.id
            ))),
        }
    }

    /// Remove a member, leaving a tombstone.
    pub fn remove(&self, id: u64) -> Result<()> {
        self.removed.insert(id, ());
        self.members.remove(&id);
        Ok(())
    }

    /// The roster as stored in snapshot files. Tombstones are carried as
    /// removed records.
    pub fn snapshot(&self) -> Vec<MemberInfo> {
        let mut roster: Vec<MemberInfo> = self.members.iter().map(|e| e.value().raw()).collect();
        roster.extend(self.removed.iter().map(|e| MemberInfo {
            id: *e.key(),
            address: String::new(),
            kind: MemberKind::Removed,
        }));
        roster.sort_by_key(|m| m.id);
        roster
    }

    /// Replace the roster with one recovered from a snapshot.
    pub fn restore(&self, roster: Vec<MemberInfo>) {
        self.members.clear();
        self.removed.clear();
        for info in roster {
            if let Err(e) = self.add(info) {
                tracing::warn!("restoring pool member: {e}");
            }
        }
    }

    /// Drop every member and refuse further registration.
    pub fn tear_down(&self) {
        self.closed.store(true, Ordering::Release);
        self.members.clear();
    }
}
