//! Shared record types: member identity, replicated commands, node status.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role of a member within the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Full voting member.
    Voter,
    /// Non-voting member that is promoted to voter once its log catches up.
    Staging,
    /// Permanent non-voting member.
    Learner,
    /// Member that has been removed from the cluster.
    Removed,
}

/// A cluster member record as carried in conf-change entries and snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Cluster-unique member id.
    pub id: u64,
    /// Network address the member's transport listens on.
    pub address: String,
    /// Membership role.
    pub kind: MemberKind,
}

impl MemberInfo {
    /// A voter record.
    pub fn voter(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Voter,
        }
    }

    /// A staging record, promoted automatically once caught up.
    pub fn staging(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Staging,
        }
    }

    /// A learner record.
    pub fn learner(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            kind: MemberKind::Learner,
        }
    }
}

/// Payload of a normal log entry: a client command plus the change id its
/// proposer waits on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Replicate {
    pub cid: u64,
    pub data: Vec<u8>,
}

/// Role of the local protocol core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Accepts log entries from the leader.
    Follower,
    /// Requesting votes for leader election.
    Candidate,
    /// Handles client requests and replicates the log.
    Leader,
    /// Pre-vote phase before becoming candidate.
    PreCandidate,
}

impl From<raft::StateRole> for NodeRole {
    fn from(role: raft::StateRole) -> Self {
        match role {
            raft::StateRole::Follower => NodeRole::Follower,
            raft::StateRole::Candidate => NodeRole::Candidate,
            raft::StateRole::Leader => NodeRole::Leader,
            raft::StateRole::PreCandidate => NodeRole::PreCandidate,
        }
    }
}

/// Replication progress of a single peer, as seen by the leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PeerProgress {
    /// Highest log index known to be replicated on the peer.
    pub matched: u64,
}

/// Point-in-time view of the local node.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftStatus {
    /// Local member id.
    pub id: u64,
    /// Current term.
    pub term: u64,
    /// Current leader, if one is known.
    pub leader_id: Option<u64>,
    /// Local role.
    pub role: NodeRole,
    /// Highest log index applied to the application state machine.
    pub applied_index: u64,
    /// Highest log index covered by a persisted snapshot.
    pub snapshot_index: u64,
    /// Per-peer replication progress. Empty unless this node is the leader.
    pub progress: HashMap<u64, PeerProgress>,
}

impl RaftStatus {
    /// Whether the local node currently leads the cluster.
    pub fn is_leader(&self) -> bool {
        self.role == NodeRole::Leader
    }
}
