//! Engine configuration.

use std::time::Duration;

use tokio::sync::watch;

use crate::types::NodeRole;

/// Configuration for a single engine instance.
pub struct Config {
    /// Local member id. When zero, a stable id is derived from the address
    /// at first start.
    pub id: u64,

    /// Interval between protocol ticks. Election and heartbeat timeouts are
    /// multiples of this.
    pub tick_interval: Duration,

    /// Number of ticks without a heartbeat before starting an election.
    pub election_tick: usize,

    /// Number of ticks between leader heartbeats.
    pub heartbeat_tick: usize,

    /// Number of applied entries between automatic snapshots. Also the
    /// number of trailing entries kept in the log after compaction.
    pub snap_interval: u64,

    /// Grace period for the self-initiated shutdown taken when this member
    /// is removed from the cluster.
    pub drain_timeout: Duration,

    /// Capacity of each ingress buffer (proposals and peer messages).
    pub ingress_capacity: usize,

    /// Maximum byte size of a single append message.
    pub max_size_per_msg: u64,

    /// Maximum number of in-flight append messages.
    pub max_inflight_msgs: usize,

    /// Number of snapshot files retained on disk.
    pub max_snapshot_files: usize,

    /// Optional channel publishing role changes. Only the most recent role
    /// is retained; a slow consumer never blocks the engine.
    pub state_change: Option<watch::Sender<NodeRole>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            id: 0,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 1,
            snap_interval: 1000,
            drain_timeout: Duration::from_secs(10),
            ingress_capacity: 4096,
            max_size_per_msg: 1024 * 1024,
            max_inflight_msgs: 256,
            max_snapshot_files: 5,
            state_change: None,
        }
    }
}

impl Config {
    /// Convert to the protocol core's configuration.
    pub(crate) fn to_raft_config(&self, id: u64, applied: u64) -> raft::Config {
        raft::Config {
            id,
            applied,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            max_size_per_msg: self.max_size_per_msg,
            max_inflight_msgs: self.max_inflight_msgs,
            pre_vote: true,
            ..Default::default()
        }
    }
}
