//! Durable storage contracts and the sled-backed implementation.
//!
//! The engine needs two views of the same store: the protocol core reads
//! entries and terms through [`raft::Storage`], while the event loop appends
//! entries, saves snapshots, and compacts through [`Storage`]. Both views
//! share one handle, so [`SharedStorage`] wraps an `Arc<dyn Storage>` and
//! delegates the read side into the core.

mod sled_store;
mod snapshotter;

pub use sled_store::SledStorage;
pub use snapshotter::FileSnapshotter;

use std::sync::Arc;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::MemberInfo;

/// A complete snapshot as written to disk: the raw protocol snapshot
/// header, the membership roster at that index, and the application
/// payload.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    /// Protocol snapshot (term, index, conf state).
    pub raw: Snapshot,
    /// Members of the cluster at the snapshot index.
    pub members: Vec<MemberInfo>,
    /// Application payload from [`StateMachine::snapshot`](crate::StateMachine::snapshot).
    pub data: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotFileRepr {
    raw: Vec<u8>,
    members: Vec<MemberInfo>,
    data: Vec<u8>,
}

impl SnapshotFile {
    /// Encode for storage on disk or inline transfer inside `MsgSnapshot`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let repr = SnapshotFileRepr {
            raw: self.raw.write_to_bytes()?,
            members: self.members.clone(),
            data: self.data.clone(),
        };
        Ok(bincode::serialize(&repr)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let repr: SnapshotFileRepr = bincode::deserialize(bytes)?;
        let mut raw = Snapshot::default();
        raw.merge_from_bytes(&repr.raw)?;
        Ok(Self {
            raw,
            members: repr.members,
            data: repr.data,
        })
    }

    /// Index covered by this snapshot.
    pub fn index(&self) -> u64 {
        self.raw.get_metadata().index
    }

    /// Term of the entry at the snapshot index.
    pub fn term(&self) -> u64 {
        self.raw.get_metadata().term
    }
}

/// State recovered from storage at boot.
#[derive(Debug, Default)]
pub struct BootInfo {
    /// Opaque metadata stored at first boot (the local member record).
    pub meta: Vec<u8>,
    /// Last persisted hard state.
    pub hard_state: HardState,
    /// Log entries still present after the last compaction.
    pub entries: Vec<Entry>,
    /// Newest snapshot file, if any.
    pub snapshot: Option<SnapshotFile>,
}

/// Reads and writes snapshot files.
pub trait Snapshotter: Send + Sync {
    /// Persist a snapshot file.
    fn write(&self, snap: &SnapshotFile) -> Result<()>;

    /// Load the snapshot file for the given term and index.
    fn read(&self, term: u64, index: u64) -> Result<SnapshotFile>;

    /// Load the newest available snapshot file.
    fn read_newest(&self) -> Result<Option<SnapshotFile>>;
}

/// Durable storage for raft state.
///
/// The read-side methods mirror [`raft::Storage`] so one implementation
/// serves both the protocol core and the engine.
pub trait Storage: Send + Sync + 'static {
    // Read side.
    fn initial_state(&self) -> raft::Result<RaftState>;
    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: Option<u64>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>>;
    fn term(&self, idx: u64) -> raft::Result<u64>;
    fn first_index(&self) -> raft::Result<u64>;
    fn last_index(&self) -> raft::Result<u64>;
    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot>;

    /// Seed the voter/learner sets of a fresh store. Fails on a store that
    /// already holds state.
    fn initialize_with_conf_state(&self, cs: &ConfState) -> Result<()>;

    /// Durably append entries and persist the hard state. Entries already
    /// present at or after the first appended index are replaced.
    fn save_entries(&self, hs: Option<&HardState>, entries: &[Entry]) -> Result<()>;

    /// Persist a snapshot header.
    fn save_snapshot(&self, snap: &Snapshot) -> Result<()>;

    /// Install a snapshot: drop covered entries and advance the first index.
    fn apply_snapshot(&self, snap: &Snapshot) -> Result<()>;

    /// Create a snapshot header at `index` with the given conf state.
    fn create_snapshot(&self, index: u64, cs: &ConfState, data: Vec<u8>) -> Result<Snapshot>;

    /// Discard entries before `compact_index`.
    fn compact(&self, compact_index: u64) -> Result<()>;

    /// Latest persisted snapshot header.
    fn snapshot_header(&self) -> Result<Snapshot>;

    /// Snapshot file reader/writer.
    fn snapshotter(&self) -> &dyn Snapshotter;

    /// Recover persisted state, creating a fresh store with `meta` when none
    /// exists yet.
    fn boot(&self, meta: &[u8]) -> Result<BootInfo>;

    /// Whether the store held state before this process opened it.
    fn exist(&self) -> bool;

    /// Flush and release the store.
    fn close(&self) -> Result<()>;
}

/// Shared handle letting the protocol core read from the storage the engine
/// writes.
#[derive(Clone)]
pub struct SharedStorage(pub Arc<dyn Storage>);

impl raft::Storage for SharedStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.0.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.0.entries(low, high, max_size.into(), context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.0.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.0.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.0.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        self.0.snapshot(request_index, to)
    }
}
