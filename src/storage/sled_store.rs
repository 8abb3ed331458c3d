//! Raft storage backed by sled.
//!
//! # Layout
//!
//! ```text
//! <dir>/db              sled database
//! ├── entries/          log entries (key: index, big-endian)
//! └── state/            node state
//!     ├── hard_state    HardState (term, vote, commit)
//!     ├── conf_state    ConfState (voters, learners)
//!     ├── snapshot      newest snapshot header
//!     ├── first_index   u64
//!     └── meta          opaque boot metadata
//! <dir>/snap/           snapshot files (see FileSnapshotter)
//! ```

use std::path::Path;

use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{Error as RaftCoreError, GetEntriesContext, RaftState, StorageError as RaftStorageError};

use crate::error::{RaftError, Result};

use super::{BootInfo, FileSnapshotter, SnapshotFile, Snapshotter, Storage};

const TREE_ENTRIES: &str = "entries";
const TREE_STATE: &str = "state";

const KEY_HARD_STATE: &[u8] = b"hard_state";
const KEY_CONF_STATE: &[u8] = b"conf_state";
const KEY_SNAPSHOT: &[u8] = b"snapshot";
const KEY_FIRST_INDEX: &[u8] = b"first_index";
const KEY_META: &[u8] = b"meta";

/// Durable raft storage over a sled database plus a snapshot-file
/// directory.
pub struct SledStorage {
    db: sled::Db,
    entries: sled::Tree,
    state: sled::Tree,
    shoter: FileSnapshotter,
    recovered: bool,
}

impl SledStorage {
    /// Open or create the store under `dir`, retaining at most
    /// `max_snapshot_files` snapshot files.
    pub fn open(dir: impl AsRef<Path>, max_snapshot_files: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let db = sled::open(dir.join("db"))?;
        let recovered = db.was_recovered();
        let entries = db.open_tree(TREE_ENTRIES)?;
        let state = db.open_tree(TREE_STATE)?;
        let shoter = FileSnapshotter::new(dir.join("snap"), max_snapshot_files)?;
        Ok(Self {
            db,
            entries,
            state,
            shoter,
            recovered,
        })
    }

    fn first_index_impl(&self) -> Result<u64> {
        match self.state.get(KEY_FIRST_INDEX)? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(1),
        }
    }

    fn last_index_impl(&self) -> Result<u64> {
        let first = self.first_index_impl()?;
        match self.entries.last()? {
            Some((key, _)) => decode_u64(&key),
            None => Ok(first.saturating_sub(1)),
        }
    }

    fn get_entry(&self, index: u64) -> Result<Option<Entry>> {
        match self.entries.get(index.to_be_bytes())? {
            Some(bytes) => {
                let mut entry = Entry::default();
                entry.merge_from_bytes(&bytes)?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    fn read_proto<M: PbMessage>(&self, key: &[u8]) -> Result<M> {
        match self.state.get(key)? {
            Some(bytes) => {
                let mut msg = M::new();
                msg.merge_from_bytes(&bytes)?;
                Ok(msg)
            }
            None => Ok(M::new()),
        }
    }

    fn write_proto<M: PbMessage>(&self, key: &[u8], msg: &M) -> Result<()> {
        self.state.insert(key, msg.write_to_bytes()?)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Storage for SledStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let hard_state = self.read_proto(KEY_HARD_STATE).map_err(to_raft_error)?;
        let conf_state = self.read_proto(KEY_CONF_STATE).map_err(to_raft_error)?;
        Ok(RaftState {
            hard_state,
            conf_state,
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: Option<u64>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let first = self.first_index_impl().map_err(to_raft_error)?;
        let last = self.last_index_impl().map_err(to_raft_error)?;

        if low < first {
            return Err(RaftCoreError::Store(RaftStorageError::Compacted));
        }
        if high > last + 1 {
            return Err(RaftCoreError::Store(RaftStorageError::Unavailable));
        }

        let max_size = max_size.unwrap_or(u64::MAX);
        let mut result = Vec::new();
        let mut size = 0u64;

        for idx in low..high {
            let entry = self
                .get_entry(idx)
                .map_err(to_raft_error)?
                .ok_or(RaftCoreError::Store(RaftStorageError::Unavailable))?;
            let entry_size = u64::from(entry.compute_size());
            if !result.is_empty() && size + entry_size > max_size {
                break;
            }
            size += entry_size;
            result.push(entry);
        }

        Ok(result)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        // The entry at `first_index - 1` is kept as the compaction boundary,
        // so the term there stays answerable.
        if let Some(entry) = self.get_entry(idx).map_err(to_raft_error)? {
            return Ok(entry.term);
        }

        let snap: Snapshot = self.read_proto(KEY_SNAPSHOT).map_err(to_raft_error)?;
        if snap.get_metadata().index == idx {
            return Ok(snap.get_metadata().term);
        }

        let first = self.first_index_impl().map_err(to_raft_error)?;
        if idx < first {
            Err(RaftCoreError::Store(RaftStorageError::Compacted))
        } else {
            Err(RaftCoreError::Store(RaftStorageError::Unavailable))
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.first_index_impl().map_err(to_raft_error)
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.last_index_impl().map_err(to_raft_error)
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snap: Snapshot = self.read_proto(KEY_SNAPSHOT).map_err(to_raft_error)?;
        let meta = snap.get_metadata();

        if meta.index == 0 || meta.index < request_index {
            return Err(RaftCoreError::Store(
                RaftStorageError::SnapshotTemporarilyUnavailable,
            ));
        }

        // Inline the snapshot file so MsgSnapshot carries everything the
        // receiver needs. The file may still be in flight from a background
        // snapshot; the core retries on unavailability.
        if snap.get_data().is_empty() {
            let (term, index) = (meta.term, meta.index);
            match self
                .shoter
                .read(term, index)
                .and_then(|file| file.encode())
            {
                Ok(bytes) => snap.set_data(bytes.into()),
                Err(e) => {
                    tracing::debug!("snapshot file {index} not readable yet for {to:x}: {e}");
                    return Err(RaftCoreError::Store(
                        RaftStorageError::SnapshotTemporarilyUnavailable,
                    ));
                }
            }
        }

        Ok(snap)
    }

    fn initialize_with_conf_state(&self, cs: &ConfState) -> Result<()> {
        if self.recovered {
            return Err(RaftError::Storage(
                "refusing to initialize existing storage".into(),
            ));
        }
        self.write_proto(KEY_CONF_STATE, cs)?;
        self.flush()
    }

    fn save_entries(&self, hs: Option<&HardState>, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() && hs.is_none() {
            return Ok(());
        }

        if let Some(last) = entries.last() {
            let old_last = self.last_index_impl()?;
            let mut batch = sled::Batch::default();
            for entry in entries {
                batch.insert(entry.index.to_be_bytes().to_vec(), entry.write_to_bytes()?);
            }
            // A conflicting append truncates the old suffix.
            if old_last > last.index {
                for idx in (last.index + 1)..=old_last {
                    batch.remove(idx.to_be_bytes().to_vec());
                }
            }
            self.entries.apply_batch(batch)?;
        }

        if let Some(hs) = hs {
            self.write_proto(KEY_HARD_STATE, hs)?;
        }

        self.flush()
    }

    fn save_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let mut header = snap.clone();
        header.clear_data();
        self.write_proto(KEY_SNAPSHOT, &header)?;
        self.flush()
    }

    fn apply_snapshot(&self, snap: &Snapshot) -> Result<()> {
        let meta = snap.get_metadata();
        let current: Snapshot = self.read_proto(KEY_SNAPSHOT)?;
        if current.get_metadata().index > meta.index {
            return Err(RaftError::Storage(format!(
                "snapshot at index {} is older than the stored one at {}",
                meta.index,
                current.get_metadata().index
            )));
        }

        let first = self.first_index_impl()?;
        if current.get_metadata().index == meta.index && first > meta.index {
            // Already installed.
            return Ok(());
        }

        // A log that already contains the snapshot point keeps its trailing
        // entries (boot-time restore). A diverging log is replaced.
        let log_matches = self
            .get_entry(meta.index)?
            .map(|e| e.term == meta.term)
            .unwrap_or(false);
        if !log_matches {
            self.state
                .insert(KEY_FIRST_INDEX, (meta.index + 1).to_be_bytes().to_vec())?;
            self.entries.clear()?;
        }

        let mut header = snap.clone();
        header.clear_data();
        self.write_proto(KEY_SNAPSHOT, &header)?;
        self.write_proto(KEY_CONF_STATE, meta.get_conf_state())?;

        let mut hs: HardState = self.read_proto(KEY_HARD_STATE)?;
        if hs.commit < meta.index {
            hs.commit = meta.index;
            hs.term = hs.term.max(meta.term);
            self.write_proto(KEY_HARD_STATE, &hs)?;
        }

        self.flush()
    }

    fn create_snapshot(&self, index: u64, cs: &ConfState, data: Vec<u8>) -> Result<Snapshot> {
        let term = self
            .term(index)
            .map_err(|e| RaftError::Storage(format!("term of snapshot index {index}: {e}")))?;

        let mut snap = Snapshot::default();
        snap.mut_metadata().index = index;
        snap.mut_metadata().term = term;
        snap.mut_metadata().set_conf_state(cs.clone());
        snap.set_data(data.into());

        let mut header = snap.clone();
        header.clear_data();
        self.write_proto(KEY_SNAPSHOT, &header)?;
        // Recovery reads the membership of the snapshot era from here.
        self.write_proto(KEY_CONF_STATE, cs)?;
        self.flush()?;
        Ok(snap)
    }

    fn compact(&self, compact_index: u64) -> Result<()> {
        let first = self.first_index_impl()?;
        if compact_index < first {
            return Ok(());
        }
        let last = self.last_index_impl()?;
        if compact_index > last {
            return Err(RaftError::Storage(format!(
                "compact index {compact_index} is beyond last index {last}"
            )));
        }

        // The entry at the compaction boundary stays behind so its term can
        // still be read.
        let mut batch = sled::Batch::default();
        for idx in first.saturating_sub(1)..compact_index {
            batch.remove(idx.to_be_bytes().to_vec());
        }
        self.entries.apply_batch(batch)?;
        self.state
            .insert(KEY_FIRST_INDEX, (compact_index + 1).to_be_bytes().to_vec())?;
        self.flush()
    }

    fn snapshot_header(&self) -> Result<Snapshot> {
        self.read_proto(KEY_SNAPSHOT)
    }

    fn snapshotter(&self) -> &dyn Snapshotter {
        &self.shoter
    }

    fn boot(&self, meta: &[u8]) -> Result<BootInfo> {
        if !self.recovered {
            self.state.insert(KEY_META, meta)?;
            self.state
                .insert(KEY_FIRST_INDEX, 1u64.to_be_bytes().to_vec())?;
            self.flush()?;
            return Ok(BootInfo {
                meta: meta.to_vec(),
                ..Default::default()
            });
        }

        let stored_meta = self
            .state
            .get(KEY_META)?
            .map(|bytes| bytes.to_vec())
            .unwrap_or_else(|| meta.to_vec());
        let hard_state: HardState = self.read_proto(KEY_HARD_STATE)?;

        let first = self.first_index_impl()?;
        let last = self.last_index_impl()?;
        let mut entries = Vec::new();
        for idx in first..=last {
            let entry = self
                .get_entry(idx)?
                .ok_or_else(|| RaftError::Storage(format!("log entry {idx} missing")))?;
            entries.push(entry);
        }

        let snapshot = self.shoter.read_newest()?;

        Ok(BootInfo {
            meta: stored_meta,
            hard_state,
            entries,
            snapshot,
        })
    }

    fn exist(&self) -> bool {
        self.recovered
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| RaftError::Storage("invalid u64 key".into()))?;
    Ok(u64::from_be_bytes(arr))
}

fn to_raft_error(e: RaftError) -> RaftCoreError {
    RaftCoreError::Store(RaftStorageError::Other(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberInfo;
    use tempfile::TempDir;

    fn create_test_storage() -> (SledStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = SledStorage::open(dir.path(), 3).unwrap();
        (storage, dir)
    }

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e.data = format!("data-{index}").into_bytes().into();
        e
    }

    #[test]
    fn initial_state_is_empty() {
        let (storage, _dir) = create_test_storage();
        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state, HardState::default());
        assert_eq!(state.conf_state, ConfState::default());
        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 0);
    }

    #[test]
    fn append_and_retrieve() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 5);

        let got = storage
            .entries(1, 6, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[0].index, 1);
        assert_eq!(got[4].index, 5);
    }

    #[test]
    fn conflicting_append_truncates_suffix() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        // A new leader overwrites from index 3 with a higher term.
        let overwrite: Vec<Entry> = vec![entry(3, 2)];
        storage.save_entries(None, &overwrite).unwrap();

        assert_eq!(storage.last_index().unwrap(), 3);
        assert_eq!(storage.term(3).unwrap(), 2);
    }

    #[test]
    fn hard_state_roundtrip() {
        let (storage, _dir) = create_test_storage();
        let mut hs = HardState::default();
        hs.term = 5;
        hs.vote = 2;
        hs.commit = 10;
        storage.save_entries(Some(&hs), &[]).unwrap();

        let state = storage.initial_state().unwrap();
        assert_eq!(state.hard_state.term, 5);
        assert_eq!(state.hard_state.vote, 2);
        assert_eq!(state.hard_state.commit, 10);
    }

    #[test]
    fn compact_drops_prefix() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=10).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        storage.compact(5).unwrap();
        assert_eq!(storage.first_index().unwrap(), 6);

        let result = storage.entries(1, 5, None, GetEntriesContext::empty(false));
        assert!(matches!(
            result,
            Err(RaftCoreError::Store(RaftStorageError::Compacted))
        ));

        // The boundary term stays answerable after compaction.
        assert_eq!(storage.term(5).unwrap(), 1);
        assert!(matches!(
            storage.term(4),
            Err(RaftCoreError::Store(RaftStorageError::Compacted))
        ));

        let rest = storage
            .entries(6, 11, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(rest.len(), 5);
    }

    #[test]
    fn compact_beyond_last_index_fails() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=3).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();
        assert!(storage.compact(10).is_err());
    }

    #[test]
    fn create_snapshot_then_serve_it() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        let mut cs = ConfState::default();
        cs.voters = vec![1];
        let snap = storage.create_snapshot(5, &cs, vec![]).unwrap();
        assert_eq!(snap.get_metadata().index, 5);
        assert_eq!(snap.get_metadata().term, 1);

        // The raft-facing view needs the snapshot file on disk first.
        let file = SnapshotFile {
            raw: snap.clone(),
            members: vec![MemberInfo::voter(1, "127.0.0.1:1")],
            data: b"app-state".to_vec(),
        };
        storage.snapshotter().write(&file).unwrap();

        let served = Storage::snapshot(&storage, 0, 2).unwrap();
        assert_eq!(served.get_metadata().index, 5);
        let decoded = SnapshotFile::decode(served.get_data()).unwrap();
        assert_eq!(decoded.data, b"app-state");
    }

    #[test]
    fn apply_snapshot_keeps_matching_trailing_log() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        // A snapshot the log already contains (boot-time restore) leaves
        // the trailing entries alone.
        let mut cs = ConfState::default();
        cs.voters = vec![1];
        let snap = storage.create_snapshot(3, &cs, vec![]).unwrap();
        storage.apply_snapshot(&snap).unwrap();

        assert_eq!(storage.first_index().unwrap(), 1);
        assert_eq!(storage.last_index().unwrap(), 5);
        assert_eq!(storage.term(5).unwrap(), 1);
    }

    #[test]
    fn apply_snapshot_advances_first_index() {
        let (storage, _dir) = create_test_storage();
        let entries: Vec<Entry> = (1..=5).map(|i| entry(i, 1)).collect();
        storage.save_entries(None, &entries).unwrap();

        let mut snap = Snapshot::default();
        snap.mut_metadata().index = 8;
        snap.mut_metadata().term = 2;
        snap.mut_metadata().mut_conf_state().voters = vec![1, 2];
        storage.apply_snapshot(&snap).unwrap();

        assert_eq!(storage.first_index().unwrap(), 9);
        assert_eq!(storage.last_index().unwrap(), 8);
        assert_eq!(storage.term(8).unwrap(), 2);
        let state = storage.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![1, 2]);
        assert!(state.hard_state.commit >= 8);
    }

    #[test]
    fn boot_fresh_then_reopen() {
        let dir = TempDir::new().unwrap();
        let meta = b"local-member".to_vec();

        {
            let storage = SledStorage::open(dir.path(), 3).unwrap();
            assert!(!storage.exist());
            let info = storage.boot(&meta).unwrap();
            assert_eq!(info.meta, meta);
            assert!(info.entries.is_empty());
            assert!(info.snapshot.is_none());

            let mut hs = HardState::default();
            hs.term = 3;
            hs.commit = 2;
            let entries: Vec<Entry> = (1..=2).map(|i| entry(i, 3)).collect();
            storage.save_entries(Some(&hs), &entries).unwrap();
            storage.close().unwrap();
        }

        let storage = SledStorage::open(dir.path(), 3).unwrap();
        assert!(storage.exist());
        let info = storage.boot(&[]).unwrap();
        assert_eq!(info.meta, meta);
        assert_eq!(info.hard_state.term, 3);
        assert_eq!(info.entries.len(), 2);
    }
}
