//! Snapshot orchestration.
//!
//! Scheduling is synchronous — the applied index, conf state, and
//! application payload are captured on the caller's side of the fence — and
//! persistence runs in a background task. At most one snapshot is in flight,
//! enforced by the `snapshotting` flag.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RaftError, Result};
use crate::storage::SnapshotFile;

use super::Engine;

impl Engine {
    /// Snapshot if enough entries have been applied since the last one.
    pub(crate) fn maybe_create_snapshot(self: &Arc<Self>) {
        let applied = self.applied_index.load(Ordering::Acquire);
        let snap_index = self.snap_index.load(Ordering::Acquire);
        if applied.saturating_sub(snap_index) <= self.cfg.snap_interval
            || self.snapshotting.load(Ordering::Acquire)
        {
            return;
        }

        if let Err(e) = self.create_snapshot_now() {
            if matches!(e, RaftError::FailedPrecondition) {
                return;
            }
            tracing::error!("creating snapshot at index {applied} failed: {e}");
        }
    }

    /// Schedule a snapshot at the current applied index.
    ///
    /// Returns once the snapshot record exists; file persistence and log
    /// compaction continue in the background. A failure there rewinds the
    /// snapshot index and is logged.
    pub(crate) fn create_snapshot_now(self: &Arc<Self>) -> Result<()> {
        let applied = self.applied_index.load(Ordering::Acquire);
        let prev_snap_index = self.snap_index.load(Ordering::Acquire);

        if applied == prev_snap_index {
            return Ok(());
        }

        if self
            .snapshotting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RaftError::AlreadySnapshotting);
        }

        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(e) => {
                self.snapshotting.store(false, Ordering::Release);
                return Err(e);
            }
        };

        tracing::info!(
            "starting snapshot [applied index: {applied} | last snapshot index: {prev_snap_index}]"
        );

        let conf_state = self.conf_state.lock().clone();
        let raw = match self.storage.create_snapshot(applied, &conf_state, Vec::new()) {
            Ok(raw) => raw,
            Err(e) => {
                self.snapshotting.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let file = SnapshotFile {
            raw,
            members: self.pool.snapshot(),
            data,
        };

        let eng = Arc::clone(self);
        let token = self.wg.token();
        tokio::spawn(async move {
            let _token = token;
            let persisted = (|| -> Result<()> {
                eng.storage.snapshotter().write(&file)?;
                eng.storage.save_snapshot(&file.raw)?;
                eng.snap_index.store(applied, Ordering::Release);

                if applied > eng.cfg.snap_interval {
                    let compact_index = applied - eng.cfg.snap_interval;
                    eng.storage.compact(compact_index)?;
                    tracing::info!("compacted log at index {compact_index}");
                }
                Ok(())
            })();
            eng.snapshotting.store(false, Ordering::Release);

            if let Err(e) = persisted {
                eng.snap_index.store(prev_snap_index, Ordering::Release);
                tracing::error!("creating snapshot at index {applied} failed: {e}");
            }
        });

        Ok(())
    }
}
