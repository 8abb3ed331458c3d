//! Snapshot files on disk.
//!
//! Each snapshot is one file named `{term:016x}-{index:016x}.snap` holding
//! the encoded [`SnapshotFile`]. Names sort lexicographically in (term,
//! index) order, so the newest file is the last name. Writes go through a
//! temporary file and a rename; all but the newest `max_files` are purged
//! after every write.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{RaftError, Result};

use super::{SnapshotFile, Snapshotter};

const SNAP_EXT: &str = "snap";

pub struct FileSnapshotter {
    dir: PathBuf,
    max_files: usize,
}

impl FileSnapshotter {
    /// Create a snapshotter rooted at `dir`, retaining at most `max_files`
    /// snapshot files. The directory is created if missing.
    pub fn new(dir: impl AsRef<Path>, max_files: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            RaftError::Storage(format!("create snapshot dir {}: {e}", dir.display()))
        })?;
        Ok(Self {
            dir,
            max_files: max_files.max(1),
        })
    }

    fn file_name(term: u64, index: u64) -> String {
        format!("{term:016x}-{index:016x}.{SNAP_EXT}")
    }

    /// Snapshot file names, newest first.
    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = fs::read_dir(&self.dir)
            .map_err(|e| RaftError::Storage(format!("list snapshot dir: {e}")))?;
        for entry in dir {
            let entry = entry.map_err(|e| RaftError::Storage(format!("list snapshot dir: {e}")))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&format!(".{SNAP_EXT}")) {
                names.push(name);
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    fn purge(&self) {
        let stale = match self.list() {
            Ok(mut names) if names.len() > self.max_files => names.split_off(self.max_files),
            Ok(_) => return,
            Err(e) => {
                tracing::warn!("purging old snapshot files: {e}");
                return;
            }
        };
        for name in stale {
            if let Err(e) = fs::remove_file(self.dir.join(&name)) {
                tracing::warn!("removing old snapshot file {name}: {e}");
            }
        }
    }
}

impl Snapshotter for FileSnapshotter {
    fn write(&self, snap: &SnapshotFile) -> Result<()> {
        let name = Self::file_name(snap.term(), snap.index());
        let tmp = self.dir.join(format!("{name}.tmp"));
        let bytes = snap.encode()?;
        fs::write(&tmp, bytes)
            .map_err(|e| RaftError::Storage(format!("write snapshot file {name}: {e}")))?;
        fs::rename(&tmp, self.dir.join(&name))
            .map_err(|e| RaftError::Storage(format!("rename snapshot file {name}: {e}")))?;
        self.purge();
        Ok(())
    }

    fn read(&self, term: u64, index: u64) -> Result<SnapshotFile> {
        let name = Self::file_name(term, index);
        let bytes = fs::read(self.dir.join(&name))
            .map_err(|e| RaftError::Storage(format!("read snapshot file {name}: {e}")))?;
        SnapshotFile::decode(&bytes)
    }

    fn read_newest(&self) -> Result<Option<SnapshotFile>> {
        for name in self.list()? {
            match fs::read(self.dir.join(&name)) {
                Ok(bytes) => match SnapshotFile::decode(&bytes) {
                    Ok(snap) => return Ok(Some(snap)),
                    Err(e) => tracing::warn!("decoding snapshot file {name}: {e}"),
                },
                Err(e) => tracing::warn!("reading snapshot file {name}: {e}"),
            }
        }
        Ok(None)
    }
}
