//! Application state machine contract.
//!
//! The engine applies committed commands to the state machine, asks it for
//! snapshots, and restores it from snapshot payloads. Implementations manage
//! their own interior synchronization; the engine only ever calls them from
//! its event loop and from snapshot restore during start.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// The replicated application.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply a committed command.
    fn apply(&self, data: &[u8]) -> Result<()>;

    /// Capture the current state as an opaque payload.
    ///
    /// Returning [`RaftError::FailedPrecondition`] skips the snapshot
    /// without raising an error.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace the current state with a previously captured payload.
    fn restore(&self, data: &[u8]) -> Result<()>;
}

/// Commands understood by [`KvStateMachine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    /// Set a key to a value.
    Set { key: String, value: Vec<u8> },
    /// Delete a key.
    Delete { key: String },
}

impl KvCommand {
    /// Serialize for [`Engine::propose_replicate`](crate::Engine::propose_replicate).
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

/// In-memory key-value state machine.
///
/// Useful for tests and demos; real applications implement [`StateMachine`]
/// over their own storage.
#[derive(Default)]
pub struct KvStateMachine {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&self, data: &[u8]) -> Result<()> {
        let cmd: KvCommand =
            bincode::deserialize(data).map_err(|e| RaftError::Apply(e.to_string()))?;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match cmd {
            KvCommand::Set { key, value } => {
                entries.insert(key, value);
            }
            KvCommand::Delete { key } => {
                entries.remove(&key);
            }
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(bincode::serialize(&*entries)?)
    }

    fn restore(&self, data: &[u8]) -> Result<()> {
        let restored: HashMap<String, Vec<u8>> =
            bincode::deserialize(data).map_err(|e| RaftError::Restore(e.to_string()))?;
        *self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = restored;
        Ok(())
    }
}
