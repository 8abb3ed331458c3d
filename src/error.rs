//! Error types for the engine and its collaborators.

use thiserror::Error;

/// Errors surfaced by the engine and the storage/membership layers.
///
/// The enum is `Clone` so a single failure can be fanned out to every
/// waiter on the message bus.
#[derive(Debug, Clone, Error)]
pub enum RaftError {
    /// The node has not been started yet, or has been shut down.
    #[error("raft: node not ready yet or has been stopped")]
    Stopped,

    /// There is no elected cluster leader.
    #[error("raft: no elected cluster leader")]
    NoLeader,

    /// A snapshot is already in progress.
    #[error("raft: already snapshotting")]
    AlreadySnapshotting,

    /// The precondition for creating a snapshot is not met.
    ///
    /// Returned by [`StateMachine::snapshot`](crate::StateMachine::snapshot)
    /// to skip a snapshot without raising an error.
    #[error("raft: precondition failed")]
    FailedPrecondition,

    /// The ingress buffer is full.
    #[error("raft: buffer is full (overloaded network)")]
    BufferFull,

    /// The protocol node was never constructed during start.
    #[error("raft: node not initialized, start with InitCluster, Join, or Restart")]
    NotInitialized,

    /// Storage operation failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// Protocol core rejected an operation.
    #[error("raft protocol error: {0}")]
    Protocol(String),

    /// The application state machine rejected a command.
    #[error("apply error: {0}")]
    Apply(String),

    /// The application state machine failed to restore a snapshot.
    #[error("restore error: {0}")]
    Restore(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Message delivery failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Membership pool rejected an operation.
    #[error("membership error: {0}")]
    Membership(String),
}

/// Result type used throughout the crate.
pub type Result<T, E = RaftError> = std::result::Result<T, E>;

impl From<bincode::Error> for RaftError {
    fn from(e: bincode::Error) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<protobuf::ProtobufError> for RaftError {
    fn from(e: protobuf::ProtobufError) -> Self {
        RaftError::Serialization(e.to_string())
    }
}

impl From<raft::Error> for RaftError {
    fn from(e: raft::Error) -> Self {
        RaftError::Protocol(e.to_string())
    }
}

impl From<sled::Error> for RaftError {
    fn from(e: sled::Error) -> Self {
        RaftError::Storage(e.to_string())
    }
}
