//! raftkit: a raft node engine built on tikv/raft-rs.
//!
//! This crate does not implement consensus. It wraps the `raft` crate's
//! `RawNode` with everything a real node needs around it:
//!
//! - **Engine** ([`Engine`]): the event loop that ticks the core, persists
//!   ready batches in order, applies committed entries, resolves waiting
//!   proposals, ships outbound messages, and manages snapshots.
//! - **Storage** ([`storage`]): the durability contract plus a sled-backed
//!   implementation with on-disk snapshot files.
//! - **Membership** ([`membership`]): the cluster member pool, kept
//!   consistent with committed conf changes; staging members are promoted
//!   to voters automatically once their log catches up.
//! - **Transport** ([`transport`]): the delivery seam. Bring your own wire
//!   protocol; an in-process router is included for tests and
//!   single-process clusters.
//! - **State machine** ([`state_machine`]): the application contract and an
//!   in-memory key-value implementation.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use raftkit::{Config, Engine, InitCluster, KvStateMachine, LocalNetwork, Pool, SledStorage};
//!
//! # async fn run() -> raftkit::Result<()> {
//! let network = LocalNetwork::new();
//! let storage = Arc::new(SledStorage::open("/var/lib/myapp/raft", 5)?);
//! let fsm = Arc::new(KvStateMachine::new());
//! let pool = Pool::new(Arc::new(network.clone()));
//!
//! let engine = Engine::new(Config { id: 1, ..Default::default() }, fsm, storage, pool);
//!
//! // Blocks until shutdown; run it on its own task.
//! let runner = {
//!     let engine = Arc::clone(&engine);
//!     tokio::spawn(async move {
//!         engine
//!             .start("127.0.0.1:9021", vec![Box::new(InitCluster { peers: vec![] })])
//!             .await
//!     })
//! };
//!
//! engine.propose_replicate(b"hello".to_vec()).await?;
//! engine.linearizable_read().await?;
//! # let _ = runner;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod membership;
pub mod state_machine;
pub mod storage;
pub mod transport;
pub mod types;

mod idgen;
mod msgbus;
mod waitgroup;

pub use config::Config;
pub use engine::{Engine, Fallback, InitCluster, Join, Operator, OperatorState, Restart};
pub use error::{RaftError, Result};
pub use membership::{Member, Pool};
pub use state_machine::{KvCommand, KvStateMachine, StateMachine};
pub use storage::{
    BootInfo, FileSnapshotter, SharedStorage, SledStorage, SnapshotFile, Snapshotter, Storage,
};
pub use transport::{LocalNetwork, Transport, TransportError};
pub use types::{MemberInfo, MemberKind, NodeRole, PeerProgress, RaftStatus};

/// Protocol types callers interact with directly.
pub use raft::eraftpb::{ConfChangeType, Message};
pub use raft::SnapshotStatus;
