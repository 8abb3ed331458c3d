//! Message delivery between cluster members.
//!
//! The engine never speaks a wire protocol itself; it hands outbound
//! protocol messages to a [`Transport`]. Implementations bring their own
//! framing and connection management. [`LocalNetwork`] delivers within one
//! process and backs the multi-node tests.

mod local;

pub use local::LocalNetwork;

use async_trait::async_trait;
use raft::eraftpb::Message;
use thiserror::Error;

use crate::types::MemberInfo;

/// Errors raised when delivering a message to a member.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No route to the member.
    #[error("member {0:x} is unreachable")]
    Unreachable(u64),

    /// The member stopped accepting messages.
    #[error("connection to member {0:x} is closed")]
    Closed(u64),

    /// Implementation-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Delivers protocol messages to remote members.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver `msg` to the member described by `to`.
    async fn send(&self, to: &MemberInfo, msg: Message) -> Result<(), TransportError>;
}
