//! Error types for cluster operations.

use tessera_protocol::{FrameError, Reply};

use crate::migration::MigrationError;
use crate::topology::NodeId;

/// Errors that can occur during cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The slot is not assigned to any node.
    #[error("slot {0} is not assigned to any node")]
    SlotNotAssigned(u16),

    /// Node not found in the committed topology.
    #[error("node {0} not found in cluster")]
    NodeNotFound(NodeId),

    /// The slot belongs to another node in the applied topology.
    #[error("MOVED {slot} {owner}")]
    Moved { slot: u16, owner: NodeId },

    /// Keys of one request live on different nodes.
    #[error("keys in request don't hash to the same node")]
    CrossNode,

    /// No leader is currently known.
    #[error("no leader elected")]
    NoLeader,

    /// The consensus engine refused or failed the proposal.
    #[error("raft: {0}")]
    Consensus(String),

    /// The entry committed but the state machine rejected it.
    #[error("{0}")]
    Rejected(String),

    /// Connect, read or write failure talking to a peer.
    #[error("peer {addr}: {reason}")]
    Peer { addr: String, reason: String },

    /// The peer answered with an error reply.
    #[error("{0}")]
    Remote(String),

    /// The peer's connection pool has no free slot.
    #[error("connection pool for {0} exhausted")]
    PoolExhausted(String),

    /// A client was returned to a pool that does not exist.
    #[error("connection pool for {0} not found")]
    PoolNotFound(String),

    /// Timeout waiting for cluster operation.
    #[error("{0} timed out")]
    Timeout(String),

    /// Configuration error.
    #[error("invalid cluster configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

impl ClusterError {
    pub(crate) fn peer(addr: &str, reason: impl std::fmt::Display) -> Self {
        ClusterError::Peer {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Maps a wire failure on the connection to `addr`.
    pub(crate) fn frame(addr: &str, err: FrameError) -> Self {
        Self::peer(addr, err)
    }
}

impl From<ClusterError> for Reply {
    fn from(e: ClusterError) -> Self {
        match e {
            // remote errors already carry their class prefix
            ClusterError::Remote(msg) => Reply::Error(msg),
            moved @ ClusterError::Moved { .. } => Reply::Error(moved.to_string()),
            other => Reply::err(other),
        }
    }
}
