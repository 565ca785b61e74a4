//! The narrow view of the consensus engine the cluster layer relies on.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::ClusterError;
use crate::topology::{Fsm, LogEntry, MasterSlave, NodeId, NodeInfo, TopologyEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftState {
    Leader,
    Follower,
    Candidate,
}

/// Consensus operations used by [`Cluster`](crate::Cluster).
///
/// `propose` resolves once the entry is committed and applied to the
/// local state machine. An entry the state machine rejects comes back as
/// [`ClusterError::Rejected`].
pub trait Consensus: Send + Sync + 'static {
    /// Appends `entry` and returns its log index.
    fn propose(&self, entry: LogEntry) -> impl Future<Output = Result<u64, ClusterError>> + Send;

    /// Adds a node to the raft group as a voter.
    fn add_to_raft(&self, node: &NodeInfo) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn state(&self) -> RaftState;

    /// Data address of the current leader, if one is known.
    fn leader_address(&self) -> Option<NodeId>;

    fn fsm(&self) -> &Arc<Fsm>;

    fn get_slaves(&self, master: &NodeId) -> Option<MasterSlave> {
        self.fsm().get_slaves(master)
    }

    fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.fsm().subscribe()
    }
}
