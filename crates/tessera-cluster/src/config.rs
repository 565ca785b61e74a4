//! Runtime settings for the cluster layer.

use std::time::Duration;

use crate::topology::NodeId;

/// Peer connection pool policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle: usize,
    pub max_active: usize,
    /// How long a borrow waits for a free slot before failing.
    pub wait_timeout: Duration,
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    /// Sent as `AUTH <password>` right after dialing.
    pub password: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 1,
            max_active: 16,
            wait_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(30),
            password: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's advertised data address.
    pub self_id: NodeId,
    /// This node's advertised raft address.
    pub raft_advertise: String,
    pub heartbeat_interval: Duration,
    /// A master silent for longer than this is failed over.
    pub failover_timeout: Duration,
    pub rebalance_interval: Duration,
    /// Polls of `cluster.committedindex` before a route change gives up.
    pub commit_poll_attempts: u32,
    pub commit_poll_interval: Duration,
    /// How long finished transaction records are kept, and how long a
    /// prepared transaction may hold its keys.
    pub tx_retention: Duration,
    pub pool: PoolConfig,
}

impl ClusterConfig {
    pub fn new(self_id: NodeId, raft_advertise: impl Into<String>) -> Self {
        Self {
            self_id,
            raft_advertise: raft_advertise.into(),
            heartbeat_interval: Duration::from_secs(1),
            failover_timeout: Duration::from_secs(10),
            rebalance_interval: Duration::from_secs(5),
            commit_poll_attempts: 50,
            commit_poll_interval: Duration::from_millis(100),
            tx_retention: Duration::from_secs(60),
            pool: PoolConfig::default(),
        }
    }
}
