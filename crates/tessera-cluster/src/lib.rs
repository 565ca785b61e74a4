//! tessera-cluster: distributed coordination for tessera.
//!
//! This crate turns a set of single-node engines into one sharded store.
//!
//! # Architecture
//!
//! The cluster layer sits between the connection layer and the storage
//! engine, handling:
//!
//! - **Slot routing**: 16384 hash slots, each owned by one master
//! - **Topology**: membership, slot ownership and migration tasks kept in a
//!   raft-replicated state machine
//! - **Peer connections**: bounded, authenticated connection pools
//! - **Transactions**: two-phase (prepare/commit/rollback) execution of
//!   RENAME, MSET and DEL across nodes
//! - **Migration**: leader-planned slot rebalancing with live data copy
//! - **Failover**: heartbeat tracking and slave promotion
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use tessera_cluster::{get_slot, Cluster, ClusterConfig, RaftNode};
//!
//! let raft = RaftNode::start(local, raft_listener, fsm, None).await?;
//! raft.bootstrap_single().await?;
//! let cluster = Cluster::new(config, engine, raft);
//! cluster.start_as_seed().await?;
//!
//! let reply = cluster.exec(&cmd_line(&["SET", "k", "v"])).await;
//! ```

mod auth;
mod cluster;
mod command;
mod config;
mod consensus;
mod error;
mod listener;
mod migration;
mod multikey;
mod peer;
mod raft;
mod raft_transport;
mod rename;
mod replica;
mod slots;
mod tcc;
mod topology;

#[cfg(test)]
mod testkit;

pub use auth::ClusterSecret;
pub use cluster::Cluster;
pub use command::ClusterRequest;
pub use config::{ClusterConfig, PoolConfig};
pub use consensus::{Consensus, RaftState};
pub use error::ClusterError;
pub use listener::{serve, ListenerOptions, DEFAULT_MAX_CONNECTIONS};
pub use migration::{
    make_rebalance_plan, ExportCursor, MigrationError, MigrationPhase, MigrationSide,
};
pub use peer::{ConnectionFactory, PeerClient, PeerStream, PooledClient};
pub use raft::{RaftNode, Storage as RaftStorage, TopologySnapshot, TypeConfig};
pub use replica::ReplicaManager;
pub use slots::{get_slot, SlotMap, SlotRange, SLOT_COUNT};
pub use tcc::{
    gen_tx_id, PrepareFn, PrepareRegistry, RouteMap, Staged, TccTx, TransactionTable, TxStatus,
    WriteGuard,
};
pub use topology::{
    ApplyResponse, FailoverTask, Fsm, LogEntry, MasterSlave, MigratingTask, NodeId, NodeInfo,
    TopologyEvent, TopologyState,
};
