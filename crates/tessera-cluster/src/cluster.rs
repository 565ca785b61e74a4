//! The cluster facade the connection layer talks to.
//!
//! [`Cluster::exec`] is the single entry point for a command line: cluster
//! requests go to their handlers (forwarded to the raft leader when only
//! the leader may serve them), data commands are routed by key to the
//! owning node, and everything keyless runs on the local engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use bytes::Bytes;
use tessera_core::{command_keys, lookup_command, Engine};
use tessera_protocol::{cmd_line, command_name, format_cmd_line, Reply};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{ClusterRequest, CLUSTER_PREFIX};
use crate::config::ClusterConfig;
use crate::consensus::{Consensus, RaftState};
use crate::error::ClusterError;
use crate::migration::SlotTable;
use crate::peer::{ConnectionFactory, PooledClient};
use crate::replica::ReplicaManager;
use crate::slots::get_slot;
use crate::tcc::{PrepareRegistry, TransactionTable, WriteGuard};
use crate::topology::{Fsm, LogEntry, NodeId, NodeInfo, TopologyEvent};

/// Checks for commands on the local store: every key's slot must be owned
/// here in the applied topology, and writes must pass the migration locks.
/// Holds the slot table's read lock.
pub(crate) struct LocalWrites<'a> {
    table: RwLockReadGuard<'a, SlotTable>,
    fsm: &'a Fsm,
    me: &'a NodeId,
}

impl LocalWrites<'_> {
    fn check_owner(&self, keys: &[Bytes]) -> Result<(), Reply> {
        self.fsm.read(|state| {
            for key in keys {
                let slot = get_slot(key);
                let owner = state.pick_node(slot).map_err(Reply::from)?;
                if owner != *self.me {
                    return Err(ClusterError::Moved { slot, owner }.into());
                }
            }
            Ok(())
        })
    }
}

impl WriteGuard for LocalWrites<'_> {
    fn check(&self, keys: &[Bytes]) -> Result<(), Reply> {
        self.check_owner(keys)?;
        self.table.check_write(keys)
    }

    fn wrote(&self, keys: &[Bytes]) {
        self.table.record_dirty(keys);
    }
}

/// One node's cluster layer: routing, peer connections, transactions,
/// migrations and failover on top of a [`Consensus`] implementation.
pub struct Cluster<C: Consensus> {
    pub(crate) config: ClusterConfig,
    pub(crate) engine: Arc<Engine>,
    pub(crate) consensus: C,
    pub(crate) connections: ConnectionFactory,
    slot_table: RwLock<SlotTable>,
    pub(crate) transactions: TransactionTable,
    pub(crate) replicas: ReplicaManager,
    pub(crate) rebalance_lock: tokio::sync::Mutex<()>,
}

fn arg(cmd: &[Bytes], i: usize) -> String {
    cmd.get(i)
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .unwrap_or_default()
}

impl<C: Consensus> Cluster<C> {
    pub fn new(config: ClusterConfig, engine: Arc<Engine>, consensus: C) -> Arc<Self> {
        Self::with_registry(config, engine, consensus, PrepareRegistry::with_defaults())
    }

    /// Like [`Cluster::new`] with a custom set of prepare operations.
    pub fn with_registry(
        config: ClusterConfig,
        engine: Arc<Engine>,
        consensus: C,
        registry: PrepareRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            connections: ConnectionFactory::new(config.pool.clone()),
            transactions: TransactionTable::new(registry, config.tx_retention),
            replicas: ReplicaManager::new(config.failover_timeout),
            slot_table: RwLock::new(SlotTable::new()),
            rebalance_lock: tokio::sync::Mutex::new(()),
            config,
            engine,
            consensus,
        })
    }

    pub fn self_id(&self) -> &NodeId {
        &self.config.self_id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn consensus(&self) -> &C {
        &self.consensus
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        self.consensus.fsm()
    }

    pub fn connections(&self) -> &ConnectionFactory {
        &self.connections
    }

    pub fn get_slot(&self, key: &[u8]) -> u16 {
        get_slot(key)
    }

    /// Owner of `slot` in the locally applied topology.
    pub fn pick_node(&self, slot: u16) -> Result<NodeId, ClusterError> {
        self.fsm().pick_node(slot)
    }

    pub(crate) fn slots(&self) -> RwLockReadGuard<'_, SlotTable> {
        self.slot_table.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn local_writes(&self) -> LocalWrites<'_> {
        LocalWrites {
            table: self.slots(),
            fsm: self.fsm(),
            me: self.self_id(),
        }
    }

    pub(crate) fn slots_mut(&self) -> RwLockWriteGuard<'_, SlotTable> {
        self.slot_table.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Text summary of masters, slaves and slot ranges.
    pub fn describe(&self) -> String {
        self.fsm().read(|s| s.describe())
    }

    // -- peers --

    /// Borrows a pooled client to the current raft leader.
    pub async fn borrow_leader_client(&self) -> Result<PooledClient, ClusterError> {
        let leader = self
            .consensus
            .leader_address()
            .ok_or(ClusterError::NoLeader)?;
        self.connections.borrow_peer_client(leader.as_str()).await
    }

    /// Sends `cmd` to `node` and returns its reply. When `node` is this
    /// node the command runs through [`Cluster::exec`] without a network
    /// hop. Transport failures come back as error replies.
    pub async fn relay(self: &Arc<Self>, node: &NodeId, cmd: &[Bytes]) -> Reply {
        if node == self.self_id() {
            return self.exec_boxed(cmd).await;
        }
        match self.connections.send(node.as_str(), cmd).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(peer = %node, cmd = %format_cmd_line(cmd), "relay failed: {e}");
                e.into()
            }
        }
    }

    pub(crate) async fn relay_leader(self: &Arc<Self>, cmd: &[Bytes]) -> Reply {
        match self.consensus.leader_address() {
            Some(leader) => self.relay(&leader, cmd).await,
            None => ClusterError::NoLeader.into(),
        }
    }

    /// Runs a data command on its owner: here, or relayed as
    /// `cluster.local` so the owner does not route it again.
    pub(crate) async fn exec_on(self: &Arc<Self>, node: &NodeId, cmd: &[Bytes]) -> Reply {
        if node == self.self_id() {
            return self.local_exec(cmd);
        }
        let mut local = Vec::with_capacity(cmd.len() + 1);
        local.push(Bytes::from_static(b"cluster.local"));
        local.extend_from_slice(cmd);
        self.relay(node, &local).await
    }

    async fn forward_to_leader(&self, cmd: &[Bytes]) -> Reply {
        let mut client = match self.borrow_leader_client().await {
            Ok(client) => client,
            Err(e) => return e.into(),
        };
        if client.addr() == self.self_id().as_str() {
            // leader hint points at us but we are not leading
            return ClusterError::NoLeader.into();
        }
        let reply = client.send(cmd).await;
        if let Err(e) = self.connections.return_peer_client(client) {
            debug!("return leader connection: {e}");
        }
        reply.unwrap_or_else(Reply::from)
    }

    // -- dispatch --

    fn exec_boxed<'a>(
        self: &'a Arc<Self>,
        cmd: &'a [Bytes],
    ) -> Pin<Box<dyn Future<Output = Reply> + Send + 'a>> {
        Box::pin(self.exec(cmd))
    }

    /// Executes one command line on behalf of a client or a peer.
    pub async fn exec(self: &Arc<Self>, cmd: &[Bytes]) -> Reply {
        let name = command_name(cmd);
        if name.is_empty() {
            return Reply::err("empty command");
        }

        if let Some(req) = ClusterRequest::parse(&name) {
            if !req.arity_ok(cmd.len()) {
                return Reply::err(format!("wrong number of arguments for '{name}' command"));
            }
            if req.leader_only() && self.consensus.state() != RaftState::Leader {
                return self.forward_to_leader(cmd).await;
            }
            return self.exec_cluster(req, cmd).await;
        }
        if name.starts_with(CLUSTER_PREFIX) {
            return Reply::err("unknown cluster command");
        }

        let keys = command_keys(cmd);
        if keys.is_empty() {
            return self.local_exec(cmd);
        }
        let route_map = match self.group_by_node(&keys) {
            Ok(map) => map,
            Err(e) => return e.into(),
        };
        let mut owners = route_map.into_keys();
        match (owners.next(), owners.next()) {
            (Some(node), None) => self.exec_on(&node, cmd).await,
            _ => ClusterError::CrossNode.into(),
        }
    }

    async fn exec_cluster(self: &Arc<Self>, req: ClusterRequest, cmd: &[Bytes]) -> Reply {
        match req {
            ClusterRequest::Join => self.exec_join(cmd).await,
            ClusterRequest::Heartbeat => self.exec_heartbeat(&cmd[1]),
            ClusterRequest::ChangeRoute => self.exec_migration_changeroute(&arg(cmd, 1)).await,
            ClusterRequest::CommittedIndex => Reply::Integer(self.fsm().applied_index() as i64),
            ClusterRequest::MigrationStart => self.exec_migration_start(&arg(cmd, 1)),
            ClusterRequest::MigrationExport => {
                Reply::err("cluster.migration.export needs a streaming connection")
            }
            ClusterRequest::MigrationDone => self.exec_migration_done(&arg(cmd, 1)).await,
            ClusterRequest::MigrationRestore => self.exec_migration_restore(cmd),
            ClusterRequest::MigrationForget => self.exec_migration_forget(cmd),
            ClusterRequest::MigrationAbort => self.exec_migration_abort(&arg(cmd, 1)).await,
            ClusterRequest::Prepare => self.transactions.prepare(
                &self.engine,
                &self.local_writes(),
                &arg(cmd, 1),
                &arg(cmd, 2),
                &cmd[3..],
            ),
            ClusterRequest::Commit => {
                self.transactions
                    .commit(&self.engine, &self.local_writes(), &arg(cmd, 1))
            }
            ClusterRequest::Rollback => {
                self.transactions
                    .rollback(&self.engine, &self.local_writes(), &arg(cmd, 1))
            }
            ClusterRequest::Nodes => Reply::Bulk(Bytes::from(self.describe())),
            ClusterRequest::Local => self.local_exec(&cmd[1..]),
            ClusterRequest::Rename | ClusterRequest::RenameNx => self.exec_rename(cmd).await,
            ClusterRequest::MSet => self.exec_mset(cmd).await,
            ClusterRequest::Del => self.exec_del(cmd).await,
        }
    }

    /// Runs a command on the local engine. Keys whose slot another node
    /// owns get a `MOVED` reply. Writes are refused on locked slots and on
    /// keys held by a prepared transaction, and are recorded as dirty while
    /// their slot is being exported. Keyless writes wait out migrations.
    pub(crate) fn local_exec(&self, cmd: &[Bytes]) -> Reply {
        let keys = command_keys(cmd);
        let guard = self.local_writes();
        if let Err(reply) = guard.check_owner(&keys) {
            return reply;
        }
        let write = lookup_command(&command_name(cmd)).is_some_and(|spec| spec.write);
        if !write {
            return self.engine.exec(cmd);
        }
        if keys.is_empty() {
            if let Err(reply) = guard.table.check_keyless_write() {
                return reply;
            }
            return self.engine.exec(cmd);
        }
        if let Err(reply) = guard.table.check_write(&keys) {
            return reply;
        }
        let reply = self
            .transactions
            .guard_write(&keys, || self.engine.exec(cmd));
        if !reply.is_error() {
            guard.wrote(&keys);
        }
        reply
    }

    // -- membership --

    /// Starts a new cluster with this node owning every slot.
    pub async fn start_as_seed(&self) -> Result<(), ClusterError> {
        let node = NodeInfo::new(self.self_id().clone(), self.config.raft_advertise.clone());
        self.consensus.propose(LogEntry::SeedStart { node }).await?;
        info!(node = %self.self_id(), "cluster seeded");
        Ok(())
    }

    /// Asks the cluster reachable at `seed` to add this node, as a master
    /// or as a slave of `master`.
    pub async fn join(&self, seed: &str, master: Option<&NodeId>) -> Result<(), ClusterError> {
        let mut cmd = cmd_line(&[
            "cluster.join",
            self.self_id().as_str(),
            self.config.raft_advertise.as_str(),
        ]);
        if let Some(master) = master {
            cmd.push(Bytes::copy_from_slice(master.as_str().as_bytes()));
        }
        let reply = self.connections.send(seed, &cmd).await?;
        if let Some(msg) = reply.error_message() {
            return Err(ClusterError::Remote(msg.to_string()));
        }
        info!(%seed, master = ?master.map(NodeId::as_str), "joined cluster");
        Ok(())
    }

    /// `cluster.join <data addr> <raft addr> [master]`
    async fn exec_join(&self, cmd: &[Bytes]) -> Reply {
        let node = NodeInfo::new(NodeId::from(arg(cmd, 1)), arg(cmd, 2));
        let master = cmd.get(3).map(|_| NodeId::from(arg(cmd, 3)));
        if let Some(m) = &master {
            if !self.fsm().read(|s| s.is_master(m)) {
                return Reply::err(format!("{m} is not a master"));
            }
        }
        info!(node = %node.id, raft = %node.raft_addr, "node joining");
        if let Err(e) = self.consensus.add_to_raft(&node).await {
            return e.into();
        }
        match self.consensus.propose(LogEntry::Join { node, master }).await {
            Ok(_) => Reply::ok(),
            Err(e) => e.into(),
        }
    }

    // -- background --

    /// Reacts to applied topology changes until the event channel closes.
    pub fn spawn_observer(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.consensus.subscribe();
        let cluster = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => cluster.handle_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "topology observer fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub(crate) fn handle_event(&self, event: &TopologyEvent) {
        match event {
            TopologyEvent::NodeJoined { node, master } => {
                self.on_node_joined(node, master.as_ref());
            }
            TopologyEvent::MigrationStarted(task) => {
                debug!(task = %task.id, src = %task.src, target = %task.target, "migration recorded");
            }
            TopologyEvent::MigrationFinished(task) => self.on_migration_finished(task),
            TopologyEvent::MigrationAborted(task) => self.on_migration_aborted(task),
            TopologyEvent::FailoverFinished(task) => self.on_failover_finished(task),
        }
    }

    /// Starts the heartbeat/failover loop and the rebalance loop. The
    /// heartbeat tick also expires stale transactions.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let cluster = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            let mut tick = tokio::time::interval(cluster.config.heartbeat_interval);
            loop {
                tick.tick().await;
                cluster.send_heartbeat().await;
                cluster.check_failover().await;
                cluster.transactions.purge();
            }
        });

        let cluster = Arc::clone(self);
        let rebalance = tokio::spawn(async move {
            let mut tick = tokio::time::interval(cluster.config.rebalance_interval);
            loop {
                tick.tick().await;
                match cluster.rebalance().await {
                    Ok(0) => {}
                    Ok(started) => info!(started, "rebalance pass started migrations"),
                    Err(e) => warn!("rebalance: {e}"),
                }
            }
        });
        vec![heartbeat, rebalance]
    }

    /// Drops pooled peer connections.
    pub fn close(&self) {
        self.connections.close();
    }
}
