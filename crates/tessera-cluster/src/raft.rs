//! Raft consensus for cluster topology.
//!
//! Uses openraft to agree on [`LogEntry`] values. Only topology changes go
//! through raft; data commands never touch the log. The state machine is
//! the shared [`Fsm`], so everything the cluster layer reads comes from
//! entries this node has applied.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory as RaftNetworkFactoryTrait};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, Snapshot};
use openraft::{
    BasicNode, ChangeMembers, Config, Entry, EntryPayload, LogId, OptionalSend, Raft, RaftStorage,
    RaftTypeConfig, ServerState, SnapshotMeta, StorageError, StorageIOError, StoredMembership,
    Vote,
};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::auth::ClusterSecret;
use crate::consensus::{Consensus, RaftState};
use crate::error::ClusterError;
use crate::raft_transport::{read_rpc, write_rpc, RaftRpc, RaftRpcResponse};
use crate::topology::{ApplyResponse, Fsm, LogEntry, NodeId, NodeInfo, TopologyState};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct TypeConfig;

impl RaftTypeConfig for TypeConfig {
    type D = LogEntry;
    type R = ApplyResponse;
    type Node = BasicNode;
    type NodeId = u64;
    type Entry = Entry<TypeConfig>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<TypeConfig>;
}

/// Serialized state machine image.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TopologySnapshot {
    pub last_applied: Option<LogId<u64>>,
    pub last_membership: StoredMembership<u64, BasicNode>,
    pub state: TopologyState,
}

/// In-memory log and vote storage, applying committed entries to an [`Fsm`].
#[derive(Debug)]
pub struct Storage {
    vote: RwLock<Option<Vote<u64>>>,
    log: RwLock<BTreeMap<u64, Entry<TypeConfig>>>,
    last_purged: RwLock<Option<LogId<u64>>>,
    last_applied: RwLock<Option<LogId<u64>>>,
    last_membership: RwLock<StoredMembership<u64, BasicNode>>,
    snapshot: RwLock<Option<StoredSnapshot>>,
    fsm: Arc<Fsm>,
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<u64, BasicNode>,
    data: Vec<u8>,
}

impl Storage {
    pub fn new(fsm: Arc<Fsm>) -> Arc<Self> {
        Arc::new(Self {
            vote: RwLock::new(None),
            log: RwLock::new(BTreeMap::new()),
            last_purged: RwLock::new(None),
            last_applied: RwLock::new(None),
            last_membership: RwLock::new(StoredMembership::default()),
            snapshot: RwLock::new(None),
            fsm,
        })
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }
}

impl RaftLogReader<TypeConfig> for Arc<Storage> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<u64>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, v)| v.clone()).collect())
    }
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<Storage> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();

        let snapshot = TopologySnapshot {
            last_applied,
            last_membership: membership.clone(),
            state: self.fsm.snapshot(),
        };
        let data =
            serde_json::to_vec(&snapshot).map_err(|e| StorageIOError::write_snapshot(None, &e))?;

        let snapshot_id = last_applied
            .map(|id| format!("{}-{}", id.leader_id, id.index))
            .unwrap_or_else(|| "0-0".to_string());
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for Arc<Storage> {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<u64>> {
        let log = self.log.read().await;
        let last = log.iter().next_back().map(|(_, e)| e.log_id);
        let purged = *self.last_purged.read().await;
        Ok(LogState {
            last_purged_log_id: purged,
            last_log_id: last.or(purged),
        })
    }

    async fn save_vote(&mut self, vote: &Vote<u64>) -> Result<(), StorageError<u64>> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<u64>>, StorageError<u64>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        Arc::clone(self)
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<u64>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<u64>,
    ) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        log.split_off(&log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<u64>) -> Result<(), StorageError<u64>> {
        let mut log = self.log.write().await;
        *log = log.split_off(&(log_id.index + 1));
        *self.last_purged.write().await = Some(log_id);
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<u64>>, StoredMembership<u64, BasicNode>), StorageError<u64>> {
        let last_applied = *self.last_applied.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyResponse>, StorageError<u64>> {
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            *self.last_applied.write().await = Some(entry.log_id);
            let index = entry.log_id.index;
            match &entry.payload {
                EntryPayload::Blank => {
                    self.fsm.mark_applied(index);
                    results.push(ApplyResponse::Ok);
                }
                EntryPayload::Normal(cmd) => {
                    results.push(self.fsm.apply(index, cmd));
                }
                EntryPayload::Membership(m) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), m.clone());
                    self.fsm.mark_applied(index);
                    results.push(ApplyResponse::Ok);
                }
            }
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        Arc::clone(self)
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<u64>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<u64, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<u64>> {
        let data = snapshot.into_inner();
        let snap: TopologySnapshot = serde_json::from_slice(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;

        *self.last_applied.write().await = snap.last_applied;
        *self.last_membership.write().await = snap.last_membership;
        let index = snap.last_applied.map_or(0, |id| id.index);
        self.fsm.restore(snap.state, index);

        *self.snapshot.write().await = Some(StoredSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<u64>> {
        let snap = self.snapshot.read().await;
        Ok(snap.as_ref().map(|s| Snapshot {
            meta: s.meta.clone(),
            snapshot: Box::new(Cursor::new(s.data.clone())),
        }))
    }
}

// -- network --

/// Per-peer network handle. Opens a short-lived TCP connection per RPC;
/// raft traffic here is a heartbeat every few hundred milliseconds plus
/// the occasional topology entry.
pub struct RaftNetworkClient {
    target_addr: String,
    secret: Option<Arc<ClusterSecret>>,
}

impl RaftNetwork<TypeConfig> for RaftNetworkClient {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::AppendEntries(rpc)).await? {
            RaftRpcResponse::AppendEntries(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<u64>,
        _option: RPCOption,
    ) -> Result<VoteResponse<u64>, RPCError<u64, BasicNode, RaftError<u64>>> {
        match self.call(RaftRpc::Vote(rpc)).await? {
            RaftRpcResponse::Vote(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<u64>,
        RPCError<u64, BasicNode, RaftError<u64, InstallSnapshotError>>,
    > {
        let resp = self
            .send_rpc(RaftRpc::InstallSnapshot(rpc))
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        match resp {
            RaftRpcResponse::InstallSnapshot(r) => Ok(r),
            _ => Err(unexpected_variant()),
        }
    }
}

impl RaftNetworkClient {
    async fn call(
        &self,
        rpc: RaftRpc,
    ) -> Result<RaftRpcResponse, RPCError<u64, BasicNode, RaftError<u64>>> {
        self.send_rpc(rpc)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))
    }

    async fn send_rpc(&self, rpc: RaftRpc) -> std::io::Result<RaftRpcResponse> {
        let secret = self.secret.as_deref();
        let mut stream = TcpStream::connect(self.target_addr.as_str()).await?;
        write_rpc(&mut stream, &rpc, secret).await?;
        read_rpc(&mut stream, secret).await
    }
}

fn unexpected_variant<E: std::error::Error>() -> RPCError<u64, BasicNode, E> {
    RPCError::Network(NetworkError::new(&std::io::Error::other(
        "unexpected response variant",
    )))
}

/// Creates per-peer clients. `BasicNode::addr` holds the advertised raft
/// address.
pub struct RaftNetworkFactory {
    secret: Option<Arc<ClusterSecret>>,
}

impl RaftNetworkFactoryTrait<TypeConfig> for RaftNetworkFactory {
    type Network = RaftNetworkClient;

    async fn new_client(&mut self, _target: u64, node: &BasicNode) -> RaftNetworkClient {
        RaftNetworkClient {
            target_addr: node.addr.clone(),
            secret: self.secret.clone(),
        }
    }
}

// -- inbound RPCs --

/// Accepts raft connections: one request frame in, one response frame out.
fn spawn_raft_listener(
    raft: Raft<TypeConfig>,
    listener: TcpListener,
    secret: Option<Arc<ClusterSecret>>,
) {
    tokio::spawn(async move {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("raft accept error: {e}");
                    continue;
                }
            };

            let raft = raft.clone();
            let secret = secret.clone();
            tokio::spawn(async move {
                let secret = secret.as_deref();
                let rpc: RaftRpc = match read_rpc(&mut stream, secret).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("raft read error from {peer}: {e}");
                        return;
                    }
                };

                let response = match rpc {
                    RaftRpc::AppendEntries(req) => match raft.append_entries(req).await {
                        Ok(r) => RaftRpcResponse::AppendEntries(r),
                        Err(e) => {
                            debug!("append_entries error: {e}");
                            return;
                        }
                    },
                    RaftRpc::Vote(req) => match raft.vote(req).await {
                        Ok(r) => RaftRpcResponse::Vote(r),
                        Err(e) => {
                            debug!("vote error: {e}");
                            return;
                        }
                    },
                    RaftRpc::InstallSnapshot(req) => {
                        let snapshot = Snapshot {
                            meta: req.meta.clone(),
                            snapshot: Box::new(Cursor::new(req.data.clone())),
                        };
                        match raft.install_full_snapshot(req.vote, snapshot).await {
                            Ok(r) => RaftRpcResponse::InstallSnapshot(InstallSnapshotResponse {
                                vote: r.vote,
                            }),
                            Err(e) => {
                                debug!("install_snapshot error: {e}");
                                return;
                            }
                        }
                    }
                };

                if let Err(e) = write_rpc(&mut stream, &response, secret).await {
                    debug!("raft write error to {peer}: {e}");
                }
            });
        }
    });
}

// -- RaftNode --

/// Owns the `Raft<TypeConfig>` handle and implements [`Consensus`] for it.
pub struct RaftNode {
    raft: Raft<TypeConfig>,
    fsm: Arc<Fsm>,
    local: NodeInfo,
}

impl RaftNode {
    /// Starts raft for `local`, serving peers on `listener`.
    pub async fn start(
        local: NodeInfo,
        listener: TcpListener,
        fsm: Arc<Fsm>,
        secret: Option<Arc<ClusterSecret>>,
    ) -> Result<Self, ClusterError> {
        let config = Config {
            cluster_name: "tessera".to_string(),
            heartbeat_interval: 250,
            election_timeout_min: 1000,
            election_timeout_max: 2000,
            ..Config::default()
        }
        .validate()
        .map_err(|e| ClusterError::Configuration(e.to_string()))?;

        let storage = Storage::new(Arc::clone(&fsm));
        let (log_store, state_machine) = Adaptor::new(storage);
        let raft = Raft::new(
            local.raft_id,
            Arc::new(config),
            RaftNetworkFactory {
                secret: secret.clone(),
            },
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        if let Ok(addr) = listener.local_addr() {
            info!(raft_id = local.raft_id, "raft listener on {addr}");
        }
        spawn_raft_listener(raft.clone(), listener, secret);

        Ok(Self { raft, fsm, local })
    }

    /// Initializes a single-member group. Only the seed calls this, once.
    pub async fn bootstrap_single(&self) -> Result<(), ClusterError> {
        let mut members = BTreeMap::new();
        members.insert(
            self.local.raft_id,
            BasicNode {
                addr: self.local.raft_addr.clone(),
            },
        );
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ClusterError::Consensus(e.to_string()))
    }

    pub fn raft_handle(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    fn voter_ids(&self) -> BTreeSet<u64> {
        self.raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect()
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!("raft shutdown: {e}");
        }
    }
}

impl Consensus for RaftNode {
    async fn propose(&self, entry: LogEntry) -> Result<u64, ClusterError> {
        match self.raft.client_write(entry).await {
            Ok(resp) => match resp.data {
                ApplyResponse::Ok => Ok(resp.log_id.index),
                ApplyResponse::Error(msg) => Err(ClusterError::Rejected(msg)),
            },
            Err(e) => Err(ClusterError::Consensus(e.to_string())),
        }
    }

    async fn add_to_raft(&self, node: &NodeInfo) -> Result<(), ClusterError> {
        if self.voter_ids().contains(&node.raft_id) {
            return Ok(());
        }
        self.raft
            .add_learner(
                node.raft_id,
                BasicNode {
                    addr: node.raft_addr.clone(),
                },
                true,
            )
            .await
            .map_err(|e| ClusterError::Consensus(e.to_string()))?;

        let mut ids = BTreeSet::new();
        ids.insert(node.raft_id);
        self.raft
            .change_membership(ChangeMembers::AddVoterIds(ids), false)
            .await
            .map_err(|e| ClusterError::Consensus(e.to_string()))?;
        info!(node = %node.id, raft_id = node.raft_id, "added to raft group");
        Ok(())
    }

    fn state(&self) -> RaftState {
        match self.raft.metrics().borrow().state {
            ServerState::Leader => RaftState::Leader,
            ServerState::Candidate => RaftState::Candidate,
            _ => RaftState::Follower,
        }
    }

    fn leader_address(&self) -> Option<NodeId> {
        let leader = self.raft.metrics().borrow().current_leader?;
        if leader == self.local.raft_id {
            return Some(self.local.id.clone());
        }
        self.fsm.read(|s| {
            s.nodes
                .values()
                .find(|n| n.raft_id == leader)
                .map(|n| n.id.clone())
        })
    }

    fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{MigratingTask, TopologyEvent};
    use openraft::CommittedLeaderId;
    use std::time::Duration;

    fn log_id(term: u64, index: u64) -> LogId<u64> {
        LogId::new(CommittedLeaderId::new(term, 0), index)
    }

    fn normal(index: u64, cmd: LogEntry) -> Entry<TypeConfig> {
        Entry {
            log_id: log_id(1, index),
            payload: EntryPayload::Normal(cmd),
        }
    }

    fn node(addr: &str) -> NodeInfo {
        NodeInfo::new(NodeId::from(addr), "127.0.0.1:1")
    }

    #[tokio::test]
    async fn apply_updates_fsm_and_index() {
        let fsm = Arc::new(Fsm::new());
        let mut storage = Storage::new(Arc::clone(&fsm));

        let results = storage
            .apply_to_state_machine(&[
                normal(1, LogEntry::SeedStart { node: node("a:1") }),
                normal(
                    2,
                    LogEntry::Join {
                        node: node("b:1"),
                        master: None,
                    },
                ),
            ])
            .await
            .unwrap();
        assert_eq!(results, vec![ApplyResponse::Ok, ApplyResponse::Ok]);
        assert_eq!(fsm.applied_index(), 2);
        assert_eq!(fsm.pick_node(0).unwrap(), NodeId::from("a:1"));
        assert!(fsm.get_slaves(&NodeId::from("b:1")).is_some());
    }

    #[tokio::test]
    async fn rejected_entries_still_advance_index() {
        let fsm = Arc::new(Fsm::new());
        let mut storage = Storage::new(Arc::clone(&fsm));
        let task = MigratingTask {
            id: "t".into(),
            src: NodeId::from("a:1"),
            target: NodeId::from("b:1"),
            slots: vec![1],
        };
        let results = storage
            .apply_to_state_machine(&[normal(1, LogEntry::FinishMigrate(task))])
            .await
            .unwrap();
        assert!(matches!(&results[0], ApplyResponse::Error(msg) if msg.contains("not found")));
        assert_eq!(fsm.applied_index(), 1);
    }

    #[tokio::test]
    async fn blank_entries_advance_index_quietly() {
        let fsm = Arc::new(Fsm::new());
        let mut events = fsm.subscribe();
        let mut storage = Storage::new(Arc::clone(&fsm));
        storage
            .apply_to_state_machine(&[Entry {
                log_id: log_id(1, 5),
                payload: EntryPayload::Blank,
            }])
            .await
            .unwrap();
        assert_eq!(fsm.applied_index(), 5);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn snapshot_installs_on_fresh_storage() {
        let fsm = Arc::new(Fsm::new());
        let mut storage = Storage::new(Arc::clone(&fsm));
        storage
            .apply_to_state_machine(&[normal(1, LogEntry::SeedStart { node: node("a:1") })])
            .await
            .unwrap();
        let snapshot = storage.build_snapshot().await.unwrap();

        let other_fsm = Arc::new(Fsm::new());
        let mut other = Storage::new(Arc::clone(&other_fsm));
        other
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();
        assert_eq!(other_fsm.snapshot(), fsm.snapshot());
        assert_eq!(other_fsm.applied_index(), 1);
        assert!(other.get_current_snapshot().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn log_and_vote_storage() {
        let mut storage = Storage::new(Arc::new(Fsm::new()));
        let entries: Vec<Entry<TypeConfig>> = (1..=4)
            .map(|i| Entry {
                log_id: log_id(1, i),
                payload: EntryPayload::Blank,
            })
            .collect();
        storage.append_to_log(entries).await.unwrap();
        storage.delete_conflict_logs_since(log_id(1, 4)).await.unwrap();
        storage.purge_logs_upto(log_id(1, 1)).await.unwrap();

        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 3)));
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 1)));
        let remaining = storage.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(remaining.len(), 2);

        let vote = Vote::new(1, 1);
        storage.save_vote(&vote).await.unwrap();
        assert_eq!(storage.read_vote().await.unwrap(), Some(vote));
    }

    #[tokio::test]
    async fn single_node_raft_commits_entries() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let raft_addr = listener.local_addr().unwrap().to_string();
        let local = NodeInfo::new(NodeId::from("127.0.0.1:7001"), raft_addr);
        let fsm = Arc::new(Fsm::new());
        let mut events = fsm.subscribe();
        let secret = Some(Arc::new(ClusterSecret::from_password("pw")));

        let node = RaftNode::start(local.clone(), listener, Arc::clone(&fsm), secret)
            .await
            .unwrap();
        node.bootstrap_single().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while node.state() != RaftState::Leader {
            assert!(tokio::time::Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(node.leader_address(), Some(local.id.clone()));

        let index = node
            .propose(LogEntry::SeedStart {
                node: local.clone(),
            })
            .await
            .unwrap();
        assert!(fsm.applied_index() >= index);
        assert!(matches!(
            events.recv().await.unwrap(),
            TopologyEvent::NodeJoined { .. }
        ));

        let again = node.propose(LogEntry::SeedStart { node: local }).await;
        assert!(matches!(again, Err(ClusterError::Rejected(_))));
        node.shutdown().await;
    }
}
