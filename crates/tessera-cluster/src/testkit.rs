//! In-process clusters for tests.
//!
//! Every node gets a real data listener on 127.0.0.1 and talks to its
//! peers over TCP. Consensus is replaced by [`LocalConsensus`]: a shared
//! log that applies each entry to every registered state machine before
//! `propose` returns.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tessera_core::Engine;
use tessera_protocol::{cmd_line, Reply};
use tokio::net::TcpListener;

use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::consensus::{Consensus, RaftState};
use crate::error::ClusterError;
use crate::listener::{serve, ListenerOptions};
use crate::slots::{get_slot, SLOT_COUNT};
use crate::topology::{ApplyResponse, Fsm, LogEntry, MigratingTask, NodeId, NodeInfo};

#[derive(Default)]
struct LogInner {
    entries: Vec<LogEntry>,
    fsms: Vec<Arc<Fsm>>,
    ids: Vec<NodeId>,
    leader: usize,
    /// Nodes that stop applying entries until thawed.
    frozen: HashSet<usize>,
}

/// A log every node sees at once.
#[derive(Default)]
pub struct SharedLog {
    inner: Mutex<LogInner>,
}

impl SharedLog {
    fn inner(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a state machine, replaying everything committed so far.
    fn register(&self, id: NodeId, fsm: Arc<Fsm>) -> usize {
        let mut inner = self.inner();
        for (i, entry) in inner.entries.iter().enumerate() {
            fsm.apply(i as u64 + 1, entry);
        }
        inner.fsms.push(fsm);
        inner.ids.push(id);
        inner.ids.len() - 1
    }

    fn append(&self, entry: LogEntry) -> Result<u64, ClusterError> {
        let mut inner = self.inner();
        inner.entries.push(entry.clone());
        let index = inner.entries.len() as u64;
        let mut outcome = ApplyResponse::Ok;
        for (i, fsm) in inner.fsms.iter().enumerate() {
            if !inner.frozen.contains(&i) {
                outcome = fsm.apply(index, &entry);
            }
        }
        match outcome {
            ApplyResponse::Ok => Ok(index),
            ApplyResponse::Error(msg) => Err(ClusterError::Rejected(msg)),
        }
    }

    fn set_leader(&self, node: usize) {
        self.inner().leader = node;
    }

    fn freeze(&self, node: usize) {
        self.inner().frozen.insert(node);
    }

    /// Resumes a frozen node, applying what it missed.
    fn thaw(&self, node: usize) {
        let mut inner = self.inner();
        inner.frozen.remove(&node);
        let fsm = Arc::clone(&inner.fsms[node]);
        let applied = fsm.applied_index() as usize;
        for (i, entry) in inner.entries.iter().enumerate().skip(applied) {
            fsm.apply(i as u64 + 1, entry);
        }
    }
}

/// [`Consensus`] backed by a [`SharedLog`].
pub struct LocalConsensus {
    log: Arc<SharedLog>,
    fsm: Arc<Fsm>,
    me: usize,
}

impl Consensus for LocalConsensus {
    async fn propose(&self, entry: LogEntry) -> Result<u64, ClusterError> {
        self.log.append(entry)
    }

    async fn add_to_raft(&self, _node: &NodeInfo) -> Result<(), ClusterError> {
        Ok(())
    }

    fn state(&self) -> RaftState {
        if self.log.inner().leader == self.me {
            RaftState::Leader
        } else {
            RaftState::Follower
        }
    }

    fn leader_address(&self) -> Option<NodeId> {
        let inner = self.log.inner();
        inner.ids.get(inner.leader).cloned()
    }

    fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }
}

pub type TestNode = Arc<Cluster<LocalConsensus>>;

pub struct TestCluster {
    log: Arc<SharedLog>,
    nodes: Vec<TestNode>,
    password: Option<String>,
}

impl TestCluster {
    /// `n` masters with the slot space split evenly between them. Node 0
    /// seeds the cluster and leads.
    pub async fn start(n: usize) -> Self {
        Self::build(n, None).await
    }

    pub async fn start_with_password(n: usize, password: &str) -> Self {
        Self::build(n, Some(password.to_string())).await
    }

    /// `masters` masters, then one slave per entry of `slave_of`, which
    /// names the master's node index.
    pub async fn with_replicas(masters: usize, slave_of: &[usize]) -> Self {
        let mut tc = Self::start(masters).await;
        for &master in slave_of {
            let node = tc.add_node().await;
            tc.join(node, Some(master)).await;
        }
        tc
    }

    async fn build(n: usize, password: Option<String>) -> Self {
        assert!(n > 0);
        let mut tc = Self {
            log: Arc::new(SharedLog::default()),
            nodes: Vec::new(),
            password,
        };
        let seed = tc.add_node().await;
        tc.node(seed).start_as_seed().await.expect("seed");
        for _ in 1..n {
            let node = tc.add_node().await;
            tc.join(node, None).await;
        }

        let per_node = SLOT_COUNT as usize / n;
        for i in 1..n {
            let end = if i + 1 == n {
                SLOT_COUNT as usize
            } else {
                (i + 1) * per_node
            };
            let task = MigratingTask {
                id: format!("split-{i}"),
                src: tc.id(0),
                target: tc.id(i),
                slots: (i * per_node..end).map(|s| s as u16).collect(),
            };
            tc.log
                .append(LogEntry::StartMigrate(task.clone()))
                .expect("start split");
            tc.log.append(LogEntry::FinishMigrate(task)).expect("split");
        }
        tc
    }

    /// Starts a node that is not yet part of the topology.
    pub async fn add_node(&mut self) -> usize {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr").to_string();
        let id = NodeId::from(addr.clone());

        let fsm = Arc::new(Fsm::new());
        let me = self.log.register(id.clone(), Arc::clone(&fsm));
        let consensus = LocalConsensus {
            log: Arc::clone(&self.log),
            fsm,
            me,
        };

        let mut config = ClusterConfig::new(id, addr);
        config.commit_poll_interval = Duration::from_millis(10);
        config.pool.password = self.password.clone();
        let cluster = Cluster::new(config, Arc::new(Engine::new()), consensus);
        cluster.spawn_observer();

        let options = ListenerOptions {
            requirepass: self.password.clone(),
            ..ListenerOptions::default()
        };
        tokio::spawn(serve(
            listener,
            Arc::clone(&cluster),
            options,
            std::future::pending(),
        ));
        self.nodes.push(cluster);
        me
    }

    /// Joins node `i` through node 0.
    pub async fn join(&self, i: usize, master: Option<usize>) {
        let master = master.map(|m| self.id(m));
        self.node(i)
            .join(self.id(0).as_str(), master.as_ref())
            .await
            .expect("join");
    }

    pub fn node(&self, i: usize) -> &TestNode {
        &self.nodes[i]
    }

    pub fn id(&self, i: usize) -> NodeId {
        self.nodes[i].self_id().clone()
    }

    pub fn set_leader(&self, i: usize) {
        self.log.set_leader(i);
    }

    /// Stops node `i` from applying new log entries, leaving it with a
    /// stale topology.
    pub fn freeze(&self, i: usize) {
        self.log.freeze(i);
    }

    pub fn thaw(&self, i: usize) {
        self.log.thaw(i);
    }

    /// Runs a command through node `i`'s cluster layer.
    pub async fn exec(&self, i: usize, parts: &[&str]) -> Reply {
        self.node(i).exec(&cmd_line(parts)).await
    }

    /// Runs a command on node `i`'s engine, bypassing routing.
    pub fn local(&self, i: usize, parts: &[&str]) -> Reply {
        self.node(i).engine().exec(&cmd_line(parts))
    }

    /// Prepares `parts` (operation first) as transaction `tx_id` on node `i`.
    pub fn local_prepare(&self, i: usize, tx_id: &str, parts: &[&str]) -> Reply {
        let node = self.node(i);
        let args: Vec<Bytes> = cmd_line(&parts[1..]);
        node.transactions
            .prepare(node.engine(), &node.local_writes(), tx_id, parts[0], &args)
    }
}

/// The first `{prefix}{n}` key owned by node `i`.
pub fn key_on(tc: &TestCluster, i: usize, prefix: &str) -> String {
    let owner = tc.id(i);
    (0..)
        .map(|n| format!("{prefix}{n}"))
        .find(|key| tc.node(0).pick_node(get_slot(key.as_bytes())).ok().as_ref() == Some(&owner))
        .expect("some key maps to every node")
}

/// Polls `cond` until it holds, panicking after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationPhase;

    /// Records a one-slot task from node 0 to `target` and runs the import
    /// side by hand up to the dirty-key flush. Returns the restored count.
    async fn import_by_hand(tc: &TestCluster, target: usize, id: &str, slot: u16) -> usize {
        let (src, dst) = (tc.node(0), tc.node(target));
        let task = MigratingTask {
            id: id.into(),
            src: tc.id(0),
            target: tc.id(target),
            slots: vec![slot],
        };
        src.consensus()
            .propose(LogEntry::StartMigrate(task.clone()))
            .await
            .unwrap();
        dst.slots_mut().begin_import(&task).unwrap();

        let export = cmd_line(&["cluster.migration.export", id]);
        let mut stream = dst
            .connections()
            .new_stream(tc.id(0).as_str(), &export)
            .await
            .unwrap();
        let mut restored = 0;
        loop {
            match stream.recv().await.unwrap().unwrap() {
                Reply::Array(parts) => {
                    let cmd = Reply::Array(parts).into_cmd_line().unwrap();
                    assert!(dst.exec_migration_restore(&cmd).is_ok());
                    restored += 1;
                }
                reply => {
                    assert_eq!(reply, Reply::ok());
                    break;
                }
            }
        }
        assert_eq!(src.slots().phase(id), Some(MigrationPhase::Exporting));
        restored
    }

    #[tokio::test]
    async fn shared_log_applies_everywhere() {
        let tc = TestCluster::start(3).await;
        let applied: Vec<u64> = (0..3).map(|i| tc.node(i).fsm().applied_index()).collect();
        assert!(applied.iter().all(|&a| a == applied[0]));
        let owned: usize = (0..3)
            .map(|i| tc.node(0).fsm().read(|s| s.node2slot()[&tc.id(i)].len()))
            .sum();
        assert_eq!(owned, SLOT_COUNT as usize);
    }

    #[tokio::test]
    async fn rebalance_moves_data_to_a_new_master() {
        let mut tc = TestCluster::start(1).await;
        for n in 0..200 {
            let key = format!("key{n}");
            assert!(tc.exec(0, &["SET", &key, &format!("v{n}")]).await.is_ok());
        }
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;

        assert!(tc.node(0).rebalance().await.expect("rebalance") >= 1);
        let target = tc.id(fresh);
        wait_until(|| {
            tc.node(0).fsm().read(|s| {
                s.migratings.is_empty() && s.node2slot()[&target].len() == SLOT_COUNT as usize / 2
            })
        })
        .await;
        wait_until(|| tc.node(0).slots().active() == 0 && tc.node(fresh).slots().active() == 0)
            .await;

        let mut moved = 0;
        for n in 0..200 {
            let key = format!("key{n}");
            assert_eq!(tc.exec(0, &["GET", &key]).await, Reply::bulk(format!("v{n}")));
            let owner = tc.node(0).pick_node(get_slot(key.as_bytes())).unwrap();
            let (here, gone) = if owner == target { (fresh, 0) } else { (0, fresh) };
            assert!(tc.node(here).engine().exists(key.as_bytes()), "{key} missing");
            assert!(!tc.node(gone).engine().exists(key.as_bytes()), "{key} left behind");
            moved += usize::from(owner == target);
        }
        assert!(moved > 0);

        // a balanced cluster plans nothing
        assert_eq!(tc.node(0).rebalance().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writes_during_export_reach_the_target() {
        let mut tc = TestCluster::start(1).await;
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;
        let (src, dst) = (tc.node(0), tc.node(fresh));

        for key in ["{m}kept", "{m}changed", "{m}deleted"] {
            tc.exec(0, &["SET", key, "before"]).await;
        }
        let slot = get_slot(b"{m}");
        assert_eq!(import_by_hand(&tc, fresh, "manual", slot).await, 3);

        // the slot still takes writes on the source while the dump streams
        assert!(tc.exec(0, &["SET", "{m}changed", "after"]).await.is_ok());
        assert_eq!(tc.exec(0, &["DEL", "{m}deleted"]).await, Reply::Integer(1));
        assert!(tc.exec(0, &["SET", "{m}new", "fresh"]).await.is_ok());

        dst.slots_mut()
            .advance("manual", MigrationPhase::Draining)
            .unwrap();
        let done = dst
            .relay(&tc.id(0), &cmd_line(&["cluster.migration.done", "manual"]))
            .await;
        assert_eq!(done, Reply::ok());

        assert_eq!(src.pick_node(slot).unwrap(), tc.id(fresh));
        assert_eq!(tc.local(fresh, &["GET", "{m}kept"]), Reply::bulk("before"));
        assert_eq!(tc.local(fresh, &["GET", "{m}changed"]), Reply::bulk("after"));
        assert_eq!(tc.local(fresh, &["GET", "{m}deleted"]), Reply::Null);
        assert_eq!(tc.local(fresh, &["GET", "{m}new"]), Reply::bulk("fresh"));
        for key in ["{m}kept", "{m}changed", "{m}new"] {
            assert!(!src.engine().exists(key.as_bytes()));
        }
        wait_until(|| dst.slots().active() == 0).await;
        assert!(tc.exec(fresh, &["SET", "{m}kept", "now"]).await.is_ok());
    }

    #[tokio::test]
    async fn keyless_writes_cannot_erase_exported_keys() {
        let mut tc = TestCluster::start(1).await;
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;
        tc.exec(0, &["SET", "{f}k", "before"]).await;
        import_by_hand(&tc, fresh, "flush", get_slot(b"{f}")).await;

        let refused = tc.exec(0, &["FLUSHALL"]).await;
        assert_eq!(refused, Reply::err("slot migration in progress, try again later"));
        assert!(tc.exec(fresh, &["FLUSHALL"]).await.is_error());
        assert!(tc.node(0).engine().exists(b"{f}k"));

        tc.node(fresh)
            .slots_mut()
            .advance("flush", MigrationPhase::Draining)
            .unwrap();
        let done = tc
            .node(fresh)
            .relay(&tc.id(0), &cmd_line(&["cluster.migration.done", "flush"]))
            .await;
        assert_eq!(done, Reply::ok());
        wait_until(|| tc.node(fresh).slots().active() == 0).await;
        assert_eq!(tc.exec(0, &["GET", "{f}k"]).await, Reply::bulk("before"));
        assert!(tc.exec(0, &["FLUSHALL"]).await.is_ok());
    }

    #[tokio::test]
    async fn unconfirmed_route_change_is_reported_and_settled_later() {
        let mut tc = TestCluster::start(1).await;
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;
        let (src, dst) = (tc.node(0), tc.node(fresh));
        tc.exec(0, &["SET", "{r}a", "1"]).await;
        let slot = get_slot(b"{r}");
        import_by_hand(&tc, fresh, "stuck", slot).await;
        dst.slots_mut()
            .advance("stuck", MigrationPhase::Draining)
            .unwrap();

        // the target stops applying the log, so the leader never sees it
        // confirm the new route
        tc.freeze(fresh);
        let done = dst
            .relay(&tc.id(0), &cmd_line(&["cluster.migration.done", "stuck"]))
            .await;
        let msg = done.error_message().unwrap();
        assert!(msg.contains("timed out"), "{msg}");

        // the route did commit; the source settles from the log
        assert_eq!(src.pick_node(slot).unwrap(), tc.id(fresh));
        wait_until(|| src.slots().active() == 0).await;
        assert!(!src.engine().exists(b"{r}a"));

        // both nodes disagree on the owner; the stale one refuses the key
        // instead of sending it back
        assert_eq!(dst.pick_node(slot).unwrap(), tc.id(0));
        let moved = tc.exec(0, &["GET", "{r}a"]).await;
        assert_eq!(moved, Reply::Error(format!("MOVED {slot} {}", tc.id(0))));

        tc.thaw(fresh);
        wait_until(|| dst.slots().active() == 0).await;
        assert_eq!(tc.exec(0, &["GET", "{r}a"]).await, Reply::bulk("1"));
        assert_eq!(tc.exec(fresh, &["GET", "{r}a"]).await, Reply::bulk("1"));
    }

    #[tokio::test]
    async fn commit_wait_gives_up_after_its_poll_budget() {
        let tc = TestCluster::start(2).await;
        let leader = tc.node(0);
        let ahead = leader.fsm().applied_index() + 1_000;
        let err = leader.wait_committed(&tc.id(1), ahead).await.unwrap_err();
        assert!(matches!(err, ClusterError::Timeout(_)), "{err}");

        let applied = tc.node(1).fsm().applied_index();
        assert!(leader.wait_committed(&tc.id(1), applied).await.is_ok());
    }

    #[tokio::test]
    async fn only_one_rebalance_pass_runs_at_a_time() {
        let mut tc = TestCluster::start(1).await;
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;
        let leader = tc.node(0);

        {
            let _pass = leader.rebalance_lock.lock().await;
            assert_eq!(leader.rebalance().await.unwrap(), 0);
            assert!(leader.fsm().read(|s| s.migratings.is_empty()));
        }

        let (a, b) = tokio::join!(leader.rebalance(), leader.rebalance());
        assert_eq!(a.unwrap() + b.unwrap(), 1);
        wait_until(|| leader.fsm().read(|s| s.migratings.is_empty())).await;
        let owned = leader.fsm().read(|s| s.node2slot()[&tc.id(fresh)].len());
        assert_eq!(owned, SLOT_COUNT as usize / 2);
    }

    #[tokio::test]
    async fn abort_requested_by_a_follower_drops_imported_data() {
        let mut tc = TestCluster::start(1).await;
        let fresh = tc.add_node().await;
        tc.join(fresh, None).await;
        tc.exec(0, &["SET", "{x}a", "1"]).await;

        let task = MigratingTask {
            id: "doomed".into(),
            src: tc.id(0),
            target: tc.id(fresh),
            slots: vec![get_slot(b"{x}")],
        };
        tc.node(0)
            .consensus()
            .propose(LogEntry::StartMigrate(task.clone()))
            .await
            .unwrap();
        tc.node(fresh).slots_mut().begin_import(&task).unwrap();
        tc.node(fresh)
            .slots_mut()
            .advance("doomed", MigrationPhase::Draining)
            .unwrap();
        tc.node(fresh)
            .engine()
            .exec(&cmd_line(&["SET", "{x}partial", "1"]));

        assert_eq!(tc.exec(fresh, &["cluster.migration.abort", "doomed"]).await, Reply::ok());
        wait_until(|| tc.node(fresh).slots().active() == 0).await;
        assert!(!tc.node(fresh).engine().exists(b"{x}partial"));
        assert_eq!(tc.node(0).pick_node(task.slots[0]).unwrap(), tc.id(0));
        assert_eq!(tc.local(0, &["GET", "{x}a"]), Reply::bulk("1"));
    }
}
