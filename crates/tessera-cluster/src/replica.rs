//! Master liveness tracking and leader-driven failover.
//!
//! Every node sends `cluster.heartbeat <self>` to the raft leader once per
//! heartbeat interval; the leader records its own heartbeat locally. A
//! master silent for longer than the failover timeout, with at least one
//! live slave, gets replaced: the leader detaches the slave with `slaveof
//! no one` and commits `FinishFailover`. Every other member of the old
//! replica set reparents itself when it applies that entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tessera_protocol::{cmd_line, Reply};
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::consensus::{Consensus, RaftState};
use crate::error::ClusterError;
use crate::topology::{FailoverTask, LogEntry, NodeId, TopologyState};

/// Last heartbeat per node, kept on the leader.
#[derive(Debug)]
pub struct ReplicaManager {
    heartbeats: Mutex<HashMap<NodeId, Instant>>,
    timeout: Duration,
}

impl ReplicaManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            heartbeats: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn heartbeats(&self) -> MutexGuard<'_, HashMap<NodeId, Instant>> {
        self.heartbeats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_heartbeat(&self, node: NodeId) {
        self.record_heartbeat_at(node, Instant::now());
    }

    pub fn record_heartbeat_at(&self, node: NodeId, at: Instant) {
        self.heartbeats().insert(node, at);
    }

    pub fn forget(&self, node: &NodeId) {
        self.heartbeats().remove(node);
    }

    pub fn last_seen(&self, node: &NodeId) -> Option<Instant> {
        self.heartbeats().get(node).copied()
    }

    /// `(old master, new master)` pairs for every timed-out master that has
    /// a live slave. The first live slave in registration order wins.
    /// Nodes never heard from count as seen at `now`.
    pub fn failover_candidates(
        &self,
        state: &TopologyState,
        now: Instant,
    ) -> Vec<(NodeId, NodeId)> {
        let mut heartbeats = self.heartbeats();
        for node in state.nodes.keys() {
            heartbeats.entry(node.clone()).or_insert(now);
        }
        let alive = |node: &NodeId| {
            heartbeats
                .get(node)
                .is_some_and(|seen| now.saturating_duration_since(*seen) <= self.timeout)
        };

        let mut candidates = Vec::new();
        for (master, ms) in &state.master_slaves {
            if alive(master) {
                continue;
            }
            match ms.slaves.iter().find(|s| alive(s)) {
                Some(slave) => candidates.push((master.clone(), slave.clone())),
                None if !ms.slaves.is_empty() => {
                    debug!(%master, "master timed out but no slave is alive");
                }
                None => {}
            }
        }
        candidates
    }
}

impl<C: Consensus> Cluster<C> {
    /// `cluster.heartbeat <node>`
    pub(crate) fn exec_heartbeat(&self, node: &[u8]) -> Reply {
        let node = NodeId::from(String::from_utf8_lossy(node).into_owned());
        self.replicas.record_heartbeat(node);
        Reply::ok()
    }

    /// Reports this node as alive to the leader.
    pub async fn send_heartbeat(self: &Arc<Self>) {
        if self.consensus.state() == RaftState::Leader {
            self.replicas.record_heartbeat(self.self_id().clone());
            return;
        }
        let reply = self
            .relay_leader(&cmd_line(&["cluster.heartbeat", self.self_id().as_str()]))
            .await;
        if reply.is_error() {
            debug!("heartbeat: {reply}");
        }
    }

    /// Fails over every timed-out master. Leader only. Returns how many
    /// failovers committed.
    pub async fn check_failover(self: &Arc<Self>) -> usize {
        if self.consensus.state() != RaftState::Leader {
            return 0;
        }
        let candidates = self.fsm().read(|state| {
            self.replicas
                .failover_candidates(state, Instant::now())
        });
        let mut done = 0;
        for (old_master, new_master) in candidates {
            match self.trigger_failover(&old_master, &new_master).await {
                Ok(()) => done += 1,
                Err(e) => warn!(%old_master, %new_master, "failover failed: {e}"),
            }
        }
        done
    }

    /// Promotes `new_master` in place of `old_master`.
    pub async fn trigger_failover(
        self: &Arc<Self>,
        old_master: &NodeId,
        new_master: &NodeId,
    ) -> Result<(), ClusterError> {
        let task = FailoverTask {
            id: uuid::Uuid::new_v4().to_string(),
            old_master: old_master.clone(),
            new_master: new_master.clone(),
        };
        info!(id = %task.id, %old_master, %new_master, "starting failover");

        let reply = self
            .relay(new_master, &cmd_line(&["slaveof", "no", "one"]))
            .await;
        if let Some(msg) = reply.error_message() {
            return Err(ClusterError::Remote(msg.to_string()));
        }
        self.consensus
            .propose(LogEntry::FinishFailover(task.clone()))
            .await?;
        self.replicas.forget(old_master);
        info!(id = %task.id, %new_master, "failover committed");
        Ok(())
    }

    /// Follows the new master after a committed failover, unless this node
    /// is the new master.
    pub(crate) fn on_failover_finished(&self, task: &FailoverTask) {
        if task.new_master == *self.self_id() {
            return;
        }
        let master = self.fsm().read(|s| s.master_of(self.self_id()).cloned());
        if master.as_ref() == Some(&task.new_master) {
            self.follow(&task.new_master);
        }
    }

    /// Applies this node's own join as a replica.
    pub(crate) fn on_node_joined(&self, node: &NodeId, master: Option<&NodeId>) {
        if node != self.self_id() {
            return;
        }
        if let Some(master) = master {
            self.follow(master);
        }
    }

    fn follow(&self, master: &NodeId) {
        let Some((host, port)) = master.host_port() else {
            warn!(%master, "cannot follow master with malformed address");
            return;
        };
        let port = port.to_string();
        let reply = self.engine.exec(&cmd_line(&["slaveof", host, port.as_str()]));
        if reply.is_error() {
            warn!(%master, "slaveof failed: {reply}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{MasterSlave, NodeInfo};
    use tessera_core::Role;

    use crate::testkit::{wait_until, TestCluster};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    fn layout(masters: &[(&str, &[&str])]) -> TopologyState {
        let mut state = TopologyState::default();
        for (master, slaves) in masters {
            let ms = MasterSlave {
                master: id(master),
                slaves: slaves.iter().map(|s| id(s)).collect(),
            };
            for node in std::iter::once(master).chain(slaves.iter()) {
                state
                    .nodes
                    .insert(id(node), NodeInfo::new(id(node), "127.0.0.1:1"));
            }
            for slave in *slaves {
                state.slave_masters.insert(id(slave), id(master));
            }
            state.master_slaves.insert(id(master), ms);
        }
        state
    }

    #[test]
    fn unseen_nodes_are_not_timed_out() {
        let replicas = ReplicaManager::new(Duration::from_secs(10));
        let state = layout(&[("a:1", &["b:1"])]);
        let now = Instant::now();
        assert!(replicas.failover_candidates(&state, now).is_empty());
        assert_eq!(replicas.last_seen(&id("a:1")), Some(now));
    }

    #[test]
    fn timed_out_master_with_live_slave() {
        let timeout = Duration::from_secs(10);
        let replicas = ReplicaManager::new(timeout);
        let state = layout(&[("a:1", &["b:1", "c:1"]), ("d:1", &[])]);
        let start = Instant::now();
        for node in ["a:1", "b:1", "c:1", "d:1"] {
            replicas.record_heartbeat_at(id(node), start);
        }
        let later = start + timeout + Duration::from_secs(1);
        replicas.record_heartbeat_at(id("c:1"), later);

        // d:1 has no slave to promote; b:1 is as silent as its master
        let candidates = replicas.failover_candidates(&state, later);
        assert_eq!(candidates, vec![(id("a:1"), id("c:1"))]);

        replicas.forget(&id("a:1"));
        assert_eq!(replicas.last_seen(&id("a:1")), None);
    }

    #[test]
    fn no_candidate_without_live_slave() {
        let timeout = Duration::from_secs(10);
        let replicas = ReplicaManager::new(timeout);
        let state = layout(&[("a:1", &["b:1"])]);
        let start = Instant::now();
        replicas.record_heartbeat_at(id("a:1"), start);
        replicas.record_heartbeat_at(id("b:1"), start);
        let later = start + timeout * 2;
        assert!(replicas.failover_candidates(&state, later).is_empty());
    }

    #[tokio::test]
    async fn joined_slaves_follow_their_master() {
        let tc = TestCluster::with_replicas(1, &[0, 0]).await;
        let master = tc.id(0);
        let (host, port) = master.host_port().unwrap();
        let expected = Role::Replica {
            host: host.to_string(),
            port,
        };
        wait_until(|| tc.node(1).engine().role() == expected).await;
        wait_until(|| tc.node(2).engine().role() == expected).await;
        assert_eq!(tc.node(0).engine().role(), Role::Master);
    }

    #[tokio::test]
    async fn failover_promotes_slave_and_reparents_the_rest() {
        // node 0 is the master, 1 and 2 its slaves; node 2 leads raft
        let tc = TestCluster::with_replicas(1, &[0, 0]).await;
        tc.set_leader(2);
        let (old, new, third) = (tc.id(0), tc.id(1), tc.id(2));
        wait_until(|| tc.node(1).engine().role() != Role::Master).await;

        let leader = tc.node(2);
        let now = Instant::now();
        leader
            .replicas
            .record_heartbeat_at(old.clone(), now - Duration::from_secs(60));
        leader.replicas.record_heartbeat_at(new.clone(), now);
        leader.replicas.record_heartbeat_at(third.clone(), now);

        assert_eq!(leader.check_failover().await, 1);
        assert!(leader.fsm().read(|s| s.is_master(&new)));
        assert_eq!(leader.fsm().pick_node(0).unwrap(), new);

        // the promoted node takes writes directly
        assert_eq!(tc.node(1).engine().role(), Role::Master);
        assert!(tc.local(1, &["SET", "k", "v"]).is_ok());

        let (host, port) = new.host_port().unwrap();
        let follows_new = Role::Replica {
            host: host.to_string(),
            port,
        };
        wait_until(|| tc.node(2).engine().role() == follows_new).await;
        wait_until(|| tc.node(0).engine().role() == follows_new).await;
        assert!(tc.local(0, &["SET", "k", "v"]).is_error());
        assert_eq!(leader.replicas.last_seen(&old), None);
    }
}
