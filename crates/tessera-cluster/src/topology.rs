//! Replicated cluster topology.
//!
//! [`TopologyState`] is the state machine behind the raft log: node
//! membership, master/slave sets, slot ownership and in-flight migration
//! tasks. It only changes by applying a committed [`LogEntry`]. [`Fsm`]
//! wraps it with a read/write lock, the last applied log index, and a
//! broadcast channel that publishes a [`TopologyEvent`] for every entry
//! that applied successfully.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::ClusterError;
use crate::slots::{SlotMap, SlotRange, SLOT_COUNT};

/// Capacity of the topology event channel. Observers that fall further
/// behind than this see a `Lagged` error and skip ahead.
const EVENT_CAPACITY: usize = 256;

/// Identifies a cluster member. The id is the node's advertised data
/// address (`host:port`), so any node can dial any other straight from the
/// topology.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raft member id derived from the address: the first eight bytes of
    /// its SHA-256 digest.
    pub fn raft_id(&self) -> u64 {
        let digest = Sha256::digest(self.0.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }

    /// Splits the address into host and port.
    pub fn host_port(&self) -> Option<(&str, u16)> {
        let (host, port) = self.0.rsplit_once(':')?;
        Some((host, port.parse().ok()?))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Membership record for one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub raft_id: u64,
    /// Advertised raft transport address.
    pub raft_addr: String,
}

impl NodeInfo {
    pub fn new(id: NodeId, raft_addr: impl Into<String>) -> Self {
        Self {
            raft_id: id.raft_id(),
            id,
            raft_addr: raft_addr.into(),
        }
    }
}

/// A replica set: one master and its slaves in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterSlave {
    pub master: NodeId,
    pub slaves: Vec<NodeId>,
}

/// One slot handoff from `src` to `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratingTask {
    pub id: String,
    pub src: NodeId,
    pub target: NodeId,
    pub slots: Vec<u16>,
}

impl MigratingTask {
    pub fn slot_set(&self) -> BTreeSet<u16> {
        self.slots.iter().copied().collect()
    }
}

/// A committed promotion of `new_master` in place of `old_master`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailoverTask {
    pub id: String,
    pub old_master: NodeId,
    pub new_master: NodeId,
}

/// A topology mutation carried by the raft log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    /// First entry of a new cluster: the seed node owns every slot.
    SeedStart { node: NodeInfo },
    /// A node joins, as a new (empty) master or as a slave of `master`.
    Join {
        node: NodeInfo,
        master: Option<NodeId>,
    },
    /// Records a migration task before any data moves.
    StartMigrate(MigratingTask),
    /// Moves the task's slots to its target.
    FinishMigrate(MigratingTask),
    /// Drops a task that failed before its route change.
    AbortMigrate { task_id: String },
    FinishFailover(FailoverTask),
}

/// Result of applying one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResponse {
    Ok,
    Error(String),
}

/// Published after an entry applied successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    NodeJoined {
        node: NodeId,
        master: Option<NodeId>,
    },
    MigrationStarted(MigratingTask),
    MigrationFinished(MigratingTask),
    MigrationAborted(MigratingTask),
    FailoverFinished(FailoverTask),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyState {
    pub nodes: BTreeMap<NodeId, NodeInfo>,
    pub slots: SlotMap,
    /// Keyed by master id.
    pub master_slaves: BTreeMap<NodeId, MasterSlave>,
    /// Slave id to master id.
    pub slave_masters: BTreeMap<NodeId, NodeId>,
    /// In-flight migration tasks by task id.
    pub migratings: BTreeMap<String, MigratingTask>,
}

impl TopologyState {
    pub fn is_master(&self, node: &NodeId) -> bool {
        self.master_slaves.contains_key(node)
    }

    pub fn masters(&self) -> impl Iterator<Item = &NodeId> {
        self.master_slaves.keys()
    }

    /// The master `node` replicates from, if it is a slave.
    pub fn master_of(&self, node: &NodeId) -> Option<&NodeId> {
        self.slave_masters.get(node)
    }

    /// Slots per master, masters without slots included.
    pub fn node2slot(&self) -> BTreeMap<NodeId, Vec<u16>> {
        let mut map: BTreeMap<NodeId, Vec<u16>> = self
            .masters()
            .map(|m| (m.clone(), Vec::new()))
            .collect();
        for slot in 0..SLOT_COUNT {
            if let Some(owner) = self.slots.owner(slot) {
                map.entry(owner.clone()).or_default().push(slot);
            }
        }
        map
    }

    pub fn pick_node(&self, slot: u16) -> Result<NodeId, ClusterError> {
        self.slots
            .owner(slot)
            .cloned()
            .ok_or(ClusterError::SlotNotAssigned(slot))
    }

    /// One line per node: id, role, and owned slot ranges or master.
    pub fn describe(&self) -> String {
        let node2slot = self.node2slot();
        let mut out = String::new();
        for (master, ms) in &self.master_slaves {
            let slots = node2slot.get(master).map(Vec::as_slice).unwrap_or(&[]);
            let ranges: Vec<String> = SlotRange::compress(slots)
                .iter()
                .map(ToString::to_string)
                .collect();
            out.push_str(&format!(
                "{master} master slots={} {}\n",
                slots.len(),
                ranges.join(",")
            ));
            for slave in &ms.slaves {
                out.push_str(&format!("{slave} slave of={master}\n"));
            }
        }
        out
    }

    /// Applies one entry. On error the state is left untouched.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<Option<TopologyEvent>, String> {
        match entry {
            LogEntry::SeedStart { node } => {
                if !self.nodes.is_empty() {
                    return Err("cluster already seeded".into());
                }
                self.nodes.insert(node.id.clone(), node.clone());
                self.master_slaves.insert(
                    node.id.clone(),
                    MasterSlave {
                        master: node.id.clone(),
                        slaves: Vec::new(),
                    },
                );
                for slot in 0..SLOT_COUNT {
                    self.slots.assign(slot, &node.id);
                }
                Ok(Some(TopologyEvent::NodeJoined {
                    node: node.id.clone(),
                    master: None,
                }))
            }

            LogEntry::Join { node, master } => {
                if self.nodes.contains_key(&node.id) {
                    // rejoin after a retried request
                    return Ok(None);
                }
                match master {
                    Some(m) => {
                        let ms = self
                            .master_slaves
                            .get_mut(m)
                            .ok_or_else(|| format!("master {m} not found"))?;
                        ms.slaves.push(node.id.clone());
                        self.slave_masters.insert(node.id.clone(), m.clone());
                    }
                    None => {
                        self.master_slaves.insert(
                            node.id.clone(),
                            MasterSlave {
                                master: node.id.clone(),
                                slaves: Vec::new(),
                            },
                        );
                    }
                }
                self.nodes.insert(node.id.clone(), node.clone());
                Ok(Some(TopologyEvent::NodeJoined {
                    node: node.id.clone(),
                    master: master.clone(),
                }))
            }

            LogEntry::StartMigrate(task) => {
                self.validate_new_task(task)?;
                self.migratings.insert(task.id.clone(), task.clone());
                Ok(Some(TopologyEvent::MigrationStarted(task.clone())))
            }

            LogEntry::FinishMigrate(task) => {
                let recorded = self
                    .migratings
                    .remove(&task.id)
                    .ok_or_else(|| format!("migration {} not found", task.id))?;
                for &slot in &recorded.slots {
                    self.slots.assign(slot, &recorded.target);
                }
                Ok(Some(TopologyEvent::MigrationFinished(recorded)))
            }

            LogEntry::AbortMigrate { task_id } => {
                let recorded = self
                    .migratings
                    .remove(task_id)
                    .ok_or_else(|| format!("migration {task_id} not found"))?;
                Ok(Some(TopologyEvent::MigrationAborted(recorded)))
            }

            LogEntry::FinishFailover(task) => {
                let old = self
                    .master_slaves
                    .get(&task.old_master)
                    .ok_or_else(|| format!("{} is not a master", task.old_master))?;
                if !old.slaves.contains(&task.new_master) {
                    return Err(format!(
                        "{} is not a slave of {}",
                        task.new_master, task.old_master
                    ));
                }
                let mut slaves: Vec<NodeId> = old
                    .slaves
                    .iter()
                    .filter(|s| **s != task.new_master)
                    .cloned()
                    .collect();
                slaves.push(task.old_master.clone());

                self.master_slaves.remove(&task.old_master);
                self.slave_masters.remove(&task.new_master);
                for slave in &slaves {
                    self.slave_masters
                        .insert(slave.clone(), task.new_master.clone());
                }
                self.master_slaves.insert(
                    task.new_master.clone(),
                    MasterSlave {
                        master: task.new_master.clone(),
                        slaves,
                    },
                );
                self.slots.reassign_all(&task.old_master, &task.new_master);
                Ok(Some(TopologyEvent::FailoverFinished(task.clone())))
            }
        }
    }

    fn validate_new_task(&self, task: &MigratingTask) -> Result<(), String> {
        if task.slots.is_empty() {
            return Err(format!("migration {} has no slots", task.id));
        }
        if self.migratings.contains_key(&task.id) {
            return Err(format!("migration {} already exists", task.id));
        }
        if task.src == task.target {
            return Err("migration source and target are the same node".into());
        }
        if !self.is_master(&task.target) {
            return Err(format!("{} is not a master", task.target));
        }
        let busy: BTreeSet<u16> = self
            .migratings
            .values()
            .flat_map(|t| t.slots.iter().copied())
            .collect();
        for &slot in &task.slots {
            if slot >= SLOT_COUNT {
                return Err(format!("slot {slot} out of range"));
            }
            if self.slots.owner(slot) != Some(&task.src) {
                return Err(format!("slot {slot} is not owned by {}", task.src));
            }
            if busy.contains(&slot) {
                return Err(format!("slot {slot} is already migrating"));
            }
        }
        Ok(())
    }
}

/// The topology state machine as seen by the rest of the node.
#[derive(Debug)]
pub struct Fsm {
    state: RwLock<TopologyState>,
    applied_index: AtomicU64,
    events: broadcast::Sender<TopologyEvent>,
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}

impl Fsm {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(TopologyState::default()),
            applied_index: AtomicU64::new(0),
            events,
        }
    }

    /// Applies the entry at log position `index`.
    pub fn apply(&self, index: u64, entry: &LogEntry) -> ApplyResponse {
        let result = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.apply(entry)
        };
        self.mark_applied(index);
        match result {
            Ok(event) => {
                if let Some(event) = event {
                    info!(index, ?event, "topology changed");
                    // no receivers is fine
                    let _ = self.events.send(event);
                }
                ApplyResponse::Ok
            }
            Err(msg) => {
                debug!(index, error = %msg, "log entry rejected");
                ApplyResponse::Error(msg)
            }
        }
    }

    /// Advances the applied index for entries that carry no topology change.
    pub fn mark_applied(&self, index: u64) {
        self.applied_index.fetch_max(index, Ordering::AcqRel);
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index.load(Ordering::Acquire)
    }

    /// Runs `f` under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&TopologyState) -> R) -> R {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        f(&state)
    }

    pub fn pick_node(&self, slot: u16) -> Result<NodeId, ClusterError> {
        self.read(|s| s.pick_node(slot))
    }

    pub fn get_slaves(&self, master: &NodeId) -> Option<MasterSlave> {
        self.read(|s| s.master_slaves.get(master).cloned())
    }

    pub fn migrating_task(&self, id: &str) -> Option<MigratingTask> {
        self.read(|s| s.migratings.get(id).cloned())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> TopologyState {
        self.read(Clone::clone)
    }

    /// Replaces the state wholesale, as when installing a raft snapshot.
    pub fn restore(&self, state: TopologyState, index: u64) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
        self.applied_index.store(index, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: &str) -> NodeInfo {
        NodeInfo::new(NodeId::from(addr), format!("{addr}0"))
    }

    fn id(addr: &str) -> NodeId {
        NodeId::from(addr)
    }

    fn seeded() -> TopologyState {
        let mut state = TopologyState::default();
        state
            .apply(&LogEntry::SeedStart { node: info("a:1") })
            .unwrap();
        state
            .apply(&LogEntry::Join {
                node: info("b:1"),
                master: None,
            })
            .unwrap();
        state
    }

    fn task(id: &str, src: &str, target: &str, slots: &[u16]) -> MigratingTask {
        MigratingTask {
            id: id.into(),
            src: NodeId::from(src),
            target: NodeId::from(target),
            slots: slots.to_vec(),
        }
    }

    #[test]
    fn node_id_helpers() {
        let node = id("10.0.0.5:6399");
        assert_eq!(node.host_port(), Some(("10.0.0.5", 6399)));
        assert_eq!(node.raft_id(), id("10.0.0.5:6399").raft_id());
        assert_ne!(node.raft_id(), id("10.0.0.6:6399").raft_id());
        assert_eq!(id("nonsense").host_port(), None);
    }

    #[test]
    fn seed_owns_every_slot() {
        let state = seeded();
        assert!(state.slots.is_complete());
        assert_eq!(state.slots.slots_of(&id("a:1")).len(), SLOT_COUNT as usize);
        assert_eq!(state.node2slot().get(&id("b:1")), Some(&Vec::new()));

        let mut again = state.clone();
        assert!(again
            .apply(&LogEntry::SeedStart { node: info("c:1") })
            .is_err());
    }

    #[test]
    fn join_as_slave_requires_master() {
        let mut state = seeded();
        let err = state
            .apply(&LogEntry::Join {
                node: info("c:1"),
                master: Some(id("zz:1")),
            })
            .unwrap_err();
        assert!(err.contains("not found"));

        state
            .apply(&LogEntry::Join {
                node: info("c:1"),
                master: Some(id("b:1")),
            })
            .unwrap();
        assert_eq!(state.master_of(&id("c:1")), Some(&id("b:1")));
        assert!(!state.is_master(&id("c:1")));

        // joining twice changes nothing
        let before = state.clone();
        let event = state
            .apply(&LogEntry::Join {
                node: info("c:1"),
                master: None,
            })
            .unwrap();
        assert!(event.is_none());
        assert_eq!(state, before);
    }

    #[test]
    fn migration_moves_slots_exactly_once() {
        let mut state = seeded();
        let t = task("t1", "a:1", "b:1", &[0, 1, 2]);
        state.apply(&LogEntry::StartMigrate(t.clone())).unwrap();
        assert_eq!(state.pick_node(1).unwrap(), id("a:1"));

        state.apply(&LogEntry::FinishMigrate(t.clone())).unwrap();
        assert_eq!(state.pick_node(1).unwrap(), id("b:1"));
        assert!(state.migratings.is_empty());
        assert!(state.apply(&LogEntry::FinishMigrate(t)).is_err());
    }

    #[test]
    fn start_migrate_validation() {
        let mut state = seeded();
        assert!(state
            .apply(&LogEntry::StartMigrate(task("e", "a:1", "b:1", &[])))
            .is_err());
        assert!(state
            .apply(&LogEntry::StartMigrate(task("w", "b:1", "a:1", &[5])))
            .is_err());
        assert!(state
            .apply(&LogEntry::StartMigrate(task("s", "a:1", "a:1", &[5])))
            .is_err());

        state
            .apply(&LogEntry::StartMigrate(task("t1", "a:1", "b:1", &[5, 6])))
            .unwrap();
        let overlap = state
            .apply(&LogEntry::StartMigrate(task("t2", "a:1", "b:1", &[6, 7])))
            .unwrap_err();
        assert!(overlap.contains("already migrating"));
    }

    #[test]
    fn abort_drops_task_and_keeps_owner() {
        let mut state = seeded();
        let t = task("t1", "a:1", "b:1", &[9]);
        state.apply(&LogEntry::StartMigrate(t.clone())).unwrap();
        let event = state
            .apply(&LogEntry::AbortMigrate {
                task_id: "t1".into(),
            })
            .unwrap();
        assert_eq!(event, Some(TopologyEvent::MigrationAborted(t.clone())));
        assert_eq!(state.pick_node(9).unwrap(), id("a:1"));
        assert!(state.apply(&LogEntry::FinishMigrate(t)).is_err());
    }

    #[test]
    fn failover_reparents_everyone() {
        let mut state = seeded();
        for slave in ["c:1", "d:1"] {
            state
                .apply(&LogEntry::Join {
                    node: info(slave),
                    master: Some(id("a:1")),
                })
                .unwrap();
        }
        state
            .apply(&LogEntry::FinishFailover(FailoverTask {
                id: "f1".into(),
                old_master: id("a:1"),
                new_master: id("c:1"),
            }))
            .unwrap();

        assert!(state.is_master(&id("c:1")));
        assert!(!state.is_master(&id("a:1")));
        assert_eq!(state.master_of(&id("d:1")), Some(&id("c:1")));
        assert_eq!(state.master_of(&id("a:1")), Some(&id("c:1")));
        assert_eq!(state.master_of(&id("c:1")), None);
        assert_eq!(state.pick_node(0).unwrap(), id("c:1"));
        assert_eq!(
            state.master_slaves[&id("c:1")].slaves,
            vec![id("d:1"), id("a:1")]
        );
    }

    #[test]
    fn failover_requires_registered_slave() {
        let mut state = seeded();
        let err = state
            .apply(&LogEntry::FinishFailover(FailoverTask {
                id: "f1".into(),
                old_master: id("a:1"),
                new_master: id("b:1"),
            }))
            .unwrap_err();
        assert!(err.contains("not a slave"));
    }

    #[test]
    fn describe_lists_ranges() {
        let mut state = seeded();
        state
            .apply(&LogEntry::StartMigrate(task("t", "a:1", "b:1", &[0, 1])))
            .unwrap();
        state
            .apply(&LogEntry::FinishMigrate(task("t", "a:1", "b:1", &[0, 1])))
            .unwrap();
        let text = state.describe();
        assert!(text.contains("a:1 master slots=16382 2-16383"));
        assert!(text.contains("b:1 master slots=2 0-1"));
    }

    #[tokio::test]
    async fn fsm_publishes_only_successful_entries() {
        let fsm = Fsm::new();
        let mut events = fsm.subscribe();

        assert_eq!(
            fsm.apply(1, &LogEntry::SeedStart { node: info("a:1") }),
            ApplyResponse::Ok
        );
        assert!(matches!(
            fsm.apply(
                2,
                &LogEntry::AbortMigrate {
                    task_id: "nope".into()
                }
            ),
            ApplyResponse::Error(_)
        ));
        fsm.mark_applied(3);

        assert_eq!(fsm.applied_index(), 3);
        assert!(matches!(
            events.recv().await.unwrap(),
            TopologyEvent::NodeJoined { master: None, .. }
        ));
        assert!(events.try_recv().is_err());
        assert_eq!(fsm.pick_node(100).unwrap(), id("a:1"));
    }

    #[test]
    fn fsm_restore_replaces_state() {
        let fsm = Fsm::new();
        fsm.restore(seeded(), 42);
        assert_eq!(fsm.applied_index(), 42);
        assert!(fsm.get_slaves(&id("b:1")).is_some());
        assert_eq!(fsm.snapshot(), seeded());
    }
}
