//! Slot rebalancing and live slot handoff between masters.
//!
//! The leader plans tasks with [`make_rebalance_plan`] and records each one
//! with `StartMigrate` before any data moves. A task then runs as:
//!
//! 1. leader → target: `cluster.migration.start <task>`
//! 2. target → source: `cluster.migration.export <task>`, answered with a
//!    stream of `cluster.migration.restore <key> <dump>` lines and a final
//!    `OK`. From here on the source records every write to the migrating
//!    slots as a dirty key.
//! 3. target → source: `cluster.migration.done <task>`
//! 4. the source locks the slots, pushes each dirty key to the target, and
//!    sends `cluster.migration.changeroute <task>` to the leader
//! 5. the leader commits `FinishMigrate` and waits until both the source
//!    and the target have applied it
//! 6. the source drops its copy of the slots; the target owns them
//!
//! Until step 5 commits the source stays the owner, so a failure before it
//! can be abandoned with `AbortMigrate`. After a failed route change the
//! source keeps the slots locked until the committed outcome is applied.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tessera_core::Engine;
use tessera_protocol::{cmd_line, CmdLine, Reply};
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::consensus::{Consensus, RaftState};
use crate::error::ClusterError;
use crate::slots::{get_slot, SLOT_COUNT};
use crate::topology::{LogEntry, MigratingTask, NodeId, TopologyState};

/// Plans the tasks that bring every master to within one slot of the
/// average.
///
/// Nothing is planned while some slot is unassigned or while every master
/// is already within `avg ± 1` (`avg = ceil(SLOT_COUNT / masters)`).
/// Otherwise each master gets a quota of `floor` or `ceil` of the even
/// share, masters holding more slots getting the larger quotas, and the
/// surplus of exporters is paired greedily with the deficit of importers.
pub fn make_rebalance_plan(state: &TopologyState) -> Vec<MigratingTask> {
    let masters = state.master_slaves.len();
    if masters == 0 || !state.slots.is_complete() {
        return Vec::new();
    }
    let total = SLOT_COUNT as usize;
    let avg = total.div_ceil(masters);
    let node2slot = state.node2slot();
    if node2slot
        .values()
        .all(|slots| slots.len() + 1 >= avg && slots.len() <= avg + 1)
    {
        return Vec::new();
    }

    let mut by_load: Vec<(&NodeId, &Vec<u16>)> = node2slot.iter().collect();
    by_load.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));
    let (base, extra) = (total / masters, total % masters);

    let mut exporters: Vec<(&NodeId, &[u16])> = Vec::new();
    let mut importers: Vec<(&NodeId, usize)> = Vec::new();
    for (rank, (node, slots)) in by_load.into_iter().enumerate() {
        let quota = base + usize::from(rank < extra);
        if slots.len() > quota {
            exporters.push((node, &slots[..slots.len() - quota]));
        } else if slots.len() < quota {
            importers.push((node, quota - slots.len()));
        }
    }

    let mut tasks = Vec::new();
    let (mut ei, mut ii) = (0, 0);
    while ei < exporters.len() && ii < importers.len() {
        let (src, surplus) = exporters[ei];
        let (target, need) = importers[ii];
        let take = need.min(surplus.len());
        tasks.push(MigratingTask {
            id: uuid::Uuid::new_v4().to_string(),
            src: src.clone(),
            target: target.clone(),
            slots: surplus[..take].to_vec(),
        });
        exporters[ei].1 = &surplus[take..];
        importers[ii].1 -= take;
        if exporters[ei].1.is_empty() {
            ei += 1;
        }
        if importers[ii].1 == 0 {
            ii += 1;
        }
    }
    tasks
}

/// Errors of the per-node migration bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MigrationError {
    #[error("slot {0} is already migrating")]
    SlotAlreadyMigrating(u16),

    #[error("slot {0} is already importing")]
    SlotAlreadyImporting(u16),

    #[error("migration {0} not found")]
    UnknownTask(String),

    #[error("migration {task}: invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        task: String,
        from: MigrationPhase,
        to: MigrationPhase,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationSide {
    Source,
    Target,
}

/// Where one node is in one migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Source: streaming the dump, recording dirty keys.
    Exporting,
    /// Source: writes refused, flushing dirty keys.
    Locked,
    /// Source: waiting for the leader to commit the new route.
    RouteChanging,
    /// Target: applying the dump.
    Importing,
    /// Target: dump applied, accepting the dirty-key flush.
    Draining,
    /// Target: the source confirmed the route change.
    AwaitingRoute,
    Finished,
    Aborted,
}

impl MigrationPhase {
    fn can_advance_to(self, next: MigrationPhase) -> bool {
        use MigrationPhase::*;
        matches!(
            (self, next),
            (Exporting, Locked)
                | (Locked, RouteChanging)
                | (RouteChanging, Finished)
                | (Importing, Draining)
                | (Draining, AwaitingRoute)
                | (AwaitingRoute, Finished)
                | (Exporting | Locked | Importing | Draining, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Finished | MigrationPhase::Aborted)
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Exporting => "exporting",
            Self::Locked => "locked",
            Self::RouteChanging => "route-changing",
            Self::Importing => "importing",
            Self::Draining => "draining",
            Self::AwaitingRoute => "awaiting-route",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct LocalMigration {
    task: MigratingTask,
    side: MigrationSide,
    phase: MigrationPhase,
    /// Keys written while exporting. Filled under the table's read lock.
    dirty: Mutex<HashSet<Bytes>>,
}

/// This node's view of the migrations it takes part in.
///
/// Ordinary writes hold the table's read lock from the slot check until
/// the write is applied and recorded, so taking the write lock to lock a
/// slot waits out every in-flight write.
#[derive(Debug, Default)]
pub struct SlotTable {
    migrations: HashMap<String, LocalMigration>,
    exporting: HashMap<u16, String>,
    importing: HashMap<u16, String>,
    locked: HashSet<u16>,
}

impl SlotTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        task: &MigratingTask,
        side: MigrationSide,
        phase: MigrationPhase,
    ) -> Result<(), MigrationError> {
        if let Some(existing) = self.migrations.get(&task.id) {
            return Err(MigrationError::InvalidStateTransition {
                task: task.id.clone(),
                from: existing.phase,
                to: phase,
            });
        }
        for &slot in &task.slots {
            if self.exporting.contains_key(&slot) {
                return Err(MigrationError::SlotAlreadyMigrating(slot));
            }
            if self.importing.contains_key(&slot) {
                return Err(MigrationError::SlotAlreadyImporting(slot));
            }
        }
        let slots = match side {
            MigrationSide::Source => &mut self.exporting,
            MigrationSide::Target => &mut self.importing,
        };
        for &slot in &task.slots {
            slots.insert(slot, task.id.clone());
        }
        self.migrations.insert(
            task.id.clone(),
            LocalMigration {
                task: task.clone(),
                side,
                phase,
                dirty: Mutex::new(HashSet::new()),
            },
        );
        Ok(())
    }

    /// Starts recording writes to the task's slots.
    pub fn begin_export(&mut self, task: &MigratingTask) -> Result<(), MigrationError> {
        self.insert(task, MigrationSide::Source, MigrationPhase::Exporting)
    }

    /// Starts accepting restores for the task's slots.
    pub fn begin_import(&mut self, task: &MigratingTask) -> Result<(), MigrationError> {
        self.insert(task, MigrationSide::Target, MigrationPhase::Importing)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut LocalMigration, MigrationError> {
        self.migrations
            .get_mut(id)
            .ok_or_else(|| MigrationError::UnknownTask(id.to_string()))
    }

    /// Moves a migration to its next phase.
    pub fn advance(&mut self, id: &str, to: MigrationPhase) -> Result<(), MigrationError> {
        let migration = self.get_mut(id)?;
        if !migration.phase.can_advance_to(to) {
            return Err(MigrationError::InvalidStateTransition {
                task: id.to_string(),
                from: migration.phase,
                to,
            });
        }
        debug!(task = id, from = %migration.phase, %to, "migration phase");
        migration.phase = to;
        if to.is_terminal() {
            self.release(id);
        }
        Ok(())
    }

    /// Locks the exported slots and hands back the keys written since the
    /// export began.
    pub fn lock_export(&mut self, id: &str) -> Result<Vec<Bytes>, MigrationError> {
        self.advance(id, MigrationPhase::Locked)?;
        let migration = self.get_mut(id)?;
        let dirty: Vec<Bytes> = migration
            .dirty
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let slots = migration.task.slots.clone();
        self.locked.extend(slots);
        Ok(dirty)
    }

    /// Validated abort, for a failure noticed locally.
    pub fn abort(&mut self, id: &str) -> Result<(), MigrationError> {
        self.advance(id, MigrationPhase::Aborted)
    }

    /// Ends a migration regardless of its phase, as when the committed
    /// outcome is applied. Returns the task and this node's side if the
    /// migration was still running here.
    pub fn settle(
        &mut self,
        id: &str,
        outcome: MigrationPhase,
    ) -> Option<(MigratingTask, MigrationSide)> {
        let migration = self.migrations.get_mut(id)?;
        if migration.phase.is_terminal() {
            return None;
        }
        migration.phase = outcome;
        let settled = (migration.task.clone(), migration.side);
        self.release(id);
        Some(settled)
    }

    fn release(&mut self, id: &str) {
        let Some(migration) = self.migrations.get(id) else {
            return;
        };
        for slot in &migration.task.slots {
            if self.exporting.get(slot).map(String::as_str) == Some(id) {
                self.exporting.remove(slot);
                self.locked.remove(slot);
            }
            if self.importing.get(slot).map(String::as_str) == Some(id) {
                self.importing.remove(slot);
            }
        }
    }

    pub fn phase(&self, id: &str) -> Option<MigrationPhase> {
        self.migrations.get(id).map(|m| m.phase)
    }

    pub fn task(&self, id: &str) -> Option<(&MigratingTask, MigrationSide)> {
        self.migrations.get(id).map(|m| (&m.task, m.side))
    }

    /// True while restores for `slot` are accepted.
    pub fn is_importing(&self, slot: u16) -> bool {
        self.importing
            .get(&slot)
            .and_then(|id| self.migrations.get(id))
            .is_some_and(|m| {
                matches!(m.phase, MigrationPhase::Importing | MigrationPhase::Draining)
            })
    }

    /// Refuses writes to locked slots.
    pub fn check_write(&self, keys: &[Bytes]) -> Result<(), Reply> {
        for key in keys {
            let slot = get_slot(key);
            if self.locked.contains(&slot) {
                return Err(Reply::err(format!(
                    "slot {slot} is migrating, try again later"
                )));
            }
        }
        Ok(())
    }

    /// Refuses writes without keys, such as FLUSHALL, while any migration
    /// is running here.
    pub fn check_keyless_write(&self) -> Result<(), Reply> {
        if self.active() > 0 {
            return Err(Reply::err("slot migration in progress, try again later"));
        }
        Ok(())
    }

    /// Records keys of exporting slots as dirty.
    pub fn record_dirty(&self, keys: &[Bytes]) {
        for key in keys {
            let Some(id) = self.exporting.get(&get_slot(key)) else {
                continue;
            };
            if let Some(m) = self.migrations.get(id) {
                if m.phase == MigrationPhase::Exporting {
                    m.dirty
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(key.clone());
                }
            }
        }
    }

    /// Migrations not yet finished or aborted.
    pub fn active(&self) -> usize {
        self.migrations
            .values()
            .filter(|m| !m.phase.is_terminal())
            .count()
    }
}

/// Lazily dumps a key snapshot as restore command lines. Keys deleted
/// since the snapshot are skipped; their deletion is a dirty write.
pub struct ExportCursor {
    engine: Arc<Engine>,
    keys: std::vec::IntoIter<Bytes>,
}

impl ExportCursor {
    fn new(engine: Arc<Engine>, keys: Vec<Bytes>) -> Self {
        Self {
            engine,
            keys: keys.into_iter(),
        }
    }
}

impl Iterator for ExportCursor {
    type Item = CmdLine;

    fn next(&mut self) -> Option<CmdLine> {
        for key in self.keys.by_ref() {
            if let Some(dump) = self.engine.dump_key(&key) {
                return Some(vec![
                    Bytes::from_static(b"cluster.migration.restore"),
                    key,
                    dump,
                ]);
            }
        }
        None
    }
}

fn reply_err(reply: Reply) -> Result<Reply, ClusterError> {
    match reply.error_message() {
        Some(msg) => Err(ClusterError::Remote(msg.to_string())),
        None => Ok(reply),
    }
}

impl<C: Consensus> Cluster<C> {
    /// One leader rebalance pass. Returns how many tasks were started.
    pub async fn rebalance(self: &Arc<Self>) -> Result<usize, ClusterError> {
        let Ok(guard) = self.rebalance_lock.try_lock() else {
            return Ok(0);
        };
        if self.consensus.state() != RaftState::Leader {
            return Ok(0);
        }
        let state = self.fsm().snapshot();
        if !state.migratings.is_empty() {
            return Ok(0);
        }
        let plan = make_rebalance_plan(&state);
        if plan.is_empty() {
            return Ok(0);
        }
        info!(tasks = plan.len(), "rebalancing slots");

        let mut proposed = Vec::with_capacity(plan.len());
        for task in plan {
            match self
                .consensus
                .propose(LogEntry::StartMigrate(task.clone()))
                .await
            {
                Ok(index) => proposed.push((task, index)),
                Err(e) => warn!(task = %task.id, "propose start migrate: {e}"),
            }
        }
        drop(guard);

        let started = proposed.len();
        for (task, index) in proposed {
            if let Err(e) = self.notify_target(&task, index).await {
                warn!(task = %task.id, target = %task.target, "migration start failed: {e}");
                self.propose_abort(&task.id).await;
            }
        }
        Ok(started)
    }

    /// Moves `slots` to `target` outside a rebalance pass. Leader only; all
    /// slots must belong to one source.
    pub async fn migrate_slots(
        self: &Arc<Self>,
        target: NodeId,
        slots: Vec<u16>,
    ) -> Result<MigratingTask, ClusterError> {
        if self.consensus.state() != RaftState::Leader {
            return Err(ClusterError::NoLeader);
        }
        let first = *slots
            .first()
            .ok_or_else(|| ClusterError::Rejected("no slots to migrate".into()))?;
        let src = self.pick_node(first)?;
        let task = MigratingTask {
            id: uuid::Uuid::new_v4().to_string(),
            src,
            target,
            slots,
        };
        let index = self
            .consensus
            .propose(LogEntry::StartMigrate(task.clone()))
            .await?;
        if let Err(e) = self.notify_target(&task, index).await {
            self.propose_abort(&task.id).await;
            return Err(e);
        }
        Ok(task)
    }

    async fn notify_target(
        self: &Arc<Self>,
        task: &MigratingTask,
        index: u64,
    ) -> Result<(), ClusterError> {
        self.wait_committed(&task.target, index).await?;
        let reply = self
            .relay(&task.target, &cmd_line(&["cluster.migration.start", &task.id]))
            .await;
        reply_err(reply).map(drop)
    }

    async fn propose_abort(&self, task_id: &str) {
        let entry = LogEntry::AbortMigrate {
            task_id: task_id.to_string(),
        };
        if let Err(e) = self.consensus.propose(entry).await {
            warn!(task = task_id, "propose abort: {e}");
        }
    }

    /// Asks the leader to abandon a task.
    async fn request_abort(self: &Arc<Self>, task_id: &str) {
        let reply = self
            .relay_leader(&cmd_line(&["cluster.migration.abort", task_id]))
            .await;
        if reply.is_error() {
            warn!(task = task_id, error = %reply, "abort request failed");
        }
    }

    /// Polls `node` until it has applied log position `index`.
    pub async fn wait_committed(
        self: &Arc<Self>,
        node: &NodeId,
        index: u64,
    ) -> Result<(), ClusterError> {
        let query = cmd_line(&["cluster.committedindex"]);
        for _ in 0..self.config.commit_poll_attempts {
            match self.relay(node, &query).await {
                Reply::Integer(applied) if applied >= 0 && applied as u64 >= index => {
                    return Ok(());
                }
                Reply::Integer(_) => {}
                reply => debug!(%node, "committed index query: {reply}"),
            }
            tokio::time::sleep(self.config.commit_poll_interval).await;
        }
        Err(ClusterError::Timeout(format!(
            "waiting for {node} to apply log index {index}"
        )))
    }

    async fn await_task(&self, id: &str) -> Result<MigratingTask, ClusterError> {
        for _ in 0..self.config.commit_poll_attempts {
            if let Some(task) = self.fsm().migrating_task(id) {
                return Ok(task);
            }
            tokio::time::sleep(self.config.commit_poll_interval).await;
        }
        Err(ClusterError::Migration(MigrationError::UnknownTask(
            id.to_string(),
        )))
    }

    // -- target side --

    /// `cluster.migration.start <task>`: begins importing in the background.
    pub(crate) fn exec_migration_start(self: &Arc<Self>, id: &str) -> Reply {
        let Some(task) = self.fsm().migrating_task(id) else {
            return Reply::err("task not found");
        };
        if task.target != *self.self_id() {
            return Reply::err(format!("{} is not the target of {id}", self.self_id()));
        }
        if let Err(e) = self.slots_mut().begin_import(&task) {
            return ClusterError::from(e).into();
        }
        info!(task = id, src = %task.src, slots = task.slots.len(), "importing slots");

        let cluster = Arc::clone(self);
        tokio::spawn(async move { cluster.do_import(task).await });
        Reply::ok()
    }

    async fn do_import(self: Arc<Self>, task: MigratingTask) {
        if let Err(e) = self.import_dump(&task).await {
            warn!(task = %task.id, "import failed: {e}");
            {
                let mut table = self.slots_mut();
                if table.abort(&task.id).is_ok() {
                    self.drop_slots(&task);
                }
            }
            self.request_abort(&task.id).await;
            return;
        }
        if let Err(e) = self.finish_handshake(&task).await {
            // the route may have changed anyway; the committed outcome decides
            warn!(task = %task.id, "migration handshake failed: {e}");
            self.request_abort(&task.id).await;
        }
    }

    async fn import_dump(self: &Arc<Self>, task: &MigratingTask) -> Result<(), ClusterError> {
        let export = cmd_line(&["cluster.migration.export", &task.id]);
        let mut stream = self
            .connections
            .new_stream(task.src.as_str(), &export)
            .await?;
        let mut restored = 0usize;
        while let Some(item) = stream.recv().await {
            match item? {
                Reply::Array(parts) => {
                    let cmd = Reply::Array(parts).into_cmd_line().ok_or_else(|| {
                        ClusterError::peer(task.src.as_str(), "malformed export line")
                    })?;
                    reply_err(self.exec_migration_restore(&cmd))?;
                    restored += 1;
                }
                reply if reply.is_ok() => {
                    self.slots_mut()
                        .advance(&task.id, MigrationPhase::Draining)?;
                    info!(task = %task.id, keys = restored, "dump imported");
                    return Ok(());
                }
                reply => {
                    reply_err(reply)?;
                    break;
                }
            }
        }
        Err(ClusterError::peer(
            task.src.as_str(),
            "export ended without completion",
        ))
    }

    async fn finish_handshake(self: &Arc<Self>, task: &MigratingTask) -> Result<(), ClusterError> {
        let reply = self
            .relay(&task.src, &cmd_line(&["cluster.migration.done", &task.id]))
            .await;
        reply_err(reply)?;
        {
            let mut table = self.slots_mut();
            if table.phase(&task.id) == Some(MigrationPhase::Draining) {
                table.advance(&task.id, MigrationPhase::AwaitingRoute)?;
            }
        }
        self.finish_import(&task.id);
        Ok(())
    }

    /// `cluster.migration.restore <key> <dump>`: only for importing slots.
    pub(crate) fn exec_migration_restore(&self, cmd: &[Bytes]) -> Reply {
        let [_, key, dump] = cmd else {
            return Reply::err("wrong number of arguments for 'cluster.migration.restore' command");
        };
        let table = self.slots();
        let slot = get_slot(key);
        if !table.is_importing(slot) {
            return Reply::err(format!("slot {slot} is not importing"));
        }
        self.engine
            .exec(&[Bytes::from_static(b"RESTOREKEY"), key.clone(), dump.clone()])
    }

    /// `cluster.migration.forget <key>`: a dirty key deleted at the source.
    pub(crate) fn exec_migration_forget(&self, cmd: &[Bytes]) -> Reply {
        let [_, key] = cmd else {
            return Reply::err("wrong number of arguments for 'cluster.migration.forget' command");
        };
        let table = self.slots();
        let slot = get_slot(key);
        if !table.is_importing(slot) {
            return Reply::err(format!("slot {slot} is not importing"));
        }
        self.engine
            .exec(&[Bytes::from_static(b"DEL"), key.clone()])
    }

    fn finish_import(&self, id: &str) {
        if self
            .slots_mut()
            .settle(id, MigrationPhase::Finished)
            .is_some()
        {
            info!(task = id, "import finished");
        }
    }

    /// Deletes local keys of the task's slots.
    fn drop_slots(&self, task: &MigratingTask) -> usize {
        let slots = task.slot_set();
        self.engine
            .remove_keys_where(|key| slots.contains(&get_slot(key)))
    }

    // -- source side --

    /// `cluster.migration.export <task>`: starts recording dirty keys and
    /// returns the dump of the task's slots.
    pub async fn begin_export(self: &Arc<Self>, id: &str) -> Result<ExportCursor, ClusterError> {
        let task = self.await_task(id).await?;
        if task.src != *self.self_id() {
            return Err(ClusterError::Rejected(format!(
                "{} is not the source of {id}",
                self.self_id()
            )));
        }
        let slots = task.slot_set();
        let keys = {
            let mut table = self.slots_mut();
            table.begin_export(&task)?;
            self.engine.keys()
        };
        let keys: Vec<Bytes> = keys
            .into_iter()
            .filter(|key| slots.contains(&get_slot(key)))
            .collect();
        info!(task = id, target = %task.target, keys = keys.len(), "exporting slots");
        Ok(ExportCursor::new(Arc::clone(&self.engine), keys))
    }

    /// `cluster.migration.done <task>`: locks the slots, flushes dirty keys
    /// and asks the leader to move the route.
    pub(crate) async fn exec_migration_done(self: &Arc<Self>, id: &str) -> Reply {
        let target = match self.slots().task(id) {
            Some((task, MigrationSide::Source)) => task.target.clone(),
            _ => return Reply::err(format!("migration {id} is not exporting here")),
        };
        let dirty = match self.slots_mut().lock_export(id) {
            Ok(dirty) => dirty,
            Err(e) => return ClusterError::from(e).into(),
        };
        info!(task = id, dirty = dirty.len(), "slots locked, flushing dirty keys");

        if let Err(e) = self.flush_dirty(&target, dirty).await {
            warn!(task = id, "dirty key flush failed: {e}");
            if let Err(e) = self.slots_mut().abort(id) {
                debug!(task = id, "local abort: {e}");
            }
            self.request_abort(id).await;
            return e.into();
        }

        if let Err(e) = self.slots_mut().advance(id, MigrationPhase::RouteChanging) {
            return ClusterError::from(e).into();
        }
        let reply = self
            .relay_leader(&cmd_line(&["cluster.migration.changeroute", id]))
            .await;
        if reply.is_error() {
            error!(
                task = id,
                error = %reply,
                "route change failed, slots stay locked until the outcome is applied"
            );
            return reply;
        }
        self.finish_export(id);
        Reply::ok()
    }

    async fn flush_dirty(self: &Arc<Self>, target: &NodeId, dirty: Vec<Bytes>) -> Result<(), ClusterError> {
        for key in dirty {
            let cmd = match self.engine.dump_key(&key) {
                Some(dump) => vec![
                    Bytes::from_static(b"cluster.migration.restore"),
                    key,
                    dump,
                ],
                None => vec![Bytes::from_static(b"cluster.migration.forget"), key],
            };
            reply_err(self.relay(target, &cmd).await)?;
        }
        Ok(())
    }

    /// Unlocks the migrated slots and deletes what is left of them here.
    fn finish_export(&self, id: &str) {
        let mut table = self.slots_mut();
        if let Some((task, MigrationSide::Source)) = table.settle(id, MigrationPhase::Finished) {
            let removed = self.drop_slots(&task);
            info!(task = id, removed, "export finished");
        }
    }

    // -- leader side --

    /// `cluster.migration.changeroute <task>`
    pub(crate) async fn exec_migration_changeroute(self: &Arc<Self>, id: &str) -> Reply {
        let Some(task) = self.fsm().migrating_task(id) else {
            return Reply::err("task not found");
        };
        let index = match self
            .consensus
            .propose(LogEntry::FinishMigrate(task.clone()))
            .await
        {
            Ok(index) => index,
            Err(e) => return e.into(),
        };
        for node in [&task.src, &task.target] {
            if let Err(e) = self.wait_committed(node, index).await {
                error!(task = id, %node, "route change not confirmed: {e}");
                return e.into();
            }
        }
        info!(task = id, slots = task.slots.len(), target = %task.target, "route changed");
        Reply::ok()
    }

    /// `cluster.migration.abort <task>`
    pub(crate) async fn exec_migration_abort(&self, id: &str) -> Reply {
        let entry = LogEntry::AbortMigrate {
            task_id: id.to_string(),
        };
        match self.consensus.propose(entry).await {
            Ok(_) => Reply::ok(),
            Err(e) => e.into(),
        }
    }

    // -- committed outcomes --

    pub(crate) fn on_migration_finished(&self, task: &MigratingTask) {
        if task.src == *self.self_id() {
            self.finish_export(&task.id);
        } else if task.target == *self.self_id() {
            self.finish_import(&task.id);
        }
    }

    pub(crate) fn on_migration_aborted(&self, task: &MigratingTask) {
        let mut table = self.slots_mut();
        match table.settle(&task.id, MigrationPhase::Aborted) {
            Some((task, MigrationSide::Target)) => {
                let removed = self.drop_slots(&task);
                warn!(task = %task.id, removed, "import aborted");
            }
            Some((task, MigrationSide::Source)) => {
                warn!(task = %task.id, "export aborted");
            }
            None => {}
        }
    }
}
