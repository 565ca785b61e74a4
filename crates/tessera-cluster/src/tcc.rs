//! Prepare/commit/rollback for operations spanning several nodes.
//!
//! Coordinator side: [`Cluster::do_tcc`] sends `prepare` to every node in
//! the route map, then `commit`, and broadcasts `rollback` to the whole
//! route map on any failure. Participant side: [`TransactionTable`] stages
//! prepared operations, locks their keys against ordinary writes, and keeps
//! undo command lines so a committed transaction can still be reverted.
//!
//! If the coordinator dies between two commit sends, participants can end
//! up partially committed. There is no durable coordinator log.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::distr::Alphanumeric;
use rand::Rng;
use tessera_core::Engine;
use tessera_protocol::{cmd_line, CmdLine, Reply};
use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::consensus::Consensus;
use crate::error::ClusterError;
use crate::topology::NodeId;

/// Error returned by `RenameNxTo` when the destination exists. The rename
/// coordinator turns it into a `0` reply.
pub const KEY_EXISTS: &str = "ERR key exists";

const TX_ID_LEN: usize = 20;

/// Keys per participating node.
pub type RouteMap = BTreeMap<NodeId, Vec<Bytes>>;

/// Fresh random transaction id.
pub fn gen_tx_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(TX_ID_LEN)
        .map(char::from)
        .collect()
}

/// A prepared operation, not yet visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Staged {
    /// Sent back to the coordinator as the prepare reply.
    pub reply: Reply,
    /// Keys locked until commit or rollback.
    pub keys: Vec<Bytes>,
    /// Executed in order on commit.
    pub commit: Vec<CmdLine>,
    /// Restores the pre-commit state of `keys`.
    pub undo: Vec<CmdLine>,
}

/// Validates a prepare request against the local store and stages it.
pub type PrepareFn = fn(&Engine, &[Bytes]) -> Result<Staged, Reply>;

/// Prepare operations by lowercase name.
#[derive(Debug, Clone, Default)]
pub struct PrepareRegistry {
    ops: HashMap<&'static str, PrepareFn>,
}

impl PrepareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The operations used by rename, MSET and DEL.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("renamefrom", prepare_rename_from);
        registry.register("renameto", prepare_rename_to);
        registry.register("renamenxto", prepare_rename_nx_to);
        registry.register("mset", prepare_mset);
        registry.register("del", prepare_del);
        registry
    }

    pub fn register(&mut self, name: &'static str, f: PrepareFn) {
        self.ops.insert(name, f);
    }

    pub fn lookup(&self, name: &str) -> Result<PrepareFn, Reply> {
        self.ops
            .get(name.to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| Reply::err("unknown prepare operation"))
    }
}

/// Command lines that put `key` back the way it is now.
fn undo_for(engine: &Engine, key: &Bytes) -> CmdLine {
    match engine.dump_key(key) {
        Some(dump) => vec![Bytes::from_static(b"RESTOREKEY"), key.clone(), dump],
        None => vec![Bytes::from_static(b"DEL"), key.clone()],
    }
}

fn arity(op: &str) -> Reply {
    Reply::err(format!("wrong number of arguments for prepare '{op}'"))
}

/// `RenameFrom key`: the key must exist; replies with its dump.
fn prepare_rename_from(engine: &Engine, args: &[Bytes]) -> Result<Staged, Reply> {
    let [key] = args else {
        return Err(arity("renamefrom"));
    };
    let dump = engine.dump_key(key).ok_or_else(|| Reply::err("no such key"))?;
    Ok(Staged {
        reply: Reply::Bulk(dump.clone()),
        keys: vec![key.clone()],
        commit: vec![vec![Bytes::from_static(b"DEL"), key.clone()]],
        undo: vec![vec![Bytes::from_static(b"RESTOREKEY"), key.clone(), dump]],
    })
}

fn stage_restore(engine: &Engine, key: &Bytes, dump: &Bytes) -> Result<Staged, Reply> {
    engine.validate_dump(dump).map_err(Reply::from)?;
    Ok(Staged {
        reply: Reply::ok(),
        keys: vec![key.clone()],
        commit: vec![vec![
            Bytes::from_static(b"RESTOREKEY"),
            key.clone(),
            dump.clone(),
        ]],
        undo: vec![undo_for(engine, key)],
    })
}

/// `RenameTo key dump`: overwrites the destination on commit.
fn prepare_rename_to(engine: &Engine, args: &[Bytes]) -> Result<Staged, Reply> {
    let [key, dump] = args else {
        return Err(arity("renameto"));
    };
    stage_restore(engine, key, dump)
}

/// `RenameNxTo key dump`: fails with [`KEY_EXISTS`] if the destination exists.
fn prepare_rename_nx_to(engine: &Engine, args: &[Bytes]) -> Result<Staged, Reply> {
    let [key, dump] = args else {
        return Err(arity("renamenxto"));
    };
    if engine.exists(key) {
        return Err(Reply::Error(KEY_EXISTS.into()));
    }
    stage_restore(engine, key, dump)
}

/// `MSet k v [k v ...]`
fn prepare_mset(engine: &Engine, args: &[Bytes]) -> Result<Staged, Reply> {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(arity("mset"));
    }
    let keys: Vec<Bytes> = args.iter().step_by(2).cloned().collect();
    let mut commit = cmd_line(&["MSET"]);
    commit.extend_from_slice(args);
    Ok(Staged {
        reply: Reply::ok(),
        undo: keys.iter().map(|k| undo_for(engine, k)).collect(),
        keys,
        commit: vec![commit],
    })
}

/// `Del k [k ...]`: replies with how many of the keys exist.
fn prepare_del(engine: &Engine, args: &[Bytes]) -> Result<Staged, Reply> {
    if args.is_empty() {
        return Err(arity("del"));
    }
    let existing: Vec<&Bytes> = args.iter().filter(|k| engine.exists(k)).collect();
    let mut commit = cmd_line(&["DEL"]);
    commit.extend_from_slice(args);
    Ok(Staged {
        reply: Reply::Integer(existing.len() as i64),
        keys: args.to_vec(),
        commit: vec![commit],
        undo: existing.into_iter().map(|k| undo_for(engine, k)).collect(),
    })
}

/// Hooks the transaction table calls before and after touching the store.
/// The migration layer uses them to refuse locked slots and to record
/// dirty keys.
pub trait WriteGuard {
    fn check(&self, keys: &[Bytes]) -> Result<(), Reply>;
    fn wrote(&self, keys: &[Bytes]);
}

impl WriteGuard for () {
    fn check(&self, _keys: &[Bytes]) -> Result<(), Reply> {
        Ok(())
    }

    fn wrote(&self, _keys: &[Bytes]) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Debug)]
struct TxRecord {
    staged: Staged,
    status: TxStatus,
    commit_reply: Option<Reply>,
    touched_at: Instant,
}

#[derive(Debug, Default)]
struct TableInner {
    txs: HashMap<String, TxRecord>,
    /// Locked key to owning transaction.
    locked: HashMap<Bytes, String>,
}

impl TableInner {
    fn unlock(&mut self, tx_id: &str, keys: &[Bytes]) {
        for key in keys {
            if self.locked.get(key).map(String::as_str) == Some(tx_id) {
                self.locked.remove(key);
            }
        }
    }

    fn forget(&mut self, id: &str) {
        if let Some(tx) = self.txs.remove(id) {
            if tx.status == TxStatus::Prepared {
                warn!(tx = id, "dropping abandoned prepared transaction");
            }
            self.unlock(id, &tx.staged.keys);
        }
    }

    /// Forgets finished transactions and releases abandoned prepares.
    fn purge(&mut self, retention: Duration) {
        let expired: Vec<String> = self
            .txs
            .iter()
            .filter(|(_, tx)| tx.touched_at.elapsed() > retention)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            self.forget(&id);
        }
    }

    /// Releases the prepares holding any of `keys` that outlived
    /// `retention`.
    fn expire_holders(&mut self, keys: &[Bytes], retention: Duration) {
        let stale: Vec<String> = keys
            .iter()
            .filter_map(|key| self.locked.get(key))
            .filter(|id| {
                self.txs
                    .get(id.as_str())
                    .is_some_and(|tx| tx.touched_at.elapsed() > retention)
            })
            .cloned()
            .collect();
        for id in stale {
            self.forget(&id);
        }
    }
}

/// Participant-side transaction state.
#[derive(Debug)]
pub struct TransactionTable {
    inner: Mutex<TableInner>,
    registry: PrepareRegistry,
    retention: Duration,
}

impl TransactionTable {
    pub fn new(registry: PrepareRegistry, retention: Duration) -> Self {
        Self {
            inner: Mutex::new(TableInner::default()),
            registry,
            retention,
        }
    }

    fn inner(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the prepare function for `op` and stages the result.
    pub fn prepare(
        &self,
        engine: &Engine,
        guard: &impl WriteGuard,
        tx_id: &str,
        op: &str,
        args: &[Bytes],
    ) -> Reply {
        let mut inner = self.inner();
        inner.purge(self.retention);
        if inner.txs.contains_key(tx_id) {
            return Reply::err(format!("transaction {tx_id} already exists"));
        }
        let prepare = match self.registry.lookup(op) {
            Ok(f) => f,
            Err(reply) => return reply,
        };
        let staged = match prepare(engine, args) {
            Ok(staged) => staged,
            Err(reply) => return reply,
        };
        if let Err(reply) = guard.check(&staged.keys) {
            return reply;
        }
        if staged.keys.iter().any(|k| inner.locked.contains_key(k)) {
            return Reply::err("key is locked by another transaction");
        }

        for key in &staged.keys {
            inner.locked.insert(key.clone(), tx_id.to_string());
        }
        let reply = staged.reply.clone();
        debug!(tx = tx_id, op, keys = staged.keys.len(), "prepared");
        inner.txs.insert(
            tx_id.to_string(),
            TxRecord {
                staged,
                status: TxStatus::Prepared,
                commit_reply: None,
                touched_at: Instant::now(),
            },
        );
        reply
    }

    /// Applies a prepared transaction. Committing twice returns the first
    /// commit's reply.
    pub fn commit(&self, engine: &Engine, guard: &impl WriteGuard, tx_id: &str) -> Reply {
        let mut inner = self.inner();
        inner.purge(self.retention);
        let Some(tx) = inner.txs.get_mut(tx_id) else {
            return Reply::err("transaction not found");
        };
        match tx.status {
            TxStatus::Committed => {
                return tx.commit_reply.clone().unwrap_or_else(Reply::ok);
            }
            TxStatus::RolledBack => return Reply::err("transaction already rolled back"),
            TxStatus::Prepared => {}
        }
        if let Err(reply) = guard.check(&tx.staged.keys) {
            return reply;
        }

        // a failed batch may have applied a prefix; rollback's undo covers it
        let reply = engine.exec_batch(&tx.staged.commit);
        guard.wrote(&tx.staged.keys);
        tx.status = TxStatus::Committed;
        tx.commit_reply = Some(reply.clone());
        tx.touched_at = Instant::now();
        let keys = tx.staged.keys.clone();
        inner.unlock(tx_id, &keys);
        debug!(tx = tx_id, "committed");
        reply
    }

    /// Reverts a transaction. Unknown ids are a no-op, a prepared
    /// transaction is dropped, and a committed one has its undo applied.
    pub fn rollback(&self, engine: &Engine, guard: &impl WriteGuard, tx_id: &str) -> Reply {
        let mut inner = self.inner();
        inner.purge(self.retention);
        let Some(tx) = inner.txs.get_mut(tx_id) else {
            return Reply::ok();
        };
        let previous = tx.status;
        tx.status = TxStatus::RolledBack;
        tx.touched_at = Instant::now();
        match previous {
            TxStatus::RolledBack => return Reply::ok(),
            TxStatus::Prepared => {}
            TxStatus::Committed => {
                let undo = engine.exec_batch(&tx.staged.undo);
                guard.wrote(&tx.staged.keys);
                if undo.is_error() {
                    warn!(tx = tx_id, error = %undo, "undo after commit failed");
                }
            }
        }
        let keys = tx.staged.keys.clone();
        inner.unlock(tx_id, &keys);
        debug!(tx = tx_id, ?previous, "rolled back");
        Reply::ok()
    }

    /// Runs an ordinary write unless one of its keys is held by a
    /// prepared transaction. Holders past the retention are dropped first.
    pub fn guard_write(&self, keys: &[Bytes], write: impl FnOnce() -> Reply) -> Reply {
        let mut inner = self.inner();
        inner.expire_holders(keys, self.retention);
        if keys.iter().any(|k| inner.locked.contains_key(k)) {
            return Reply::err("key is locked by a pending transaction");
        }
        write()
    }

    /// Drops records older than the retention and releases their locks.
    pub fn purge(&self) {
        self.inner().purge(self.retention);
    }

    pub fn status(&self, tx_id: &str) -> Option<TxStatus> {
        self.inner().txs.get(tx_id).map(|tx| tx.status)
    }

    /// Number of transactions still holding locks.
    pub fn pending(&self) -> usize {
        self.inner()
            .txs
            .values()
            .filter(|tx| tx.status == TxStatus::Prepared)
            .count()
    }
}

/// One distributed operation: per-node prepare arguments (`op args...`).
#[derive(Debug, Clone)]
pub struct TccTx {
    pub id: String,
    pub route_map: RouteMap,
    pub cmd_lines: BTreeMap<NodeId, CmdLine>,
}

impl TccTx {
    pub fn new(route_map: RouteMap, cmd_lines: BTreeMap<NodeId, CmdLine>) -> Self {
        Self {
            id: gen_tx_id(),
            route_map,
            cmd_lines,
        }
    }
}

/// Drops the `ERR ` class prefix so nested messages read cleanly.
pub(crate) fn strip_err(reply: &Reply) -> String {
    let msg = reply.error_message().unwrap_or_default();
    msg.strip_prefix("ERR ").unwrap_or(msg).to_string()
}

impl<C: Consensus> Cluster<C> {
    /// Groups keys by the node owning their slot.
    pub fn group_by_node(&self, keys: &[Bytes]) -> Result<RouteMap, ClusterError> {
        let mut route_map = RouteMap::new();
        for key in keys {
            let node = self.pick_node(self.get_slot(key))?;
            route_map.entry(node).or_default().push(key.clone());
        }
        Ok(route_map)
    }

    pub(crate) async fn request_prepare(
        self: &Arc<Self>,
        node: &NodeId,
        tx_id: &str,
        args: &[Bytes],
    ) -> Reply {
        let mut cmd = cmd_line(&["prepare", tx_id]);
        cmd.extend_from_slice(args);
        self.relay(node, &cmd).await
    }

    pub(crate) async fn request_commit(self: &Arc<Self>, node: &NodeId, tx_id: &str) -> Reply {
        self.relay(node, &cmd_line(&["commit", tx_id])).await
    }

    /// Sends rollback to every node in the route map, prepared or not.
    pub(crate) async fn request_rollback(self: &Arc<Self>, tx_id: &str, route_map: &RouteMap) {
        for node in route_map.keys() {
            let reply = self.relay(node, &cmd_line(&["rollback", tx_id])).await;
            if reply.is_error() {
                warn!(tx = tx_id, %node, error = %reply, "rollback failed");
            }
        }
    }

    /// Prepares on every node, then commits everywhere. Returns the commit
    /// replies in node order, or a single error reply after rolling back.
    pub async fn do_tcc(self: &Arc<Self>, tx: &TccTx) -> Result<Vec<Reply>, Reply> {
        for (node, args) in &tx.cmd_lines {
            let reply = self.request_prepare(node, &tx.id, args).await;
            if reply.is_error() {
                debug!(tx = %tx.id, %node, error = %reply, "prepare failed");
                self.request_rollback(&tx.id, &tx.route_map).await;
                return Err(Reply::err(format!("prepare failed: {}", strip_err(&reply))));
            }
        }

        let mut replies = Vec::with_capacity(tx.cmd_lines.len());
        for node in tx.cmd_lines.keys() {
            let reply = self.request_commit(node, &tx.id).await;
            if reply.is_error() {
                warn!(tx = %tx.id, %node, error = %reply, "commit failed");
                self.request_rollback(&tx.id, &tx.route_map).await;
                return Err(Reply::err(format!("commit failed: {}", strip_err(&reply))));
            }
            replies.push(reply);
        }
        Ok(replies)
    }
}
