//! Command execution against the local keyspace.
//!
//! [`Engine`] is shared between connection tasks behind an `Arc`. Each
//! command runs with the keyspace lock held, so a single command is atomic
//! with respect to every other local command.

use std::sync::{Mutex, MutexGuard, RwLock};

use bytes::Bytes;
use tessera_protocol::{CmdLine, Reply};
use tracing::info;

use crate::command::lookup_command;
use crate::error::EngineError;
use crate::keyspace::{self, Keyspace, TtlResult};

/// Replication role of this node's store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Master,
    /// Follows the master at `host:port` and refuses client writes.
    Replica { host: String, port: u16 },
}

#[derive(Debug)]
pub struct Engine {
    keyspace: Mutex<Keyspace>,
    role: RwLock<Role>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::new()),
            role: RwLock::new(Role::Master),
        }
    }

    fn keyspace(&self) -> MutexGuard<'_, Keyspace> {
        self.keyspace.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn role(&self) -> Role {
        self.role.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_role(&self, role: Role) {
        *self.role.write().unwrap_or_else(|e| e.into_inner()) = role;
    }

    /// Executes one command and returns its reply. Errors are folded into
    /// error replies; this never panics on malformed input.
    pub fn exec(&self, cmd: &[Bytes]) -> Reply {
        match self.try_exec(cmd) {
            Ok(reply) => reply,
            Err(e) => e.into(),
        }
    }

    fn try_exec(&self, cmd: &[Bytes]) -> Result<Reply, EngineError> {
        let name = cmd
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_lowercase())
            .ok_or_else(|| EngineError::UnknownCommand(String::new()))?;
        let spec = lookup_command(&name).ok_or_else(|| EngineError::UnknownCommand(name.clone()))?;
        if !spec.arity_ok(cmd.len()) {
            return Err(EngineError::WrongArity(name));
        }
        if spec.write && matches!(self.role(), Role::Replica { .. }) {
            return Err(EngineError::ReadOnly);
        }

        let args = &cmd[1..];
        match spec.name {
            "ping" => Ok(match args.first() {
                Some(msg) => Reply::Bulk(msg.clone()),
                None => Reply::Simple("PONG".into()),
            }),
            "get" => Ok(self
                .keyspace()
                .get(&args[0])?
                .map(Reply::Bulk)
                .unwrap_or(Reply::Null)),
            "set" => self.set(args),
            "del" => {
                let mut ks = self.keyspace();
                let n = args.iter().filter(|k| ks.del(k)).count();
                Ok(Reply::Integer(n as i64))
            }
            "exists" => {
                let mut ks = self.keyspace();
                let n = args.iter().filter(|k| ks.exists(k)).count();
                Ok(Reply::Integer(n as i64))
            }
            "pttl" => Ok(Reply::Integer(match self.keyspace().pttl(&args[0]) {
                TtlResult::NotFound => -2,
                TtlResult::NoExpiry => -1,
                TtlResult::Milliseconds(ms) => ms as i64,
            })),
            "rename" => {
                self.keyspace().rename(&args[0], args[1].clone())?;
                Ok(Reply::ok())
            }
            "renamenx" => {
                let mut ks = self.keyspace();
                if !ks.exists(&args[0]) {
                    return Err(EngineError::NoSuchKey);
                }
                if ks.exists(&args[1]) {
                    return Ok(Reply::Integer(0));
                }
                ks.rename(&args[0], args[1].clone())?;
                Ok(Reply::Integer(1))
            }
            "mset" => {
                if args.len() % 2 != 0 {
                    return Err(EngineError::WrongArity(name));
                }
                let mut ks = self.keyspace();
                for pair in args.chunks(2) {
                    ks.set(pair[0].clone(), pair[1].clone(), None);
                }
                Ok(Reply::ok())
            }
            "lpush" | "rpush" => {
                let front = spec.name == "lpush";
                let len = self.keyspace().push(args[0].clone(), &args[1..], front)?;
                Ok(Reply::Integer(len as i64))
            }
            "lrange" => {
                let start = parse_i64(&args[1])?;
                let stop = parse_i64(&args[2])?;
                let items = self.keyspace().range(&args[0], start, stop)?;
                Ok(Reply::Array(items.into_iter().map(Reply::Bulk).collect()))
            }
            "dumpkey" => Ok(self
                .keyspace()
                .dump(&args[0])
                .map(Reply::Bulk)
                .unwrap_or(Reply::Null)),
            "restorekey" => {
                self.keyspace().restore(args[0].clone(), &args[1])?;
                Ok(Reply::ok())
            }
            "flushall" => {
                self.keyspace().clear();
                Ok(Reply::ok())
            }
            "dbsize" => Ok(Reply::Integer(self.keyspace().len() as i64)),
            "slaveof" => self.slaveof(&args[0], &args[1]),
            "role" => Ok(match self.role() {
                Role::Master => Reply::Array(vec![Reply::bulk("master")]),
                Role::Replica { host, port } => Reply::Array(vec![
                    Reply::bulk("slave"),
                    Reply::bulk(host),
                    Reply::Integer(port as i64),
                ]),
            }),
            _ => Err(EngineError::UnknownCommand(name)),
        }
    }

    fn set(&self, args: &[Bytes]) -> Result<Reply, EngineError> {
        let mut ttl_ms = None;
        let mut nx = false;
        let mut i = 2;
        while i < args.len() {
            let opt = String::from_utf8_lossy(&args[i]).to_ascii_uppercase();
            match opt.as_str() {
                "PX" => {
                    let ms = args.get(i + 1).ok_or(EngineError::Syntax)?;
                    let ms = parse_i64(ms)?;
                    if ms <= 0 {
                        return Err(EngineError::Syntax);
                    }
                    ttl_ms = Some(ms as u64);
                    i += 2;
                }
                "NX" => {
                    nx = true;
                    i += 1;
                }
                _ => return Err(EngineError::Syntax),
            }
        }

        let mut ks = self.keyspace();
        if nx && ks.exists(&args[0]) {
            return Ok(Reply::Null);
        }
        ks.set(args[0].clone(), args[1].clone(), ttl_ms);
        Ok(Reply::ok())
    }

    fn slaveof(&self, host: &Bytes, port: &Bytes) -> Result<Reply, EngineError> {
        let host = String::from_utf8_lossy(host).into_owned();
        let port = String::from_utf8_lossy(port).into_owned();
        if host.eq_ignore_ascii_case("no") && port.eq_ignore_ascii_case("one") {
            if self.role() != Role::Master {
                info!("promoted to master");
            }
            self.set_role(Role::Master);
            return Ok(Reply::ok());
        }
        let port: u16 = port.parse().map_err(|_| EngineError::NotInteger)?;
        info!(master = %format!("{host}:{port}"), "following new master");
        self.set_role(Role::Replica { host, port });
        Ok(Reply::ok())
    }

    // -- direct accessors used by the cluster layer --

    pub fn exists(&self, key: &[u8]) -> bool {
        self.keyspace().exists(key)
    }

    /// Serializes the value and remaining TTL of `key`, or `None` if absent.
    pub fn dump_key(&self, key: &[u8]) -> Option<Bytes> {
        self.keyspace().dump(key)
    }

    /// Validates a dump payload without storing it.
    pub fn validate_dump(&self, payload: &[u8]) -> Result<(), EngineError> {
        keyspace::validate_dump(payload)
    }

    /// Snapshot of every live key.
    pub fn keys(&self) -> Vec<Bytes> {
        self.keyspace().keys()
    }

    /// Deletes every key matching `pred`. Returns how many were removed.
    pub fn remove_keys_where(&self, pred: impl Fn(&[u8]) -> bool) -> usize {
        let mut ks = self.keyspace();
        let doomed: Vec<Bytes> = ks.keys().into_iter().filter(|k| pred(k)).collect();
        doomed.iter().filter(|k| ks.del(k)).count()
    }

    /// Runs command lines in order. Stops at the first error reply and
    /// returns it; otherwise returns the last reply.
    pub fn exec_batch(&self, cmds: &[CmdLine]) -> Reply {
        let mut last = Reply::ok();
        for cmd in cmds {
            last = self.exec(cmd);
            if last.is_error() {
                break;
            }
        }
        last
    }
}

fn parse_i64(raw: &[u8]) -> Result<i64, EngineError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(EngineError::NotInteger)
}
