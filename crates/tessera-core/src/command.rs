//! Command table: arity, write flag and key positions.
//!
//! The cluster router uses [`command_keys`] to find which slots a command
//! touches, and the write flag to decide whether a migrating slot must
//! record the key as dirty.

use bytes::Bytes;

/// Where the keys sit in a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    /// The command has no keys.
    None,
    /// Only the first argument is a key.
    First,
    /// The first two arguments are keys (`RENAME src dst`).
    FirstTwo,
    /// Every argument is a key.
    All,
    /// Arguments alternate key, value (`MSET k v k v`).
    Pairs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Exact argument count including the name, or the minimum when negative.
    pub arity: i32,
    pub write: bool,
    pub keys: KeySpec,
}

impl CommandSpec {
    const fn new(name: &'static str, arity: i32, write: bool, keys: KeySpec) -> Self {
        Self {
            name,
            arity,
            write,
            keys,
        }
    }

    /// Checks the argument count of `cmd` against this spec.
    pub fn arity_ok(&self, len: usize) -> bool {
        let len = len as i32;
        if self.arity >= 0 {
            len == self.arity
        } else {
            len >= -self.arity
        }
    }
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec::new("ping", -1, false, KeySpec::None),
    CommandSpec::new("get", 2, false, KeySpec::First),
    CommandSpec::new("set", -3, true, KeySpec::First),
    CommandSpec::new("del", -2, true, KeySpec::All),
    CommandSpec::new("exists", -2, false, KeySpec::All),
    CommandSpec::new("pttl", 2, false, KeySpec::First),
    CommandSpec::new("rename", 3, true, KeySpec::FirstTwo),
    CommandSpec::new("renamenx", 3, true, KeySpec::FirstTwo),
    CommandSpec::new("mset", -3, true, KeySpec::Pairs),
    CommandSpec::new("lpush", -3, true, KeySpec::First),
    CommandSpec::new("rpush", -3, true, KeySpec::First),
    CommandSpec::new("lrange", 4, false, KeySpec::First),
    CommandSpec::new("dumpkey", 2, false, KeySpec::First),
    CommandSpec::new("restorekey", 3, true, KeySpec::First),
    CommandSpec::new("flushall", 1, true, KeySpec::None),
    CommandSpec::new("dbsize", 1, false, KeySpec::None),
    CommandSpec::new("slaveof", 3, false, KeySpec::None),
    CommandSpec::new("role", 1, false, KeySpec::None),
];

/// Looks up a command by its (case-insensitive) name.
pub fn lookup_command(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|c| c.name.eq_ignore_ascii_case(name))
}

/// Returns the keys of `cmd`, or an empty list for unknown commands.
pub fn command_keys(cmd: &[Bytes]) -> Vec<Bytes> {
    let Some(name) = cmd.first() else {
        return Vec::new();
    };
    let Some(spec) = lookup_command(&String::from_utf8_lossy(name)) else {
        return Vec::new();
    };
    let args = &cmd[1..];
    match spec.keys {
        KeySpec::None => Vec::new(),
        KeySpec::First => args.iter().take(1).cloned().collect(),
        KeySpec::FirstTwo => args.iter().take(2).cloned().collect(),
        KeySpec::All => args.to_vec(),
        KeySpec::Pairs => args.iter().step_by(2).cloned().collect(),
    }
}
