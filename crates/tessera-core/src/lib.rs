//! tessera-core: the single-node command engine.
//!
//! The cluster layer treats this crate as its local store. It keeps strings
//! and lists in memory with millisecond expiry, knows which commands write
//! and which arguments are keys, and can serialize a key (value plus
//! remaining TTL) for transfer to another node.

pub mod command;
pub mod engine;
pub mod error;
pub mod keyspace;
mod time;

pub use command::{command_keys, lookup_command, CommandSpec, KeySpec};
pub use engine::{Engine, Role};
pub use error::EngineError;
pub use keyspace::{Keyspace, TtlResult, Value};
