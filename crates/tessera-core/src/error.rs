//! Error types for the engine.

use tessera_protocol::Reply;
use thiserror::Error;

/// Errors produced while executing a command locally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(String),

    #[error("syntax error")]
    Syntax,

    #[error("value is not an integer or out of range")]
    NotInteger,

    #[error("no such key")]
    NoSuchKey,

    /// The key holds a different type than the command expects.
    #[error("Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("You can't write against a read only replica.")]
    ReadOnly,

    #[error("invalid dump payload: {0}")]
    BadDump(String),
}

impl From<EngineError> for Reply {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::WrongType => Reply::Error(format!("WRONGTYPE {e}")),
            EngineError::ReadOnly => Reply::Error(format!("READONLY {e}")),
            other => Reply::err(other),
        }
    }
}
