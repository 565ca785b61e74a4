//! Reply values and command lines.
//!
//! [`Reply`] mirrors the handful of value shapes a command can produce.
//! Payloads use `Bytes` so values move between the engine, the router and
//! the socket without copying.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A command as sent over the wire: the name followed by its arguments.
pub type CmdLine = Vec<Bytes>;

/// The result of executing a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// Short status reply such as `OK` or `PONG`.
    Simple(String),

    /// Error reply. The first word is the error class (`ERR`, `READONLY`, ...).
    Error(String),

    /// 64-bit signed integer.
    Integer(i64),

    /// Binary-safe string.
    Bulk(Bytes),

    /// Ordered list of replies.
    Array(Vec<Reply>),

    /// Missing value.
    Null,
}

impl Reply {
    /// The canonical `OK` status.
    pub fn ok() -> Self {
        Reply::Simple("OK".into())
    }

    /// Builds an `ERR`-class error reply.
    pub fn err(msg: impl std::fmt::Display) -> Self {
        Reply::Error(format!("ERR {msg}"))
    }

    /// Builds a bulk reply from anything convertible to `Bytes`.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Wraps a command line as an array of bulk strings.
    pub fn from_cmd_line(cmd: &[Bytes]) -> Self {
        Reply::Array(cmd.iter().cloned().map(Reply::Bulk).collect())
    }

    /// Interprets an array of bulk strings as a command line.
    pub fn into_cmd_line(self) -> Option<CmdLine> {
        match self {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Reply::Bulk(b) => Some(b),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    /// Returns `true` for the `OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Simple(s) if s == "OK")
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    /// Returns the error text for error replies.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl std::fmt::Display for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Simple(s) => write!(f, "{s}"),
            Reply::Error(e) => write!(f, "(error) {e}"),
            Reply::Integer(n) => write!(f, "(integer) {n}"),
            Reply::Bulk(b) => write!(f, "\"{}\"", String::from_utf8_lossy(b)),
            Reply::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Reply::Null => write!(f, "(nil)"),
        }
    }
}

/// Builds a command line from string-like parts.
pub fn cmd_line<S: AsRef<[u8]>>(parts: &[S]) -> CmdLine {
    parts
        .iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Returns the lowercased command name, or an empty string for an empty line.
pub fn command_name(cmd: &[Bytes]) -> String {
    cmd.first()
        .map(|name| String::from_utf8_lossy(name).to_ascii_lowercase())
        .unwrap_or_default()
}

/// Renders a command line for log output. Arguments past the first four are
/// elided so dumped values don't flood the log.
pub fn format_cmd_line(cmd: &[Bytes]) -> String {
    let mut out = String::new();
    for (i, part) in cmd.iter().take(4).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&String::from_utf8_lossy(part));
    }
    if cmd.len() > 4 {
        out.push_str(&format!(" ... ({} args)", cmd.len()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn err_prefixes_class() {
        assert_eq!(Reply::err("no such key"), Reply::Error("ERR no such key".into()));
        assert!(Reply::err("x").is_error());
    }

    #[test]
    fn ok_detection() {
        assert!(Reply::ok().is_ok());
        assert!(!Reply::Simple("PONG".into()).is_ok());
        assert!(!Reply::Integer(1).is_ok());
    }

    #[test]
    fn cmd_line_through_array() {
        let cmd = cmd_line(&["RESTOREKEY", "k", "payload"]);
        let reply = Reply::from_cmd_line(&cmd);
        assert_eq!(reply.into_cmd_line(), Some(cmd));
    }

    #[test]
    fn into_cmd_line_rejects_mixed_array() {
        let reply = Reply::Array(vec![Reply::bulk("a"), Reply::Integer(1)]);
        assert_eq!(reply.into_cmd_line(), None);
        assert_eq!(Reply::Null.into_cmd_line(), None);
    }

    #[test]
    fn command_name_lowercases() {
        assert_eq!(command_name(&cmd_line(&["ReNaMe", "a", "b"])), "rename");
        assert_eq!(command_name(&[]), "");
    }

    #[test]
    fn format_elides_long_lines() {
        let cmd = cmd_line(&["MSET", "a", "1", "b", "2", "c", "3"]);
        let text = format_cmd_line(&cmd);
        assert!(text.starts_with("MSET a 1 b"));
        assert!(text.contains("7 args"));
    }
}
