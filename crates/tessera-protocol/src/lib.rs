//! tessera-protocol: replies and peer framing.
//!
//! Nodes talk to each other by sending command lines (`Vec<Bytes>`) and
//! reading back [`Reply`] values. Both travel as length-prefixed bincode
//! frames over TCP.
//!
//! ```
//! use tessera_protocol::{cmd_line, Reply};
//!
//! let cmd = cmd_line(&["SET", "greeting", "hello"]);
//! assert_eq!(cmd.len(), 3);
//! assert!(Reply::ok().is_ok());
//! ```

pub mod frame;
pub mod reply;

pub use frame::{read_frame, write_frame, FrameError, MAX_FRAME_SIZE};
pub use reply::{cmd_line, command_name, format_cmd_line, CmdLine, Reply};
