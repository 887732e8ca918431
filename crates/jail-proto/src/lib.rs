//! # jail-proto
//!
//! Control protocol library for the `jaild` intrusion prevention daemon.
//!
//! Everything a client and the server must agree on lives here:
//!
//! - Command frames: vectors of string tokens, JSON-encoded on the wire and
//!   terminated by the `<F2B_END_COMMAND>` sentinel
//! - Replies: a `(code, value)` pair where code 0 is success and 1 failure
//! - The ordered [`Value`] tree used by status output
//! - Shared scalar grammars: time intervals (`"15d 5h 30m"`), booleans
//!   (`yes/no/on/off/...`) and log level names
//!
//! ## Quick Start
//!
//! ```rust
//! use jail_proto::{CommandFrame, Reply, Value, parse_interval};
//!
//! let cmd = CommandFrame::from(["set", "ssh", "bantime", "15d 5h 30m"]);
//! assert_eq!(cmd.verb(), Some("set"));
//! assert_eq!(parse_interval("15d 5h 30m").unwrap(), 1_315_800);
//!
//! let reply = Reply::ok(Value::from("pong"));
//! assert!(reply.is_ok());
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod codec;
pub mod command;
pub mod duration;
pub mod error;
pub mod loglevel;
pub mod value;

pub use codec::{ClientCodec, ClientFrame, FrameCodec, CLOSE_COMMAND, END_COMMAND};
pub use command::{parse_bool, CommandFrame, Reply};
pub use duration::{format_interval, parse_interval};
pub use error::ProtocolError;
pub use loglevel::LogLevel;
pub use value::Value;
