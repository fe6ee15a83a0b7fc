//! IRC wire protocol library for the ferricd daemon.
//!
//! Covers the classic client protocol and the TS6 server-to-server
//! dialect: message grammar (optional source prefix, verb, up to 14
//! middle parameters, optional trailing), CRLF framing with the
//! 512-byte line limit, RFC 1459 case mapping, and the escaped-glob
//! mask matching used by access control.

pub mod casemap;
pub mod command;
pub mod error;
pub mod message;
mod parser;
#[cfg(feature = "tokio")]
pub mod transport;
pub mod validation;
pub mod wildcard;

pub use casemap::{irc_eq, irc_lower_char, irc_to_lower};
pub use command::{BanAction, Command};
pub use error::ProtocolError;
pub use message::{Message, Prefix};
#[cfg(feature = "tokio")]
pub use transport::LineCodec;
pub use wildcard::wildcard_match;

/// Maximum IRC line length in bytes, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of middle parameters in a single message.
pub const MAX_PARAMS: usize = 14;
