//! Protocol error types.

use thiserror::Error;

/// Errors produced while parsing or framing IRC messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,

    #[error("invalid message: {string:?}: {reason}")]
    InvalidMessage { string: String, reason: String },

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("{verb} is missing parameters")]
    MissingParams { verb: String },

    #[error("invalid parameter for {verb}: {param:?}")]
    InvalidParam { verb: String, param: String },
}
