//! Unified error handling for ferricd.

use thiserror::Error;

/// Fatal and recoverable daemon errors.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ferric_proto::ProtocolError),

    #[error("dns error: {0}")]
    Dns(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Why a pre-registration connection was refused.
///
/// Each variant maps to the wording of the `ERROR :Closing Link`
/// line and to the stats counter charged for the refusal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("You are not authorised to use this server")]
    NotAuthorised,

    #[error("Bad password")]
    BadPassword,

    #[error("K-Lined")]
    KLined,

    #[error("D-Lined")]
    DLined,

    #[error("X-Lined")]
    XLined,

    #[error("Listed in {0}")]
    Dnsbl(String),

    #[error("No more connections allowed in your connection class")]
    ClassFull,

    #[error("Too many host connections (local)")]
    TooManyLocal,

    #[error("Too many host connections (global)")]
    TooManyGlobal,

    #[error("Too many user connections (global)")]
    TooManyIdent,

    #[error("Too rapid reconnects, slow down")]
    Throttled,

    #[error("Reconnecting too fast, throttled")]
    RejectCached,

    #[error("Invalid username [{0}]")]
    InvalidUsername(String),

    #[error("TLS connection required")]
    NeedTls,

    #[error("SASL authentication required")]
    NeedSasl,

    #[error("Identd required")]
    NeedIdent,

    #[error("Connection timed out")]
    TimedOut,

    #[error("This server is full; try {0}:{1}")]
    Redirect(String, u16),
}

/// Result of a server-link handshake verification step.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no matching connect block for {0}")]
    NoConnectBlock(String),

    #[error("bad link password for {0}")]
    BadPassword(String),

    #[error("invalid servername {0}")]
    InvalidName(String),

    #[error("invalid SID {0}")]
    InvalidSid(String),

    #[error("server {0} already exists")]
    AlreadyLinked(String),

    #[error("host mismatch for {0}")]
    HostMismatch(String),

    #[error("TLS required for {0}")]
    NeedTls(String),

    #[error("clock skew {0}s exceeds the permitted delta")]
    ClockSkew(i64),

    #[error("hub rule violation: {0}")]
    HubRule(String),

    #[error("handshake out of order: got {0}")]
    OutOfOrder(String),
}
