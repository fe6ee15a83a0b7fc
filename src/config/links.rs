//! Server-to-server connect and cluster configuration.

use serde::Deserialize;

use super::defaults;

/// A connect block describing one peer server.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectBlock {
    /// Remote server name (e.g. "hub.example.net").
    pub name: String,
    /// Remote address or hostname to dial, and the port.
    pub host: String,
    pub port: u16,
    /// Password we send in our PASS, and the one we demand in theirs.
    pub send_password: String,
    pub accept_password: String,
    /// Treat `accept_password` as a bcrypt hash.
    #[serde(default)]
    pub encrypted: bool,
    /// Class this link attaches to (connect frequency, sendq).
    #[serde(default = "defaults::class_name")]
    pub class: String,
    /// Dial this peer automatically.
    #[serde(default)]
    pub autoconnect: bool,
    /// Require the peer to arrive over the TLS terminator.
    #[serde(default)]
    pub tls: bool,
    /// Masks of servers this peer may introduce. Empty means leaf.
    #[serde(default)]
    pub hub_mask: Vec<String>,
    /// Masks this peer must NOT introduce.
    #[serde(default)]
    pub leaf_mask: Vec<String>,
    /// Suppress topic burst even when the TB capability is offered.
    #[serde(default = "defaults::default_true")]
    pub topic_burst: bool,
    /// Suppress compression even when the ZIP capability is offered.
    #[serde(default)]
    pub compressed: bool,
}

/// A cluster block: which ban-style commands are shared with which
/// server masks.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterBlock {
    /// Dotted server-name mask this entry targets.
    pub name: String,
    /// Shared command types: "kline", "unkline", "xline", "unxline",
    /// "resv", "unresv", "locops", "all".
    #[serde(default)]
    pub flags: Vec<String>,
}

impl ClusterBlock {
    /// Does this entry share the given command type?
    pub fn shares(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag || f == "all")
    }
}
