//! Daemon configuration.
//!
//! The config file is TOML. Every block maps onto one of the structs
//! below; missing fields take the compiled defaults so a minimal file
//! only needs the `[server]` identity.

mod auth;
mod classes;
pub mod defaults;
mod dnsbl;
mod links;
mod listen;
pub mod validation;

pub use auth::{AuthBlock, DlineBlock, KlineBlock, OperBlock, ResvBlock, XlineBlock};
pub use classes::ClassBlock;
pub use dnsbl::DnsblBlock;
pub use links::{ClusterBlock, ConnectBlock};
pub use listen::ListenBlock;

use serde::Deserialize;

use crate::error::CoreError;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Server identity block.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// This server's name (e.g. "irc.example.net").
    pub name: String,
    /// Three-character TS6 server ID: digit then two id-chars.
    pub sid: String,
    /// Network name advertised to clients and DNSBL templates.
    #[serde(default = "defaults::network_name")]
    pub network: String,
    /// Free-text server description.
    #[serde(default = "defaults::description")]
    pub description: String,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// The `[general]` tunables consumed across the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Seconds an unregistered connection may linger; also the DNS,
    /// ident and outbound-connect timeout.
    pub connect_timeout: u64,
    /// Maximum |local clock - peer clock| tolerated at SVINFO time.
    pub ts_max_delta: i64,
    /// Require a PONG cookie before registration completes.
    pub ping_cookie: bool,
    /// Disable the RFC 1413 ident lookup entirely.
    pub disable_identd: bool,
    /// Seconds to wait for an ident reply.
    pub ident_timeout: u64,
    /// Connections per IP per `throttle_duration` before the accept
    /// gate refuses.
    pub throttle_count: u32,
    pub throttle_duration: u64,
    /// Refusals per IP before the reject cache short-circuits the
    /// connection, and how long a cache entry lives.
    pub reject_after_count: u32,
    pub reject_duration: u64,
    /// Floor on how long a rejected socket is held before the close.
    pub reject_delay: u64,
    /// Per-network-wide CIDR connection caps.
    pub global_cidr: bool,
    pub global_cidr_ipv4_bitlen: u8,
    pub global_cidr_ipv6_bitlen: u8,
    pub global_cidr_ipv4_count: u32,
    pub global_cidr_ipv6_count: u32,
    /// Dots permitted inside a username.
    pub dots_in_ident: usize,
    /// Minimum non-wildcard characters demanded of a new ban mask.
    pub min_nonwildcard: usize,
    /// Seconds a collided nickname stays reserved; 0 disables.
    pub nick_delay: u64,
    /// User modes applied at registration (oper-only modes stripped).
    pub default_umodes: String,
    /// Hide server topology behind a delay on /LINKS.
    pub flatten_links: bool,
    /// Targets a client may address per rate window, and the window.
    pub target_change: bool,
    pub target_change_interval: u64,
    /// Include AWAY states in the burst to new peers.
    pub burst_away: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            connect_timeout: 30,
            ts_max_delta: 300,
            ping_cookie: false,
            disable_identd: false,
            ident_timeout: 5,
            throttle_count: 4,
            throttle_duration: 60,
            reject_after_count: 3,
            reject_duration: 120,
            reject_delay: 10,
            global_cidr: true,
            global_cidr_ipv4_bitlen: 24,
            global_cidr_ipv6_bitlen: 64,
            global_cidr_ipv4_count: 512,
            global_cidr_ipv6_count: 128,
            dots_in_ident: 0,
            min_nonwildcard: 4,
            nick_delay: 900,
            default_umodes: "+i".into(),
            flatten_links: true,
            target_change: true,
            target_change_interval: 60,
            burst_away: false,
        }
    }
}

/// The root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub listen: Vec<ListenBlock>,
    #[serde(default)]
    pub class: Vec<ClassBlock>,
    #[serde(default)]
    pub auth: Vec<AuthBlock>,
    #[serde(default)]
    pub operator: Vec<OperBlock>,
    #[serde(default)]
    pub connect: Vec<ConnectBlock>,
    #[serde(default)]
    pub cluster: Vec<ClusterBlock>,
    #[serde(default)]
    pub dnsbl: Vec<DnsblBlock>,
    #[serde(default)]
    pub kline: Vec<KlineBlock>,
    #[serde(default)]
    pub dline: Vec<DlineBlock>,
    #[serde(default)]
    pub xline: Vec<XlineBlock>,
    #[serde(default)]
    pub resv: Vec<ResvBlock>,
}

impl Config {
    /// Load and parse the config file.
    pub fn load(path: &str) -> Result<Config, CoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{path}: {e}")))?;
        Config::parse(&text)
    }

    /// Parse config text.
    pub fn parse(text: &str) -> Result<Config, CoreError> {
        toml::from_str(text).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Look up a class block by name.
    pub fn class_named(&self, name: &str) -> Option<&ClassBlock> {
        self.class.iter().find(|c| c.name == name)
    }
}
