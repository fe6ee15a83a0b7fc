//! Connection class configuration.

use serde::Deserialize;

use super::defaults;

/// A named capacity policy shared by auth and connect blocks.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassBlock {
    pub name: String,
    /// Maximum clients attached to this class. `-1` marks the class
    /// for deletion on rehash; it lingers until the last detach.
    #[serde(default = "defaults::max_total")]
    pub max_total: i64,
    /// Per-IP cap counting only local clients.
    #[serde(default = "defaults::per_ip")]
    pub max_local_per_ip: u32,
    /// Per-IP cap counting clients network-wide.
    #[serde(default = "defaults::per_ip")]
    pub max_global_per_ip: u32,
    /// Per-ident@host cap.
    #[serde(default = "defaults::per_ip")]
    pub max_ident_per_ip: u32,
    /// Outbound queue byte cap before the client is dropped.
    #[serde(default = "defaults::sendq")]
    pub sendq: usize,
    /// Seconds of silence before a PING probe.
    #[serde(default = "defaults::ping_frequency")]
    pub ping_frequency: u64,
    /// Minimum seconds between outbound connect attempts (servers).
    #[serde(default = "defaults::connect_frequency")]
    pub connect_frequency: u64,
    /// Prefix lengths used to bucket members for the CIDR cap.
    #[serde(default = "defaults::cidr_ipv4_bitlen")]
    pub cidr_ipv4_bitlen: u8,
    #[serde(default = "defaults::cidr_ipv6_bitlen")]
    pub cidr_ipv6_bitlen: u8,
    /// Clients allowed per CIDR bucket; 0 disables the check.
    #[serde(default = "defaults::number_per_cidr")]
    pub number_per_cidr: u32,
}
