//! DNS blacklist configuration.

use serde::Deserialize;

use super::defaults;

/// One configured DNS blacklist.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsblBlock {
    /// Zone to query, e.g. "dnsbl.dronebl.org".
    pub host: String,
    /// Rejection text. `%{nick}`, `%{ip}`, `%{host}`, `%{dnsbl-host}`
    /// and `%{network-name}` are substituted.
    #[serde(default = "default_reason")]
    pub reason: String,
    /// Address families this list covers.
    #[serde(default = "defaults::default_true")]
    pub ipv4: bool,
    #[serde(default)]
    pub ipv6: bool,
    /// Accepted reply addresses within 127.0.0.0/8, as final-octet
    /// match strings ("2", "127.0.0.3", ...). Empty accepts any.
    #[serde(default)]
    pub matches: Vec<String>,
}

fn default_reason() -> String {
    "Your IP %{ip} is listed in %{dnsbl-host}".to_string()
}
