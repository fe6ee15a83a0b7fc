//! DNS blacklist checks.
//!
//! Each configured list gets a reversed-address query; a reply inside
//! 127.0.0.0/8 matching the list's filters means "listed". All lists
//! are consulted concurrently and the first hit sticks to the client
//! for the registration verifier to act on.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::debug;

use crate::config::DnsblBlock;
use crate::network::dns::DnsService;

/// Timeout per blacklist query.
const DNSBL_TIMEOUT: Duration = Duration::from_secs(3);

/// Form the reversed query name: `d.c.b.a.<zone>` for IPv4, each
/// nibble reversed and dot-separated for IPv6.
pub fn query_name(ip: IpAddr, zone: &str) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, d] = v4.octets();
            format!("{d}.{c}.{b}.{a}.{zone}")
        }
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for octet in v6.octets().iter().rev() {
                nibbles.push(format!("{:x}", octet & 0x0f));
                nibbles.push(format!("{:x}", octet >> 4));
            }
            format!("{}.{}", nibbles.join("."), zone)
        }
    }
}

/// A listed reply must sit in 127.0.0.0/8 and match a configured
/// filter (any reply matches a filterless list).
pub fn reply_matches(block: &DnsblBlock, reply: Ipv4Addr) -> bool {
    if reply.octets()[0] != 127 {
        return false;
    }
    if block.matches.is_empty() {
        return true;
    }
    let last_octet = reply.octets()[3].to_string();
    let full = reply.to_string();
    block
        .matches
        .iter()
        .any(|filter| filter == &last_octet || filter == &full)
}

/// Substitute the `%{...}` placeholders in a list's reason template.
pub fn format_reason(
    template: &str,
    nick: &str,
    ip: &str,
    host: &str,
    dnsbl_host: &str,
    network_name: &str,
) -> String {
    template
        .replace("%{nick}", nick)
        .replace("%{ip}", ip)
        .replace("%{host}", host)
        .replace("%{dnsbl-host}", dnsbl_host)
        .replace("%{network-name}", network_name)
}

/// Check `ip` against every applicable list. Returns the matched
/// list's zone and reason template.
pub async fn check(dns: &DnsService, blocks: &[DnsblBlock], ip: IpAddr) -> Option<(String, String)> {
    let applicable: Vec<&DnsblBlock> = blocks
        .iter()
        .filter(|b| if ip.is_ipv4() { b.ipv4 } else { b.ipv6 })
        .collect();
    if applicable.is_empty() {
        return None;
    }

    let queries = applicable.iter().map(|block| {
        let name = query_name(ip, &block.host);
        async move {
            let lookup = dns.resolver().lookup_ip(name.as_str());
            match tokio::time::timeout(DNSBL_TIMEOUT, lookup).await {
                Ok(Ok(reply)) => {
                    for addr in reply.iter() {
                        if let IpAddr::V4(v4) = addr {
                            if reply_matches(block, v4) {
                                return Some((block.host.clone(), block.reason.clone()));
                            }
                        }
                    }
                    None
                }
                Ok(Err(_)) => None, // NXDOMAIN and friends: not listed
                Err(_) => {
                    debug!(zone = %block.host, "dnsbl query timed out");
                    None
                }
            }
        }
    });

    join_all(queries).await.into_iter().flatten().next()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(matches: Vec<&str>) -> DnsblBlock {
        DnsblBlock {
            host: "dnsbl.example".into(),
            reason: "Your IP %{ip} is listed in %{dnsbl-host}".into(),
            ipv4: true,
            ipv6: false,
            matches: matches.into_iter().map(String::from).collect(),
        }
    }

    #[test]
    fn ipv4_query_reverses_octets() {
        assert_eq!(
            query_name("192.0.2.7".parse().unwrap(), "dnsbl.example"),
            "7.2.0.192.dnsbl.example"
        );
    }

    #[test]
    fn ipv6_query_reverses_nibbles() {
        let name = query_name("2001:db8::1".parse().unwrap(), "dnsbl.example");
        assert!(name.starts_with("1.0.0.0."));
        assert!(name.ends_with(".8.b.d.0.1.0.0.2.dnsbl.example"));
        // 32 nibbles plus the zone.
        assert_eq!(name.split('.').count(), 32 + 2);
    }

    #[test]
    fn replies_must_be_loopback_range() {
        let b = block(vec![]);
        assert!(reply_matches(&b, "127.0.0.2".parse().unwrap()));
        assert!(reply_matches(&b, "127.0.0.200".parse().unwrap()));
        assert!(!reply_matches(&b, "10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn filters_select_reply_codes() {
        let b = block(vec!["2", "127.0.0.9"]);
        assert!(reply_matches(&b, "127.0.0.2".parse().unwrap()));
        assert!(reply_matches(&b, "127.0.0.9".parse().unwrap()));
        assert!(!reply_matches(&b, "127.0.0.3".parse().unwrap()));
    }

    #[test]
    fn reason_template_substitution() {
        let reason = format_reason(
            "%{nick} (%{ip}, %{host}) is listed in %{dnsbl-host} on %{network-name}",
            "alice",
            "192.0.2.7",
            "host.example",
            "dnsbl.example",
            "ExampleNet",
        );
        assert_eq!(
            reason,
            "alice (192.0.2.7, host.example) is listed in dnsbl.example on ExampleNet"
        );
    }
}
