//! Reverse-and-forward-confirmed DNS resolution.
//!
//! A connecting client's IP gets a PTR lookup; the returned name is
//! only trusted if a forward lookup of that name contains the
//! original address exactly. Anything else falls back to the numeric
//! host.

use std::net::IpAddr;
use std::time::Duration;

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use tracing::debug;

use ferric_proto::validation::{is_valid_hostname, HOSTLEN};

#[derive(Clone)]
pub struct DnsService {
    resolver: TokioResolver,
}

impl Default for DnsService {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsService {
    pub fn new() -> DnsService {
        // System config when available, public defaults otherwise.
        let resolver = TokioResolver::builder_tokio()
            .map(|b| b.build())
            .unwrap_or_else(|_| {
                TokioResolver::builder_with_config(
                    ResolverConfig::default(),
                    TokioConnectionProvider::default(),
                )
                .build()
            });
        DnsService { resolver }
    }

    /// Resolve a verified hostname for `ip`, or None for the numeric
    /// fallback.
    pub async fn verify_reverse(&self, ip: IpAddr, timeout_secs: u64) -> Option<String> {
        let timeout = Duration::from_secs(timeout_secs.max(1));

        let reverse = tokio::time::timeout(timeout, self.resolver.reverse_lookup(ip))
            .await
            .ok()?
            .ok()?;
        let name = reverse.iter().next()?.to_utf8();
        let name = name.trim_end_matches('.').to_string();

        if name.len() > HOSTLEN || !is_valid_hostname(&name) {
            debug!(%ip, name, "reverse name failed validation");
            return None;
        }

        // Forward-confirm: one of the name's addresses must be the
        // original, byte for byte.
        let forward = tokio::time::timeout(timeout, self.resolver.lookup_ip(name.as_str()))
            .await
            .ok()?
            .ok()?;
        if forward.iter().any(|addr| addr == ip) {
            Some(name)
        } else {
            debug!(%ip, name, "forward confirmation failed");
            None
        }
    }

    pub fn resolver(&self) -> &TokioResolver {
        &self.resolver
    }
}
