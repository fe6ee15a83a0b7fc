//! Address-indexed access-control matching.
//!
//! Every auth block, ban and exemption is indexed in one fixed-size
//! hash table keyed coarsely: hostnames by the suffix after the last
//! wildcard, IPv4 masks by the address truncated to a multiple-of-8
//! prefix, IPv6 to a multiple-of-16. A lookup probes the handful of
//! buckets that could hold a matching mask and returns the single
//! highest-precedence survivor; precedence is a strictly-decreasing
//! counter, so earlier-defined rules win.

mod check;

pub use check::{find_address_conf, find_dline, valid_wild_card};

use parking_lot::RwLock;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use ferric_proto::{irc_eq, irc_lower_char, wildcard_match};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::bans::{conf_flags, ConfItem, ConfKind};

/// Bucket count; power of two.
pub const ATABLE_SIZE: usize = 4096;

/// A parsed mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskValue {
    /// Hostname glob.
    Host(String),
    /// CIDR prefix (a bare address is a full-length prefix).
    Ip(IpNet),
}

/// Parse a mask string: wildcards force a hostname mask, otherwise an
/// address with optional `/bits` parses as a CIDR prefix, and anything
/// unparsable falls back to a hostname mask.
pub fn parse_netmask(text: &str) -> MaskValue {
    if text.contains(['*', '?']) {
        return MaskValue::Host(text.to_string());
    }
    if text.contains(':') {
        let (ip, bits) = match text.split_once('/') {
            Some((ip, b)) => (ip, b.parse::<u8>().unwrap_or(128).min(128)),
            None => (text, 128),
        };
        if let Ok(addr) = ip.parse::<Ipv6Addr>() {
            if let Ok(net) = Ipv6Net::new(addr, bits) {
                return MaskValue::Ip(IpNet::V6(net));
            }
        }
        return MaskValue::Host(text.to_string());
    }
    if text.contains('.') {
        let (ip, bits) = match text.split_once('/') {
            Some((ip, b)) => (ip, b.parse::<u8>().unwrap_or(32).min(32)),
            None => (text, 32),
        };
        if let Ok(addr) = ip.parse::<Ipv4Addr>() {
            if let Ok(net) = Ipv4Net::new(addr, bits) {
                return MaskValue::Ip(IpNet::V4(net));
            }
        }
    }
    MaskValue::Host(text.to_string())
}

fn hash_ipv4(addr: Ipv4Addr, bits: u8) -> usize {
    if bits == 0 {
        return 0;
    }
    let av = u32::from(addr) & !(((1u64 << (32 - bits)) - 1) as u32);
    ((av ^ (av >> 12) ^ (av >> 24)) as usize) & (ATABLE_SIZE - 1)
}

fn hash_ipv6(addr: Ipv6Addr, bits: u8) -> usize {
    let mut v = 0usize;
    let mut bits = bits as i32;
    for octet in addr.octets() {
        if bits >= 8 {
            v ^= octet as usize;
            bits -= 8;
        } else if bits > 0 {
            v ^= (octet & !((1u16 << (8 - bits)) as u8 - 1)) as usize;
            return v & (ATABLE_SIZE - 1);
        } else {
            return v & (ATABLE_SIZE - 1);
        }
    }
    v & (ATABLE_SIZE - 1)
}

fn hash_text(text: &str) -> usize {
    let mut h = 0u32;
    for c in text.chars() {
        h = (h << 4).wrapping_sub(h.wrapping_add(irc_lower_char(c) as u32));
    }
    (h as usize) & (ATABLE_SIZE - 1)
}

/// Hash of the suffix right of the first `.` past the last wildcard.
/// A mask with no wildcard hashes whole; a mask ending in a wildcard
/// lands in bucket 0 (the wildcard bucket).
fn get_mask_hash(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let mut suffix_start: Option<usize> = None;
    for i in (0..chars.len()).rev() {
        match chars[i] {
            '*' | '?' => {
                return match suffix_start {
                    Some(s) => hash_text(&text[s..]),
                    None => hash_text(""),
                };
            }
            '.' => suffix_start = Some(text.char_indices().nth(i + 1).map(|(b, _)| b).unwrap_or(text.len())),
            _ => {}
        }
    }
    hash_text(text)
}

/// One installed mask.
#[derive(Debug)]
pub struct AddressEntry {
    pub mask: MaskValue,
    /// Username constraint glob; `*` when unconstrained.
    pub username: String,
    /// SASL-account constraint on auth entries.
    pub auth_user: Option<String>,
    pub kind: ConfKind,
    /// Larger wins; assigned from a strictly-decreasing counter.
    pub precedence: u64,
    pub conf: Arc<ConfItem>,
}

struct Inner {
    table: Vec<Vec<AddressEntry>>,
    next_precedence: u64,
}

/// Which permanent entries a bulk flush drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    /// General-config reread: drop permanent auth and exempt entries,
    /// keep bans. Temporary entries always survive.
    ConfigReread,
    /// Ban-file reread: drop permanent bans, keep auth and exempt.
    BanReread,
}

/// The matcher table.
pub struct HostMatcher {
    inner: RwLock<Inner>,
}

impl Default for HostMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMatcher {
    pub fn new() -> HostMatcher {
        HostMatcher {
            inner: RwLock::new(Inner {
                table: (0..ATABLE_SIZE).map(|_| Vec::new()).collect(),
                next_precedence: u64::MAX,
            }),
        }
    }

    fn bucket_for(mask: &MaskValue) -> usize {
        match mask {
            MaskValue::Host(h) => get_mask_hash(h),
            MaskValue::Ip(IpNet::V4(net)) => {
                let bits = net.prefix_len() - net.prefix_len() % 8;
                hash_ipv4(net.addr(), bits)
            }
            MaskValue::Ip(IpNet::V6(net)) => {
                let bits = net.prefix_len() - net.prefix_len() % 16;
                hash_ipv6(net.addr(), bits)
            }
        }
    }

    /// Index a record under `address`. The matcher holds its own
    /// reference to the record.
    pub fn add(
        &self,
        address: &str,
        kind: ConfKind,
        username: Option<&str>,
        auth_user: Option<&str>,
        conf: Arc<ConfItem>,
    ) {
        let mask = parse_netmask(address);
        let bucket = Self::bucket_for(&mask);
        let mut inner = self.inner.write();
        let precedence = inner.next_precedence;
        inner.next_precedence -= 1;
        conf.attach();
        inner.table[bucket].insert(
            0,
            AddressEntry {
                mask,
                username: username.unwrap_or("*").to_string(),
                auth_user: auth_user.map(str::to_string),
                kind,
                precedence,
                conf,
            },
        );
    }

    /// The general lookup: highest-precedence entry of `kind` whose
    /// mask covers the client and whose constraints pass.
    ///
    /// `skip_username` implements the "username check skipped" lookup
    /// variants used for D-lines and exact-address paths.
    #[allow(clippy::too_many_arguments)]
    pub fn find(
        &self,
        name: Option<&str>,
        sockhost: Option<&str>,
        orighost: Option<&str>,
        addr: Option<IpAddr>,
        kind: ConfKind,
        username: Option<&str>,
        auth_user: Option<&str>,
        skip_username: bool,
    ) -> Option<Arc<ConfItem>> {
        let inner = self.inner.read();
        let username = username.unwrap_or("");
        let mut best: Option<Arc<ConfItem>> = None;
        let mut best_prec = 0u64;

        let constraints_pass = |entry: &AddressEntry| {
            if entry.conf.is_illegal() {
                return false;
            }
            if !skip_username && !wildcard_match(&entry.username, username) {
                return false;
            }
            if entry.kind == ConfKind::Auth {
                if let Some(pattern) = &entry.auth_user {
                    match auth_user {
                        Some(account) => {
                            if !wildcard_match(pattern, account) {
                                return false;
                            }
                        }
                        None => return false,
                    }
                }
            }
            true
        };

        if let Some(ip) = addr {
            match ip {
                IpAddr::V4(v4) => {
                    for b in [32u8, 24, 16, 8, 0] {
                        for entry in &inner.table[hash_ipv4(v4, b)] {
                            if entry.kind != kind || entry.precedence <= best_prec {
                                continue;
                            }
                            let MaskValue::Ip(IpNet::V4(net)) = &entry.mask else {
                                continue;
                            };
                            if net.contains(&v4) && constraints_pass(entry) {
                                best_prec = entry.precedence;
                                best = Some(entry.conf.clone());
                            }
                        }
                    }
                }
                IpAddr::V6(v6) => {
                    for b in (0..=128u8).rev().step_by(16) {
                        for entry in &inner.table[hash_ipv6(v6, b)] {
                            if entry.kind != kind || entry.precedence <= best_prec {
                                continue;
                            }
                            let MaskValue::Ip(IpNet::V6(net)) = &entry.mask else {
                                continue;
                            };
                            if net.contains(&v6) && constraints_pass(entry) {
                                best_prec = entry.precedence;
                                best = Some(entry.conf.clone());
                            }
                        }
                    }
                }
            }
        }

        for target in [orighost, name].into_iter().flatten() {
            // Suffix chain: each `.`-boundary tail selects a bucket,
            // but the mask always matches against the whole name.
            let mut tail = target;
            loop {
                for entry in &inner.table[hash_text(tail)] {
                    if entry.kind != kind || entry.precedence <= best_prec {
                        continue;
                    }
                    let MaskValue::Host(mask) = &entry.mask else {
                        continue;
                    };
                    if wildcard_match(mask, target) && constraints_pass(entry) {
                        best_prec = entry.precedence;
                        best = Some(entry.conf.clone());
                    }
                }
                match tail.find('.') {
                    Some(dot) => tail = &tail[dot + 1..],
                    None => break,
                }
            }
            // Wildcard bucket: fully-wild masks, also probed against
            // the numeric sockhost.
            for entry in &inner.table[0] {
                if entry.kind != kind || entry.precedence <= best_prec {
                    continue;
                }
                let MaskValue::Host(mask) = &entry.mask else {
                    continue;
                };
                let hit = wildcard_match(mask, target)
                    || sockhost.is_some_and(|s| wildcard_match(mask, s));
                if hit && constraints_pass(entry) {
                    best_prec = entry.precedence;
                    best = Some(entry.conf.clone());
                }
            }
        }

        best
    }

    /// Exact-mask lookup, for unban operations: the mask must equal
    /// the installed one, not merely cover the probe.
    pub fn find_exact(
        &self,
        address: &str,
        kind: ConfKind,
        username: Option<&str>,
    ) -> Option<Arc<ConfItem>> {
        let mask = parse_netmask(address);
        let bucket = Self::bucket_for(&mask);
        let inner = self.inner.read();
        inner.table[bucket]
            .iter()
            .find(|entry| {
                if entry.kind != kind {
                    return false;
                }
                let username_eq = match (username, entry.username.as_str()) {
                    (None, u) => u == "*",
                    (Some(a), b) => irc_eq(a, b),
                };
                if !username_eq {
                    return false;
                }
                match (&entry.mask, &mask) {
                    (MaskValue::Host(a), MaskValue::Host(b)) => irc_eq(a, b),
                    (MaskValue::Ip(a), MaskValue::Ip(b)) => {
                        a.prefix_len() == b.prefix_len() && a.contains(&b.addr())
                    }
                    _ => false,
                }
            })
            .map(|entry| entry.conf.clone())
    }

    /// Unlink the entry for `conf` and mark the record illegal.
    /// Returns true when an entry was removed.
    pub fn delete(&self, address: &str, conf: &Arc<ConfItem>) -> bool {
        let mask = parse_netmask(address);
        let bucket = Self::bucket_for(&mask);
        let mut inner = self.inner.write();
        let list = &mut inner.table[bucket];
        let before = list.len();
        list.retain(|entry| !Arc::ptr_eq(&entry.conf, conf));
        if list.len() != before {
            conf.mark_illegal();
            conf.detach();
            true
        } else {
            false
        }
    }

    /// Bulk flush for a rehash. Temporary entries always survive.
    ///
    /// A config reread drops everything the config file put here
    /// (it is about to be reinstalled) plus permanent auth/exempt
    /// entries; runtime bans stay. A ban reread drops permanent
    /// runtime bans and keeps the client-side and config entries.
    pub fn clear(&self, mode: ClearMode) {
        let mut inner = self.inner.write();
        for bucket in &mut inner.table {
            bucket.retain(|entry| {
                if entry.conf.has_flag(conf_flags::TEMPORARY) {
                    return true;
                }
                let from_config = entry.conf.has_flag(conf_flags::FROM_CONFIG);
                let is_client_side =
                    matches!(entry.kind, ConfKind::Auth | ConfKind::ExemptDline);
                let keep = match mode {
                    ClearMode::ConfigReread => !from_config && !is_client_side,
                    ClearMode::BanReread => from_config || is_client_side,
                };
                if !keep {
                    entry.conf.mark_illegal();
                    entry.conf.detach();
                }
                keep
            });
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().table.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
