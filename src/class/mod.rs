//! Connection classes and their CIDR-bucket limits.
//!
//! A class carries capacity policy for the clients and links attached
//! to it. Besides the flat total, each class keeps a tree of CIDR
//! buckets at its configured prefix lengths; a bucket at its cap
//! refuses further attachments without counting the refused client.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::config::ClassBlock;

#[derive(Debug)]
pub struct Class {
    pub name: String,
    /// Flat cap on attached clients; negative marks the class doomed.
    pub max_total: AtomicI64,
    pub max_local_per_ip: u32,
    pub max_global_per_ip: u32,
    pub max_ident_per_ip: u32,
    pub sendq: usize,
    pub ping_frequency: u64,
    pub connect_frequency: u64,
    pub cidr_ipv4_bitlen: u8,
    pub cidr_ipv6_bitlen: u8,
    pub number_per_cidr: u32,
    /// Currently attached clients.
    current: AtomicI64,
    /// Per-bucket attachment counts.
    cidr: Mutex<HashMap<IpNet, u32>>,
}

impl Class {
    pub fn from_block(block: &ClassBlock) -> Class {
        Class {
            name: block.name.clone(),
            max_total: AtomicI64::new(block.max_total),
            max_local_per_ip: block.max_local_per_ip,
            max_global_per_ip: block.max_global_per_ip,
            max_ident_per_ip: block.max_ident_per_ip,
            sendq: block.sendq,
            ping_frequency: block.ping_frequency,
            connect_frequency: block.connect_frequency,
            cidr_ipv4_bitlen: block.cidr_ipv4_bitlen,
            cidr_ipv6_bitlen: block.cidr_ipv6_bitlen,
            number_per_cidr: block.number_per_cidr,
            current: AtomicI64::new(0),
            cidr: Mutex::new(HashMap::new()),
        }
    }

    /// The defaults used when no class block matches.
    pub fn builtin_default() -> Class {
        Class::from_block(&ClassBlock {
            name: "default".into(),
            max_total: 400,
            max_local_per_ip: 3,
            max_global_per_ip: 3,
            max_ident_per_ip: 3,
            sendq: crate::config::defaults::sendq(),
            ping_frequency: crate::config::defaults::ping_frequency(),
            connect_frequency: crate::config::defaults::connect_frequency(),
            cidr_ipv4_bitlen: 32,
            cidr_ipv6_bitlen: 64,
            number_per_cidr: 0,
        })
    }

    /// The CIDR bucket an address falls in, at this class's lengths.
    /// Exactly one bucket covers any address.
    fn bucket(&self, ip: IpAddr) -> Option<IpNet> {
        match ip {
            IpAddr::V4(v4) => Ipv4Net::new(v4, self.cidr_ipv4_bitlen)
                .ok()
                .map(|n| IpNet::V4(n.trunc())),
            IpAddr::V6(v6) => Ipv6Net::new(v6, self.cidr_ipv6_bitlen)
                .ok()
                .map(|n| IpNet::V6(n.trunc())),
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        let max = self.max_total.load(Ordering::Relaxed);
        max >= 0 && self.current() >= max
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.max_total.load(Ordering::Relaxed) < 0
    }

    /// Attach a client's IP to its bucket. Refuses — without counting
    /// the refused client — when the bucket is at the per-CIDR cap.
    pub fn try_add_ip(&self, ip: IpAddr) -> bool {
        if self.number_per_cidr == 0 {
            self.current.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        let Some(bucket) = self.bucket(ip) else {
            return false;
        };
        let mut cidr = self.cidr.lock();
        let count = cidr.entry(bucket).or_insert(0);
        if *count >= self.number_per_cidr {
            return false;
        }
        *count += 1;
        self.current.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Attach past the bucket cap, for limit-exempt clients. The
    /// count still moves so the later detach balances.
    pub fn add_ip_unchecked(&self, ip: IpAddr) {
        self.current.fetch_add(1, Ordering::Relaxed);
        if self.number_per_cidr == 0 {
            return;
        }
        if let Some(bucket) = self.bucket(ip) {
            *self.cidr.lock().entry(bucket).or_insert(0) += 1;
        }
    }

    /// Detach a client's IP; the bucket node disappears at zero.
    pub fn remove_ip(&self, ip: IpAddr) {
        self.current.fetch_sub(1, Ordering::Relaxed);
        if self.number_per_cidr == 0 {
            return;
        }
        let Some(bucket) = self.bucket(ip) else { return };
        let mut cidr = self.cidr.lock();
        if let Some(count) = cidr.get_mut(&bucket) {
            *count -= 1;
            if *count == 0 {
                cidr.remove(&bucket);
            }
        }
    }

    /// Attached count within the bucket covering `ip`.
    pub fn cidr_count(&self, ip: IpAddr) -> u32 {
        self.bucket(ip)
            .and_then(|b| self.cidr.lock().get(&b).copied())
            .unwrap_or(0)
    }

    pub fn cidr_buckets(&self) -> usize {
        self.cidr.lock().len()
    }
}

/// All live classes, by name.
pub struct ClassRegistry {
    classes: RwLock<HashMap<String, Arc<Class>>>,
    default: Arc<Class>,
}

impl Default for ClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRegistry {
    pub fn new() -> ClassRegistry {
        ClassRegistry {
            classes: RwLock::new(HashMap::new()),
            default: Arc::new(Class::builtin_default()),
        }
    }

    pub fn rebuild(&self, blocks: &[ClassBlock]) {
        let mut classes = self.classes.write();
        // Doom classes that disappeared from the config; they survive
        // until their last member detaches.
        for (name, class) in classes.iter() {
            if !blocks.iter().any(|b| &b.name == name) {
                class.max_total.store(-1, Ordering::Relaxed);
            }
        }
        for block in blocks {
            match classes.get(&block.name) {
                Some(existing) => {
                    existing.max_total.store(block.max_total, Ordering::Relaxed);
                }
                None => {
                    classes.insert(block.name.clone(), Arc::new(Class::from_block(block)));
                }
            }
        }
        classes.retain(|_, c| !(c.marked_for_deletion() && c.current() == 0));
    }

    /// Find a class, falling back to the built-in default.
    pub fn find(&self, name: &str) -> Arc<Class> {
        self.classes
            .read()
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    /// Drop doomed classes whose last member has detached.
    pub fn sweep(&self) {
        self.classes
            .write()
            .retain(|_, c| !(c.marked_for_deletion() && c.current() == 0));
    }
}
