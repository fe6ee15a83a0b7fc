//! Reject, throttle and global-CIDR gates, plus the delayed-exit
//! queue.
//!
//! Three independent prefix maps over client addresses. The throttle
//! gate rate-limits raw accepts per IP; the global-CIDR gate caps
//! live connections per configured prefix; the reject cache
//! short-circuits IPs that keep coming back after being refused, and
//! sockets it refuses are parked on the delayed-exit queue so the
//! close lands no sooner than the configured floor.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

/// Truncate an address to a prefix key.
fn prefix_key(ip: IpAddr, v4_bits: u8, v6_bits: u8) -> Option<IpNet> {
    match ip {
        IpAddr::V4(v4) => Ipv4Net::new(v4, v4_bits).ok().map(|n| IpNet::V4(n.trunc())),
        IpAddr::V6(v6) => Ipv6Net::new(v6, v6_bits).ok().map(|n| IpNet::V6(n.trunc())),
    }
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    last_time: i64,
    count: u32,
}

/// Per-host refusal memory: after `after_count` refusals inside the
/// TTL, the gate itself refuses.
#[derive(Debug)]
pub struct RejectCache {
    entries: Mutex<HashMap<IpNet, Seen>>,
    pub after_count: u32,
    pub duration: i64,
}

impl RejectCache {
    pub fn new(after_count: u32, duration: i64) -> RejectCache {
        RejectCache {
            entries: Mutex::new(HashMap::new()),
            after_count,
            duration,
        }
    }

    fn key(ip: IpAddr) -> Option<IpNet> {
        prefix_key(ip, 32, 128)
    }

    /// Charge one refusal against `ip`, sliding the TTL.
    pub fn note_refused(&self, ip: IpAddr, now: i64) {
        let Some(key) = Self::key(ip) else { return };
        let mut entries = self.entries.lock();
        let seen = entries.entry(key).or_insert(Seen {
            last_time: now,
            count: 0,
        });
        seen.count += 1;
        seen.last_time = now;
    }

    /// Should this IP be short-circuited without running the full
    /// pre-registration machinery?
    pub fn is_rejected(&self, ip: IpAddr, now: i64) -> bool {
        let Some(key) = Self::key(ip) else { return false };
        let mut entries = self.entries.lock();
        match entries.get_mut(&key) {
            Some(seen) if now - seen.last_time <= self.duration => {
                if seen.count >= self.after_count {
                    seen.last_time = now;
                    true
                } else {
                    false
                }
            }
            Some(_) => {
                entries.remove(&key);
                false
            }
            None => false,
        }
    }

    /// Forget an IP, used when a ban covering it is removed.
    pub fn flush_ip(&self, ip: IpAddr) {
        if let Some(key) = Self::key(ip) {
            self.entries.lock().remove(&key);
        }
    }

    /// Drop entries whose TTL lapsed. Returns how many.
    pub fn expire(&self, now: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| now - seen.last_time <= self.duration);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw accept-rate limiting per IP.
#[derive(Debug)]
pub struct ThrottleCache {
    entries: Mutex<HashMap<IpNet, Seen>>,
    pub count: u32,
    pub duration: i64,
}

impl ThrottleCache {
    pub fn new(count: u32, duration: i64) -> ThrottleCache {
        ThrottleCache {
            entries: Mutex::new(HashMap::new()),
            count,
            duration,
        }
    }

    /// Note an accept from `ip`; false when over the rate.
    pub fn check(&self, ip: IpAddr, now: i64) -> bool {
        let Some(key) = prefix_key(ip, 32, 128) else {
            return true;
        };
        let mut entries = self.entries.lock();
        let seen = entries.entry(key).or_insert(Seen {
            last_time: now,
            count: 0,
        });
        if now - seen.last_time > self.duration {
            seen.count = 0;
        }
        seen.last_time = now;
        seen.count += 1;
        seen.count <= self.count
    }

    pub fn expire(&self, now: i64) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, seen| now - seen.last_time <= self.duration);
        before - entries.len()
    }
}

/// Live-connection counts per configured global CIDR prefix.
#[derive(Debug)]
pub struct GlobalCidrCount {
    entries: Mutex<HashMap<IpNet, u32>>,
    pub enabled: bool,
    pub v4_bits: u8,
    pub v6_bits: u8,
    pub v4_max: u32,
    pub v6_max: u32,
}

impl GlobalCidrCount {
    pub fn new(enabled: bool, v4_bits: u8, v6_bits: u8, v4_max: u32, v6_max: u32) -> GlobalCidrCount {
        GlobalCidrCount {
            entries: Mutex::new(HashMap::new()),
            enabled,
            v4_bits,
            v6_bits,
            v4_max,
            v6_max,
        }
    }

    /// Count a connection in; false when its bucket is at cap.
    pub fn try_add(&self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(key) = prefix_key(ip, self.v4_bits, self.v6_bits) else {
            return false;
        };
        let cap = if ip.is_ipv4() { self.v4_max } else { self.v6_max };
        let mut entries = self.entries.lock();
        let count = entries.entry(key).or_insert(0);
        if *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    pub fn remove(&self, ip: IpAddr) {
        if !self.enabled {
            return;
        }
        let Some(key) = prefix_key(ip, self.v4_bits, self.v6_bits) else {
            return;
        };
        let mut entries = self.entries.lock();
        if let Some(count) = entries.get_mut(&key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                entries.remove(&key);
            }
        }
    }

    pub fn count(&self, ip: IpAddr) -> u32 {
        prefix_key(ip, self.v4_bits, self.v6_bits)
            .and_then(|k| self.entries.lock().get(&k).copied())
            .unwrap_or(0)
    }
}

/// Sockets whose close has been postponed to slow attackers down.
/// Dropping a drained entry closes it.
#[derive(Debug)]
pub struct DelayedExitQueue<T> {
    entries: Mutex<Vec<(i64, T)>>,
}

impl<T> Default for DelayedExitQueue<T> {
    fn default() -> Self {
        DelayedExitQueue {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> DelayedExitQueue<T> {
    pub fn new() -> DelayedExitQueue<T> {
        DelayedExitQueue::default()
    }

    /// Park a refused socket until at least `release_at`.
    pub fn push(&self, socket: T, release_at: i64) {
        self.entries.lock().push((release_at, socket));
    }

    /// Pop every socket whose floor has passed; the caller closes
    /// them.
    pub fn drain_due(&self, now: i64) -> Vec<T> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        let mut keep = Vec::new();
        for (release_at, socket) in entries.drain(..) {
            if release_at <= now {
                due.push(socket);
            } else {
                keep.push((release_at, socket));
            }
        }
        *entries = keep;
        due
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_cache_trips_after_count() {
        let cache = RejectCache::new(3, 120);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert!(!cache.is_rejected(ip, 10));
        cache.note_refused(ip, 10);
        cache.note_refused(ip, 11);
        assert!(!cache.is_rejected(ip, 12));
        cache.note_refused(ip, 12);
        assert!(cache.is_rejected(ip, 13));
    }

    #[test]
    fn reject_cache_ttl_slides_and_expires() {
        let cache = RejectCache::new(1, 120);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        cache.note_refused(ip, 0);
        // A rejected probe refreshes the TTL.
        assert!(cache.is_rejected(ip, 100));
        assert!(cache.is_rejected(ip, 210));
        // Silence past the TTL clears it.
        assert!(!cache.is_rejected(ip, 400));
        cache.note_refused(ip, 500);
        assert_eq!(cache.expire(700), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn throttle_limits_accept_rate_per_ip() {
        let throttle = ThrottleCache::new(2, 60);
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert!(throttle.check(ip, 0));
        assert!(throttle.check(ip, 1));
        assert!(!throttle.check(ip, 2));
        // Another IP is unaffected.
        assert!(throttle.check("198.51.100.1".parse().unwrap(), 2));
        // The window lapsing resets the count.
        assert!(throttle.check(ip, 100));
    }

    #[test]
    fn global_cidr_caps_per_bucket() {
        let counts = GlobalCidrCount::new(true, 24, 64, 2, 2);
        assert!(counts.try_add("192.0.2.1".parse().unwrap()));
        assert!(counts.try_add("192.0.2.2".parse().unwrap()));
        assert!(!counts.try_add("192.0.2.3".parse().unwrap()));
        counts.remove("192.0.2.1".parse().unwrap());
        assert!(counts.try_add("192.0.2.3".parse().unwrap()));
        assert_eq!(counts.count("192.0.2.9".parse().unwrap()), 2);
    }

    #[test]
    fn disabled_global_cidr_always_passes() {
        let counts = GlobalCidrCount::new(false, 24, 64, 0, 0);
        for i in 0..10 {
            assert!(counts.try_add(format!("192.0.2.{i}").parse().unwrap()));
        }
    }

    #[test]
    fn delayed_exits_release_only_after_floor() {
        let queue: DelayedExitQueue<u32> = DelayedExitQueue::new();
        queue.push(7, 10);
        queue.push(9, 30);
        assert!(queue.drain_due(9).is_empty());
        assert_eq!(queue.drain_due(10), vec![7]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.drain_due(30), vec![9]);
        assert!(queue.is_empty());
    }
}
