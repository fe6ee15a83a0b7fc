//! Temporary and propagated ban lifecycle.
//!
//! Temp bans are bucketed by remaining lifetime into four tiers swept
//! at matching cadences: the minute sweep expires, the longer sweeps
//! demote entries whose remaining time has dropped into a shorter
//! tier. Propagated bans live on their own list: `hold` deactivates
//! them but the record keeps its (kind, user, host) identity until
//! `lifetime` so replays from peers are recognized.

use parking_lot::Mutex;
use std::sync::Arc;

use ferric_proto::irc_eq;
use tracing::debug;

use super::{conf_flags, ConfItem, ConfKind};

/// Temp-ban tier, by remaining lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Min,
    Hour,
    Day,
    Week,
}

impl Tier {
    /// Bucket a duration (seconds) into its tier.
    pub fn for_duration(secs: i64) -> Tier {
        if secs < 3600 {
            Tier::Min
        } else if secs < 86400 {
            Tier::Hour
        } else if secs < 604800 {
            Tier::Day
        } else {
            Tier::Week
        }
    }

    fn index(self) -> usize {
        match self {
            Tier::Min => 0,
            Tier::Hour => 1,
            Tier::Day => 2,
            Tier::Week => 3,
        }
    }

    fn shorter(self) -> Option<Tier> {
        match self {
            Tier::Min => None,
            Tier::Hour => Some(Tier::Min),
            Tier::Day => Some(Tier::Hour),
            Tier::Week => Some(Tier::Day),
        }
    }
}

#[derive(Debug, Default)]
struct TierSet {
    tiers: [Vec<Arc<ConfItem>>; 4],
}

impl TierSet {
    fn add(&mut self, conf: Arc<ConfItem>, now: i64) {
        let tier = Tier::for_duration(conf.hold() - now);
        self.tiers[tier.index()].push(conf);
    }

    /// Remove entries from `tier` whose hold has passed.
    fn expire(&mut self, tier: Tier, now: i64) -> Vec<Arc<ConfItem>> {
        let list = &mut self.tiers[tier.index()];
        let mut expired = Vec::new();
        list.retain(|conf| {
            if conf.hold() <= now {
                expired.push(conf.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    /// Demote entries whose remaining lifetime fits a shorter tier.
    fn rebucket(&mut self, tier: Tier, now: i64) {
        let Some(_) = tier.shorter() else { return };
        let list = &mut self.tiers[tier.index()];
        let mut demoted = Vec::new();
        list.retain(|conf| {
            let target = Tier::for_duration(conf.hold() - now);
            if target != tier {
                demoted.push(conf.clone());
                false
            } else {
                true
            }
        });
        for conf in demoted {
            let target = Tier::for_duration(conf.hold() - now);
            self.tiers[target.index()].push(conf);
        }
    }

    fn remove(&mut self, conf: &Arc<ConfItem>) {
        for list in &mut self.tiers {
            list.retain(|c| !Arc::ptr_eq(c, conf));
        }
    }

    fn len(&self) -> usize {
        self.tiers.iter().map(Vec::len).sum()
    }
}

/// Owns temp-ban tiers per category and the propagated-ban list.
#[derive(Debug, Default)]
pub struct BanStore {
    temp_klines: Mutex<TierSet>,
    temp_dlines: Mutex<TierSet>,
    /// Temp X-lines and reservations, minute-swept as one list.
    temp_other: Mutex<Vec<Arc<ConfItem>>>,
    prop_bans: Mutex<Vec<Arc<ConfItem>>>,
}

impl BanStore {
    pub fn new() -> BanStore {
        BanStore::default()
    }

    // ------------------------------------------------------------------
    // Temporary bans
    // ------------------------------------------------------------------

    /// Install a temp ban; the caller has set `hold` and the
    /// TEMPORARY flag and indexed it in the matcher.
    pub fn add_temp(&self, conf: Arc<ConfItem>, now: i64) {
        match conf.kind {
            ConfKind::Kline => self.temp_klines.lock().add(conf, now),
            ConfKind::Dline | ConfKind::ExemptDline => self.temp_dlines.lock().add(conf, now),
            _ => self.temp_other.lock().push(conf),
        }
    }

    /// Remove a temp ban ahead of its expiry (unkline and friends).
    pub fn remove_temp(&self, conf: &Arc<ConfItem>) {
        self.temp_klines.lock().remove(conf);
        self.temp_dlines.lock().remove(conf);
        self.temp_other.lock().retain(|c| !Arc::ptr_eq(c, conf));
    }

    /// Expire the MIN tier plus the X/resv list. Returns the expired
    /// records so the caller can unindex them.
    pub fn expire_minute(&self, now: i64) -> Vec<Arc<ConfItem>> {
        let mut expired = self.temp_klines.lock().expire(Tier::Min, now);
        expired.extend(self.temp_dlines.lock().expire(Tier::Min, now));
        self.temp_other.lock().retain(|conf| {
            if conf.hold() <= now {
                expired.push(conf.clone());
                false
            } else {
                true
            }
        });
        if !expired.is_empty() {
            debug!(count = expired.len(), "temporary bans expired");
        }
        expired
    }

    /// Re-bucket one of the longer tiers into shorter ones.
    pub fn rebucket(&self, tier: Tier, now: i64) {
        self.temp_klines.lock().rebucket(tier, now);
        self.temp_dlines.lock().rebucket(tier, now);
    }

    pub fn temp_count(&self) -> usize {
        self.temp_klines.lock().len() + self.temp_dlines.lock().len() + self.temp_other.lock().len()
    }

    /// Which tier a temp k-line currently sits in, for inspection.
    pub fn kline_tier(&self, conf: &Arc<ConfItem>) -> Option<Tier> {
        let set = self.temp_klines.lock();
        for (i, list) in set.tiers.iter().enumerate() {
            if list.iter().any(|c| Arc::ptr_eq(c, conf)) {
                return Some(match i {
                    0 => Tier::Min,
                    1 => Tier::Hour,
                    2 => Tier::Day,
                    _ => Tier::Week,
                });
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Propagated bans
    // ------------------------------------------------------------------

    /// Find a propagated ban by identity, active or deactivated.
    pub fn find_prop(&self, kind: ConfKind, user: &str, host: &str) -> Option<Arc<ConfItem>> {
        self.prop_bans
            .lock()
            .iter()
            .find(|c| c.kind == kind && irc_eq(&c.user, user) && irc_eq(&c.host, host))
            .cloned()
    }

    /// Install a propagated ban, superseding any record with the same
    /// identity. Returns the record actually stored, with its
    /// timestamps adjusted per the replace-old rule, and the record it
    /// displaced (already unindexed from this list).
    pub fn upsert_prop(&self, conf: ConfItem) -> (Arc<ConfItem>, Option<Arc<ConfItem>>) {
        use std::sync::atomic::Ordering;

        let mut list = self.prop_bans.lock();
        let old = list
            .iter()
            .position(|c| {
                c.kind == conf.kind && irc_eq(&c.user, conf.user.as_str()) && irc_eq(&c.host, conf.host.as_str())
            })
            .map(|i| list.remove(i));

        let mut conf = conf;
        conf.set_flag(conf_flags::PROPAGATED);
        if let Some(old) = &old {
            // The new record adopts the longer lifetime and a creation
            // time strictly after the old one, so every server orders
            // the two identically.
            let lifetime = conf.lifetime().max(old.lifetime());
            conf.lifetime.store(lifetime, Ordering::Relaxed);
            if conf.created <= old.created {
                conf.created = old.created + 1;
            }
            old.mark_illegal();
        }
        if conf.hold() <= conf.created {
            conf.hold.store(conf.created + 1, Ordering::Relaxed);
        }
        if conf.lifetime() < conf.hold() {
            conf.lifetime.store(conf.hold(), Ordering::Relaxed);
        }

        let stored = Arc::new(conf);
        list.push(stored.clone());
        (stored, old)
    }

    /// The per-minute propagated sweep: drop records past `lifetime`,
    /// deactivate (but keep) records past `hold`. Returns
    /// (dropped, newly deactivated).
    pub fn expire_prop(&self, now: i64) -> (Vec<Arc<ConfItem>>, Vec<Arc<ConfItem>>) {
        let mut list = self.prop_bans.lock();
        let mut dropped = Vec::new();
        let mut deactivated = Vec::new();
        list.retain(|conf| {
            if conf.lifetime() <= now {
                dropped.push(conf.clone());
                return false;
            }
            if conf.hold() <= now && !conf.is_illegal() {
                conf.mark_illegal();
                deactivated.push(conf.clone());
            }
            true
        });
        (dropped, deactivated)
    }

    /// Active propagated bans, for burst.
    pub fn prop_snapshot(&self, now: i64) -> Vec<Arc<ConfItem>> {
        self.prop_bans
            .lock()
            .iter()
            .filter(|c| c.lifetime() > now)
            .cloned()
            .collect()
    }

    pub fn prop_count(&self) -> usize {
        self.prop_bans.lock().len()
    }
}
