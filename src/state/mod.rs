//! Daemon state.
//!
//! `Nexus` is the single runtime context: every hash, list, cache and
//! counter lives here, and every component takes `&Nexus` (or a
//! clone of the `Arc`) rather than reaching for globals. Tests stand
//! up as many independent daemons in one process as they like.

pub mod channel;
pub mod client;
pub mod connid;
pub mod nickdelay;
pub mod registry;
pub mod scache;
pub mod stats;
pub mod targets;
pub mod uid;

pub use client::{Client, ClientInfo, LocalClient, PreClient, ServerInfo, Status};
pub use registry::Registry;
pub use uid::UidGenerator;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::bans::{conf_flags, BanStore, ConfItem, ConfKind};
use crate::class::ClassRegistry;
use crate::config::Config;
use crate::hostmask::HostMatcher;
use crate::network::reject::{DelayedExitQueue, GlobalCidrCount, RejectCache, ThrottleCache};
use crate::sync::link::PeerMap;

/// This server's own identity, fixed at boot.
#[derive(Debug, Clone)]
pub struct MeInfo {
    pub name: String,
    pub sid: String,
    pub info: String,
    pub network: String,
}

/// Latched signal requests, applied by the 1-second sweep.
#[derive(Debug, Default)]
pub struct PendingFlags {
    pub rehash: AtomicBool,
    pub reread_motd: AtomicBool,
    pub reread_bans: AtomicBool,
    /// A ban changed; the next K-line scan walks local clients.
    pub kline_scan: AtomicBool,
}

/// The daemon's entire state.
pub struct Nexus {
    pub config: RwLock<Arc<Config>>,
    pub me: MeInfo,
    pub registry: Registry,
    pub matcher: HostMatcher,
    pub bans: BanStore,
    pub classes: ClassRegistry,
    pub channels: channel::ChannelMap,
    pub scache: scache::ServerNameCache,
    pub nick_delay: nickdelay::NickDelay,
    pub reject: RejectCache,
    pub throttle: ThrottleCache,
    pub global_cidr: GlobalCidrCount,
    pub delayed_exits: DelayedExitQueue<tokio::net::TcpStream>,
    pub stats: stats::ServerStats,
    pub uid_gen: UidGenerator,
    pub connids: connid::ConnidAllocator,
    pub peers: PeerMap,
    pub pending: PendingFlags,
    /// Cookie/nonce source, reseeded periodically.
    pub rng: Mutex<StdRng>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl Nexus {
    /// Build a daemon from a validated config and install its access
    /// rules.
    pub fn new(config: Config) -> Arc<Nexus> {
        let (shutdown_tx, _) = broadcast::channel(4);
        let general = &config.general;
        let nexus = Nexus {
            me: MeInfo {
                name: config.server.name.clone(),
                sid: config.server.sid.clone(),
                info: config.server.description.clone(),
                network: config.server.network.clone(),
            },
            registry: Registry::new(),
            matcher: HostMatcher::new(),
            bans: BanStore::new(),
            classes: ClassRegistry::new(),
            channels: channel::ChannelMap::new(),
            scache: scache::ServerNameCache::new(),
            nick_delay: nickdelay::NickDelay::new(),
            reject: RejectCache::new(general.reject_after_count, general.reject_duration as i64),
            throttle: ThrottleCache::new(general.throttle_count, general.throttle_duration as i64),
            global_cidr: GlobalCidrCount::new(
                general.global_cidr,
                general.global_cidr_ipv4_bitlen,
                general.global_cidr_ipv6_bitlen,
                general.global_cidr_ipv4_count,
                general.global_cidr_ipv6_count,
            ),
            delayed_exits: DelayedExitQueue::new(),
            stats: stats::ServerStats::new(),
            uid_gen: UidGenerator::new(&config.server.sid),
            connids: connid::ConnidAllocator::new(),
            peers: PeerMap::new(),
            pending: PendingFlags::default(),
            rng: Mutex::new(StdRng::from_entropy()),
            shutdown_tx,
            config: RwLock::new(Arc::new(config)),
        };
        let nexus = Arc::new(nexus);
        nexus.install_conf();
        nexus
    }

    /// Current unix time.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Index every config-sourced access rule into the matcher and
    /// rebuild the class table.
    fn install_conf(&self) {
        let config = self.config();
        self.classes.rebuild(&config.class);

        for block in &config.auth {
            for mask in &block.user {
                let (user, host) = crate::config::AuthBlock::split_mask(mask);
                let conf = ConfItem {
                    class_name: block.class.clone(),
                    auth_user: block.auth_user.clone(),
                    reason: block.password.clone().unwrap_or_default(),
                    info: match (&block.spoof, &block.redirect_host) {
                        (Some(spoof), _) => spoof.clone(),
                        (None, Some(redirect)) => redirect.clone(),
                        _ => String::new(),
                    },
                    port: block.redirect_port,
                    ..ConfItem::new(ConfKind::Auth, user, host, "")
                };
                let mut flags = conf_flags::FROM_CONFIG;
                if block.need_ident {
                    flags |= conf_flags::NEED_IDENT;
                }
                if block.no_tilde {
                    flags |= conf_flags::NO_TILDE;
                }
                if block.need_sasl {
                    flags |= conf_flags::NEED_SASL;
                }
                if block.need_tls {
                    flags |= conf_flags::NEED_TLS;
                }
                if block.exceed_limit {
                    flags |= conf_flags::EXEMPT_LIMITS;
                }
                if block.kline_exempt {
                    flags |= conf_flags::EXEMPT_KLINE;
                }
                if block.dnsbl_exempt {
                    flags |= conf_flags::EXEMPT_DNSBL;
                }
                if block.flood_exempt {
                    flags |= conf_flags::EXEMPT_FLOOD;
                }
                if block.encrypted {
                    flags |= conf_flags::ENCRYPTED;
                }
                if block.spoof.is_some() {
                    flags |= conf_flags::SPOOF;
                }
                if block.redirect_host.is_some() {
                    flags |= conf_flags::REDIRECT;
                }
                conf.flags.store(flags, Ordering::Relaxed);
                self.matcher
                    .add(host, ConfKind::Auth, Some(user), block.auth_user.as_deref(), Arc::new(conf));
            }
        }

        // Oper records are indexed so the (external) OPER surface can
        // match candidates by identity; the core only stores them.
        for block in &config.operator {
            for mask in &block.user {
                let (user, host) = crate::config::AuthBlock::split_mask(mask);
                let conf = ConfItem {
                    reason: block.password.clone(),
                    info: block.name.clone(),
                    ..ConfItem::new(ConfKind::Oper, user, host, "")
                };
                conf.set_flag(conf_flags::FROM_CONFIG);
                if block.encrypted {
                    conf.set_flag(conf_flags::ENCRYPTED);
                }
                self.matcher
                    .add(host, ConfKind::Oper, Some(user), None, Arc::new(conf));
            }
        }

        for block in &config.kline {
            let conf = ConfItem::new(ConfKind::Kline, &block.user, &block.host, &block.reason);
            conf.set_flag(conf_flags::FROM_CONFIG);
            self.matcher.add(
                &block.host,
                ConfKind::Kline,
                Some(&block.user),
                None,
                Arc::new(conf),
            );
        }
        for block in &config.dline {
            let kind = if block.exempt {
                ConfKind::ExemptDline
            } else {
                ConfKind::Dline
            };
            let conf = ConfItem::new(kind, "", &block.host, &block.reason);
            conf.set_flag(conf_flags::FROM_CONFIG);
            self.matcher.add(&block.host, kind, None, None, Arc::new(conf));
        }
        for block in &config.xline {
            let conf = ConfItem::new(ConfKind::Xline, "*", &block.mask, &block.reason);
            conf.set_flag(conf_flags::FROM_CONFIG);
            self.matcher
                .add(&block.mask, ConfKind::Xline, None, None, Arc::new(conf));
        }
        for block in &config.resv {
            let kind = if block.mask.starts_with('#') {
                ConfKind::ResvChannel
            } else {
                ConfKind::ResvNick
            };
            let conf = ConfItem::new(kind, "*", &block.mask, &block.reason);
            conf.set_flag(conf_flags::FROM_CONFIG);
            self.matcher.add(&block.mask, kind, None, None, Arc::new(conf));
        }
    }

    /// Apply a config reread: flush permanent auth entries, keep bans,
    /// reinstall from the new file.
    pub fn rehash(&self, config: Config) {
        *self.config.write() = Arc::new(config);
        self.matcher.clear(crate::hostmask::ClearMode::ConfigReread);
        self.install_conf();
    }

    /// Allocate the next UID, never reusing a live one.
    pub fn next_uid(&self) -> String {
        self.uid_gen.next(|candidate| self.registry.uid_in_use(candidate))
    }

    /// A fresh ping-cookie token.
    pub fn ping_cookie(&self) -> String {
        use rand::Rng;
        format!("{:08X}", self.rng.lock().gen::<u32>())
    }

    /// Reseed the cookie source from OS entropy.
    pub fn reseed_rng(&self) {
        *self.rng.lock() = StdRng::from_entropy();
    }

    /// Request shutdown; every task subscribed to the broadcast winds
    /// down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nexus() -> Arc<Nexus> {
        let config = Config::parse(
            r#"
            [server]
            name = "irc.example.net"
            sid = "42X"

            [[class]]
            name = "users"
            max_total = 100

            [[auth]]
            user = ["*@*"]
            class = "users"

            [[kline]]
            user = "bad"
            host = "badhost.example"
            reason = "spamming"

            [[dline]]
            host = "203.0.113.0/24"
            reason = "drones"

            [[dline]]
            host = "203.0.113.7"
            exempt = true
            "#,
        )
        .unwrap();
        Nexus::new(config)
    }

    #[test]
    fn conf_rules_are_indexed_at_boot() {
        let nexus = nexus();
        assert!(nexus
            .matcher
            .find(
                Some("anyhost.example"),
                None,
                None,
                None,
                ConfKind::Auth,
                Some("u"),
                None,
                false
            )
            .is_some());
        assert!(nexus
            .matcher
            .find(
                Some("badhost.example"),
                None,
                None,
                None,
                ConfKind::Kline,
                Some("bad"),
                None,
                false
            )
            .is_some());
    }

    #[test]
    fn exempt_dline_seed_wins_at_connect() {
        let nexus = nexus();
        let verdict =
            crate::hostmask::find_dline(&nexus.matcher, "203.0.113.7".parse().unwrap()).unwrap();
        assert_eq!(verdict.kind, ConfKind::ExemptDline);
        let verdict =
            crate::hostmask::find_dline(&nexus.matcher, "203.0.113.9".parse().unwrap()).unwrap();
        assert_eq!(verdict.kind, ConfKind::Dline);
    }

    #[test]
    fn next_uid_skips_live_ids() {
        let nexus = nexus();
        let first = nexus.next_uid();
        assert_eq!(first, "42XAAAAAA");
        // UIDs are only verified against the registry after a flip;
        // before that the odometer itself guarantees uniqueness.
        let second = nexus.next_uid();
        assert_ne!(first, second);
    }

    #[test]
    fn rehash_reinstalls_config_rules_and_keeps_runtime_bans() {
        let nexus = nexus();

        // A ban installed at runtime (from the mesh or an oper).
        let runtime = Arc::new(ConfItem::new(
            ConfKind::Kline,
            "worse",
            "runtime.example",
            "installed live",
        ));
        nexus
            .matcher
            .add("runtime.example", ConfKind::Kline, Some("worse"), None, runtime);

        let new_config = Config::parse(
            r#"
            [server]
            name = "irc.example.net"
            sid = "42X"

            [[auth]]
            user = ["staff@*"]
            "#,
        )
        .unwrap();
        nexus.rehash(new_config);

        // Old catch-all auth is gone; the new narrower one applies.
        assert!(nexus
            .matcher
            .find(Some("h.example"), None, None, None, ConfKind::Auth, Some("other"), None, false)
            .is_none());
        assert!(nexus
            .matcher
            .find(Some("h.example"), None, None, None, ConfKind::Auth, Some("staff"), None, false)
            .is_some());
        // The old config's K-line seed left with its file; the
        // runtime ban is untouched.
        assert!(nexus
            .matcher
            .find(Some("badhost.example"), None, None, None, ConfKind::Kline, Some("bad"), None, false)
            .is_none());
        assert!(nexus
            .matcher
            .find(Some("runtime.example"), None, None, None, ConfKind::Kline, Some("worse"), None, false)
            .is_some());
        // Rehashing twice does not duplicate entries.
        let count = nexus.matcher.len();
        nexus.pending.rehash.store(false, Ordering::Relaxed);
        nexus.rehash(nexus.config().as_ref().clone());
        assert_eq!(nexus.matcher.len(), count);
    }
}
