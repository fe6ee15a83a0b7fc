//! Periodic maintenance.
//!
//! Every recurring job the daemon runs, at its cadence:
//!
//! | every | job |
//! |-------|-----|
//! | 1 s   | drain the abort list; apply latched signal requests |
//! | 3 s   | queued ban scan over local clients |
//! | 4 s   | free exited clients |
//! | 10 s  | expire throttle entries; flush the delayed-exit queue |
//! | 30 s  | ping scan and unknown-connection timeout |
//! | 60 s  | tier-MIN temp bans, propagated bans, temp X/resv expiry |
//! | 300 s | reseed the cookie RNG |
//! | 1 h / 1 d / 1 w | demote longer temp-ban tiers |
//! | outbound connect cadence | dial the next due peer |

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use ferric_proto::{Command, Message};

use crate::bans::{conf_flags, ConfKind, Tier};
use crate::config::Config;
use crate::state::client::{flags, Status};
use crate::state::{Nexus, Registry};
use crate::sync::manager::LinkScheduler;
use crate::sync::split::exit_client;

/// Interval between outbound connect attempts being considered.
const CONNECT_POLL_SECS: u64 = 60;

/// Spawn every periodic task. Each one winds down on the shutdown
/// broadcast.
pub fn spawn_all(nexus: Arc<Nexus>, scheduler: Arc<LinkScheduler>, config_path: String) {
    spawn_interval(nexus.clone(), 1, move |nexus| {
        drain_abort_list(nexus);
        apply_pending_flags(nexus, &config_path);
    });
    spawn_interval(nexus.clone(), 3, |nexus| {
        if nexus.pending.kline_scan.swap(false, Ordering::Relaxed) {
            ban_scan(nexus);
        }
    });
    spawn_interval(nexus.clone(), 4, |nexus| {
        let freed = nexus.registry.reap_dead();
        if freed > 0 {
            tracing::debug!(freed, "dead clients reaped");
        }
    });
    spawn_interval(nexus.clone(), 10, |nexus| {
        let now = nexus.now();
        nexus.throttle.expire(now);
        nexus.reject.expire(now);
        // Dropping the sockets closes them.
        let released = nexus.delayed_exits.drain_due(now);
        if !released.is_empty() {
            tracing::debug!(count = released.len(), "delayed exits flushed");
        }
    });
    spawn_interval(nexus.clone(), 30, |nexus| {
        ping_scan(nexus);
        unknown_scan(nexus);
    });
    spawn_interval(nexus.clone(), 60, |nexus| {
        expire_bans(nexus);
    });
    spawn_interval(nexus.clone(), 300, |nexus| {
        nexus.reseed_rng();
    });
    spawn_interval(nexus.clone(), 3600, |nexus| {
        nexus.bans.rebucket(Tier::Hour, nexus.now());
    });
    spawn_interval(nexus.clone(), 86400, |nexus| {
        nexus.bans.rebucket(Tier::Day, nexus.now());
    });
    spawn_interval(nexus.clone(), 604800, |nexus| {
        nexus.bans.rebucket(Tier::Week, nexus.now());
    });

    // Outbound server connections.
    tokio::spawn(async move {
        let mut shutdown_rx = nexus.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(CONNECT_POLL_SECS));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(block) = scheduler.next_due(&nexus, nexus.now()) {
                        let nexus = nexus.clone();
                        tokio::spawn(async move {
                            crate::sync::manager::outbound_task(nexus, block).await;
                        });
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

fn spawn_interval<F>(nexus: Arc<Nexus>, secs: u64, job: F)
where
    F: Fn(&Nexus) + Send + 'static,
{
    tokio::spawn(async move {
        let mut shutdown_rx = nexus.shutdown_tx.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so jobs run at
        // their cadence, not at boot.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => job(&nexus),
                _ = shutdown_rx.recv() => break,
            }
        }
    });
}

/// Exit everything the split-from-write path parked.
pub fn drain_abort_list(nexus: &Nexus) {
    let aborted: Vec<_> = nexus.registry.abort.lock().drain(..).collect();
    for (client, reason) in aborted {
        if client.status() != Status::Dead {
            exit_client(nexus, &client, None, &reason);
        }
    }
}

/// Apply the signal latches: rehash, MOTD reread, ban reread.
fn apply_pending_flags(nexus: &Nexus, config_path: &str) {
    if nexus.pending.rehash.swap(false, Ordering::Relaxed) {
        info!(path = config_path, "rehashing");
        match Config::load(config_path) {
            Ok(config) => match crate::config::validation::validate(&config) {
                Ok(()) => {
                    nexus.rehash(config);
                    info!("rehash complete");
                }
                Err(errors) => {
                    for e in &errors {
                        error!(error = %e, "rehash validation failed; old config retained");
                    }
                }
            },
            Err(e) => error!(error = %e, "rehash parse failed; old config retained"),
        }
    }
    if nexus.pending.reread_motd.swap(false, Ordering::Relaxed) {
        // The MOTD cache lives with an external collaborator; the
        // latch only acknowledges the request.
        info!("motd reread requested");
    }
    if nexus.pending.reread_bans.swap(false, Ordering::Relaxed) {
        info!("ban reread requested");
        nexus.matcher.clear(crate::hostmask::ClearMode::BanReread);
        nexus.pending.kline_scan.store(true, Ordering::Relaxed);
    }
}

/// Walk local clients against the current K-line and X-line tables;
/// anyone now matching is exited.
pub fn ban_scan(nexus: &Nexus) {
    let mut exited = 0usize;
    for client in Registry::snapshot(&nexus.registry.lclients) {
        if client.status() != Status::Client {
            continue;
        }
        let shielded = client
            .local
            .as_ref()
            .and_then(|l| l.att_conf.lock().clone())
            .is_some_and(|conf| conf.has_flag(conf_flags::EXEMPT_KLINE));
        if shielded {
            continue;
        }
        let (host, sockhost, orig_host, ip, username, realname) = {
            let info = client.info.read();
            (
                info.host.clone(),
                info.sockhost.clone(),
                info.orig_host.clone(),
                info.ip,
                info.username.clone(),
                info.realname.clone(),
            )
        };
        let kline = nexus.matcher.find(
            Some(&orig_host),
            Some(&sockhost),
            Some(&host),
            ip,
            ConfKind::Kline,
            Some(&username),
            None,
            false,
        );
        if kline.is_some() {
            exit_client(nexus, &client, None, "K-Lined");
            exited += 1;
            continue;
        }
        if nexus
            .matcher
            .find(Some(&realname), None, None, None, ConfKind::Xline, None, None, true)
            .is_some()
        {
            exit_client(nexus, &client, None, "X-Lined");
            exited += 1;
        }
    }
    if exited > 0 {
        warn!(exited, "ban scan removed clients");
    }
}

/// PING probing and timeout over local connections.
pub fn ping_scan(nexus: &Nexus) {
    let now = nexus.now();
    let mut lists = Registry::snapshot(&nexus.registry.lclients);
    lists.extend(Registry::snapshot(&nexus.registry.servers));

    for client in lists {
        let Some(local) = &client.local else { continue };
        let ping_freq = local
            .att_class
            .lock()
            .as_ref()
            .map(|c| c.ping_frequency)
            .unwrap_or(crate::config::defaults::ping_frequency()) as i64;
        let last = local.last_time.load(Ordering::Relaxed);
        if now - last < ping_freq {
            continue;
        }

        let ping_sent = client.info.read().has_flag(flags::PING_SENT);
        if !ping_sent {
            client.info.write().set_flag(flags::PING_SENT);
            // Backdate so the timeout window starts at this probe.
            local.last_time.store(now - ping_freq, Ordering::Relaxed);
            client.send(Message::new(Command::Ping {
                token: nexus.me.name.clone(),
                target: None,
            }));
        } else if now - last >= 2 * ping_freq {
            let reason = format!("Ping timeout: {} seconds", now - last);
            exit_client(nexus, &client, None, &reason);
        }
    }
}

/// Connections still unregistered past the grace window are dropped.
pub fn unknown_scan(nexus: &Nexus) {
    let now = nexus.now();
    let connect_timeout = nexus.config().general.connect_timeout as i64;
    for client in Registry::snapshot(&nexus.registry.unknowns) {
        let Some(local) = &client.local else { continue };
        let grace = match client.status() {
            Status::Connecting | Status::Handshake => connect_timeout,
            _ => 30,
        };
        if now - local.first_time >= grace {
            exit_client(nexus, &client, None, "Connection timed out");
        }
    }
}

/// The per-minute ban sweeps: MIN-tier temps, X/resv temps, and the
/// propagated list's expire/deactivate pass.
pub fn expire_bans(nexus: &Nexus) {
    let now = nexus.now();
    for conf in nexus.bans.expire_minute(now) {
        nexus.matcher.delete(&conf.host.clone(), &conf);
        info!(mask = %conf.user_at_host(), "temporary ban expired");
    }
    let (dropped, deactivated) = nexus.bans.expire_prop(now);
    for conf in deactivated {
        nexus.matcher.delete(&conf.host.clone(), &conf);
        info!(mask = %conf.user_at_host(), "propagated ban deactivated");
    }
    for conf in dropped {
        nexus.matcher.delete(&conf.host.clone(), &conf);
    }
}
