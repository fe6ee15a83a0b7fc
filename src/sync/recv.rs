//! Inbound mesh message handling.
//!
//! Runs for every line received on an established server link:
//! burst payloads (EUID/SJOIN/BMASK/TB/BAN), lifecycle (QUIT/SQUIT/
//! KILL), keepalive, and the ENCAP envelope. Receipt must tolerate
//! interleaving, since both sides may be mid-burst simultaneously.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ferric_proto::{BanAction, Command, Message};
use tracing::{debug, info, warn};

use crate::bans::{conf_flags, ConfItem, ConfKind};
use crate::error::LinkError;
use crate::state::channel::MaskList;
use crate::state::client::{flags, Client};
use crate::state::Nexus;
use crate::sync::caps::cap;
use crate::sync::handshake::HandshakeMachine;
use crate::sync::link::PeerLink;
use crate::sync::propagation::sendto_server;
use crate::sync::split::exit_client;

/// Process one message from an established link. `Err` is fatal to
/// the link; recoverable protocol noise is dropped and counted.
pub fn handle(nexus: &Nexus, peer: &Arc<PeerLink>, msg: Message) -> Result<(), LinkError> {
    let source = msg.source_name().map(str::to_string);
    match msg.command.clone() {
        Command::Euid {
            nick,
            hopcount,
            ts,
            umodes,
            username,
            hostname,
            ip,
            uid,
            orig_host,
            login,
            info,
        } => {
            let servptr = source.unwrap_or_else(|| peer.sid.clone());
            introduce_user(
                nexus, peer, &nick, hopcount, ts, &umodes, &username, &hostname, &ip, &uid,
                &orig_host, &login, &info,
            )?;
            relay_user_intro(nexus, peer, &servptr, &msg);
        }
        Command::Uid {
            nick,
            hopcount,
            ts,
            umodes,
            username,
            hostname,
            ip,
            uid,
            info,
        } => {
            let servptr = source.unwrap_or_else(|| peer.sid.clone());
            introduce_user(
                nexus, peer, &nick, hopcount, ts, &umodes, &username, &hostname, &ip, &uid, "*",
                "*", &info,
            )?;
            relay_user_intro(nexus, peer, &servptr, &msg);
        }
        Command::Sid {
            name,
            hopcount,
            sid,
            info,
        } => {
            HandshakeMachine::may_introduce(&peer.block, &name)?;
            if nexus.registry.find_server(&name).is_some() || nexus.registry.find_uid(&sid).is_some()
            {
                return Err(LinkError::AlreadyLinked(name));
            }
            let servptr = source.unwrap_or_else(|| peer.sid.clone());
            let client = Client::new_remote_server(
                &name,
                &sid,
                &info,
                hopcount,
                &peer.sid,
                &servptr,
                nexus.now(),
            );
            nexus.registry.add_remote_server(&client);
            nexus.scache.connect(&name, &info, false, nexus.now());
            sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
        }
        Command::Squit { server, reason } => {
            let Some(target) = nexus.registry.find_server(&server) else {
                debug!(server, "SQUIT for unknown server dropped");
                crate::state::stats::ServerStats::bump(&nexus.stats.unknown_commands);
                return Ok(());
            };
            warn!(server, reason, "remote SQUIT");
            exit_client(nexus, &target, Some(&peer.sid), &reason);
        }
        Command::Quit(reason) => {
            if let Some(source) = source {
                if let Some(client) = nexus.registry.find_any(&source) {
                    exit_client(
                        nexus,
                        &client,
                        Some(&peer.sid),
                        reason.as_deref().unwrap_or("Client Quit"),
                    );
                }
            }
        }
        Command::Kill { target, path } => {
            crate::state::stats::ServerStats::bump(&nexus.stats.kills);
            if let Some(client) = nexus.registry.find_any(&target) {
                {
                    let mut info = client.info.write();
                    info.set_flag(flags::KILLED);
                    if info.status.is_registered() {
                        info.status = crate::state::Status::Killed;
                    }
                }
                sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
                let reason = format!("Killed ({})", path);
                exit_client(nexus, &client, Some(&peer.sid), &reason);
            }
        }
        Command::Nick { nick, ts } => {
            if let Some(source) = source {
                if let Some(client) = nexus.registry.find_any(&source) {
                    handle_nick_change(nexus, peer, &client, &nick, ts)?;
                    sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
                }
            }
        }
        Command::Sjoin {
            ts,
            channel,
            modes,
            mode_args,
            members,
        } => {
            handle_sjoin(nexus, ts, &channel, &modes, &mode_args, &members);
            sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
        }
        Command::Bmask {
            ts,
            channel,
            list,
            masks,
        } => {
            handle_bmask(nexus, ts, &channel, list, &masks);
            sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
        }
        Command::Tb {
            channel,
            ts,
            setter,
            topic,
        } => {
            handle_tb(nexus, &channel, ts, setter.as_deref(), &topic);
            sendto_server(nexus, Some(&peer.sid), cap::TB, 0, &msg);
        }
        Command::Mlock { ts, channel, modes } => {
            if let Some(chan) = nexus.channels.get(&channel) {
                let mut chan = chan.write();
                if ts <= chan.ts {
                    chan.mlock = Some(modes);
                }
            }
            sendto_server(nexus, Some(&peer.sid), cap::MLOCK, 0, &msg);
        }
        Command::Ban {
            action,
            kind,
            user,
            host,
            created,
            duration,
            lifetime,
            oper,
            reason,
        } => {
            handle_ban(
                nexus, peer, action, kind, &user, &host, created, duration, lifetime, &oper,
                &reason,
            );
            sendto_server(nexus, Some(&peer.sid), cap::BAN, 0, &msg);
        }
        Command::Encap {
            target,
            subcommand,
            params,
        } => {
            apply_encap(nexus, source.as_deref(), &subcommand, &params);
            // Envelopes relay to every other capable peer matching
            // the target mask.
            if target == "*" {
                sendto_server(nexus, Some(&peer.sid), cap::ENCAP, 0, &msg);
            } else {
                crate::sync::propagation::sendto_match_servs(
                    nexus,
                    &target,
                    cap::ENCAP,
                    0,
                    &msg,
                );
            }
        }
        Command::Away(away) => {
            if let Some(source) = source {
                if let Some(client) = nexus.registry.find_any(&source) {
                    client.info.write().away = away;
                    sendto_server(nexus, Some(&peer.sid), 0, 0, &msg);
                }
            }
        }
        Command::Ping { token, .. } => {
            // End-of-burst probe or keepalive; echo the token back.
            peer.send(Message::from_server(
                &nexus.me.sid,
                Command::Pong {
                    source: nexus.me.name.clone(),
                    token: Some(token),
                },
            ));
            touch(peer, nexus.now());
        }
        Command::Pong { .. } => {
            if peer.bursting.swap(false, Ordering::Relaxed) {
                info!(peer = %peer.name, "end of burst received");
            }
            touch(peer, nexus.now());
        }
        Command::Error(reason) => {
            warn!(peer = %peer.name, reason, "ERROR from peer");
            return Err(LinkError::OutOfOrder("ERROR".into()));
        }
        Command::Privmsg { .. } | Command::Notice { .. } => {
            // Routed by the messaging surface, which is not part of
            // the mesh core; count and drop here.
            crate::state::stats::ServerStats::bump(&nexus.stats.messages_recv_server);
        }
        Command::Raw(verb, _) => {
            debug!(verb, "unknown mesh command passed over");
            crate::state::stats::ServerStats::bump(&nexus.stats.unknown_commands);
        }
        _ => {
            crate::state::stats::ServerStats::bump(&nexus.stats.unknown_commands);
        }
    }
    Ok(())
}

fn touch(peer: &PeerLink, now: i64) {
    if let Some(local) = &peer.client.local {
        local.touch(now);
    }
    peer.client.info.write().clear_flag(flags::PING_SENT);
}

/// Relay a user introduction onward, downgrading EUID for peers that
/// never negotiated it.
fn relay_user_intro(nexus: &Nexus, from: &Arc<PeerLink>, _servptr: &str, msg: &Message) {
    match &msg.command {
        Command::Euid { .. } => {
            sendto_server(nexus, Some(&from.sid), cap::EUID, 0, msg);
            // Legacy peers get the UID form.
            if let Command::Euid {
                nick,
                hopcount,
                ts,
                umodes,
                username,
                hostname,
                ip,
                uid,
                ..
            } = &msg.command
            {
                let legacy = Message {
                    prefix: msg.prefix.clone(),
                    command: Command::Uid {
                        nick: nick.clone(),
                        hopcount: *hopcount,
                        ts: *ts,
                        umodes: umodes.clone(),
                        username: username.clone(),
                        hostname: hostname.clone(),
                        ip: ip.clone(),
                        uid: uid.clone(),
                        info: match &msg.command {
                            Command::Euid { info, .. } => info.clone(),
                            _ => String::new(),
                        },
                    },
                };
                sendto_server(nexus, Some(&from.sid), 0, cap::EUID, &legacy);
            }
        }
        _ => sendto_server(nexus, Some(&from.sid), 0, 0, msg),
    }
}

/// Install a remote user, resolving nickname collisions by timestamp:
/// the older identity survives; on a tie both die.
#[allow(clippy::too_many_arguments)]
fn introduce_user(
    nexus: &Nexus,
    peer: &Arc<PeerLink>,
    nick: &str,
    hopcount: u32,
    ts: i64,
    umodes: &str,
    username: &str,
    hostname: &str,
    ip: &str,
    uid: &str,
    orig_host: &str,
    login: &str,
    realname: &str,
) -> Result<(), LinkError> {
    if nexus.registry.find_uid(uid).is_some() {
        return Err(LinkError::AlreadyLinked(format!("uid {uid}")));
    }

    if let Some(existing) = nexus.registry.find_nick(nick) {
        crate::state::stats::ServerStats::bump(&nexus.stats.collisions);
        let existing_ts = existing.info.read().tsinfo;
        let nd = nexus.config().general.nick_delay;
        if nd > 0 {
            nexus.nick_delay.add(nick, nexus.now() + nd as i64);
        }

        if ts == existing_ts {
            // Tie: both identities die.
            kill_collided(nexus, &existing, "Nick collision (both)");
            peer.send(Message::from_server(
                &nexus.me.sid,
                Command::Kill {
                    target: uid.to_string(),
                    path: format!("{} (Nick collision (both))", nexus.me.name),
                },
            ));
            return Ok(());
        }
        if ts < existing_ts {
            // Incoming is older: the local holder dies.
            kill_collided(nexus, &existing, "Nick collision (new)");
        } else {
            // Incoming is newer: bounce it back where it came from.
            peer.send(Message::from_server(
                &nexus.me.sid,
                Command::Kill {
                    target: uid.to_string(),
                    path: format!("{} (Nick collision (new))", nexus.me.name),
                },
            ));
            return Ok(());
        }
    }

    let servptr = &uid[..3.min(uid.len())];
    let client = Client::new_remote_user(
        nick, username, hostname, orig_host, ip, uid, realname, ts, hopcount, &peer.sid, servptr,
    );
    {
        let mut info = client.info.write();
        info.umodes = umodes.trim_start_matches('+').to_string();
        if login != "*" && !login.is_empty() {
            info.login = Some(login.to_string());
        }
        if orig_host != "*" && orig_host != hostname {
            info.orig_host = orig_host.to_string();
            info.set_flag(flags::DYN_SPOOF);
        }
    }
    nexus.registry.add_remote_user(&client);
    Ok(())
}

/// Kill the local side of a collision: notify the mesh, flag the
/// client so its exit skips the QUIT fanout to peers, and exit it.
fn kill_collided(nexus: &Nexus, client: &Arc<Client>, why: &str) {
    let target = client.use_id();
    {
        let mut info = client.info.write();
        info.set_flag(flags::KILLED);
        if info.status.is_registered() {
            info.status = crate::state::Status::Killed;
        }
    }
    sendto_server(
        nexus,
        None,
        0,
        0,
        &Message::from_server(
            &nexus.me.sid,
            Command::Kill {
                target,
                path: format!("{} ({})", nexus.me.name, why),
            },
        ),
    );
    let reason = format!("{} ({})", nexus.me.name, why);
    exit_client(nexus, client, None, &reason);
}

fn handle_nick_change(
    nexus: &Nexus,
    peer: &Arc<PeerLink>,
    client: &Arc<Client>,
    new_nick: &str,
    ts: Option<i64>,
) -> Result<(), LinkError> {
    if let Some(existing) = nexus.registry.find_nick(new_nick) {
        if !Arc::ptr_eq(&existing, client) {
            crate::state::stats::ServerStats::bump(&nexus.stats.collisions);
            let existing_ts = existing.info.read().tsinfo;
            let new_ts = ts.unwrap_or_else(|| nexus.now());
            if new_ts <= existing_ts {
                kill_collided(nexus, &existing, "Nick collision (new)");
            } else {
                peer.send(Message::from_server(
                    &nexus.me.sid,
                    Command::Kill {
                        target: client.use_id(),
                        path: format!("{} (Nick collision (new))", nexus.me.name),
                    },
                ));
                return Ok(());
            }
        }
    }
    nexus.registry.change_nick(client, new_nick);
    if let Some(ts) = ts {
        client.info.write().tsinfo = ts;
    }
    Ok(())
}

fn handle_sjoin(
    nexus: &Nexus,
    ts: i64,
    channel: &str,
    modes: &str,
    mode_args: &[String],
    members: &[String],
) {
    let chan_arc = nexus.channels.get_or_create(channel, ts);
    let mut chan = chan_arc.write();

    use std::cmp::Ordering as TsOrder;
    let keep_incoming_prefixes = match ts.cmp(&chan.ts) {
        TsOrder::Less => {
            // Incoming is older: their view of the channel wins.
            chan.strip_modes();
            chan.ts = ts;
            chan.modes = modes.trim_start_matches('+').to_string();
            chan.mode_args = mode_args.to_vec();
            true
        }
        TsOrder::Equal => true,
        TsOrder::Greater => false,
    };

    for member in members {
        let split = member
            .char_indices()
            .find(|(_, c)| !matches!(c, '@' | '+' | '%'))
            .map(|(i, _)| i)
            .unwrap_or(member.len());
        let (prefixes, uid) = member.split_at(split);
        let prefixes = if keep_incoming_prefixes {
            prefixes.to_string()
        } else {
            String::new()
        };
        chan.members.insert(uid.to_string(), prefixes);
    }
}

fn handle_bmask(nexus: &Nexus, ts: i64, channel: &str, list: char, masks: &[String]) {
    let Some(which) = MaskList::from_letter(list) else {
        crate::state::stats::ServerStats::bump(&nexus.stats.unknown_commands);
        return;
    };
    let Some(chan_arc) = nexus.channels.get(channel) else {
        return;
    };
    let mut chan = chan_arc.write();
    // Masks from a younger channel view lost the TS conflict.
    if ts > chan.ts {
        return;
    }
    let target = chan.list_mut(which);
    for mask in masks {
        if !target.iter().any(|m| m == mask) {
            target.push(mask.clone());
        }
    }
}

fn handle_tb(nexus: &Nexus, channel: &str, ts: i64, setter: Option<&str>, topic: &str) {
    let Some(chan_arc) = nexus.channels.get(channel) else {
        return;
    };
    let mut chan = chan_arc.write();
    let accept = match &chan.topic {
        None => true,
        Some(existing) => ts < existing.set_at,
    };
    if accept {
        chan.topic = Some(crate::state::channel::Topic {
            text: topic.to_string(),
            set_by: setter.unwrap_or("*").to_string(),
            set_at: ts,
        });
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_ban(
    nexus: &Nexus,
    _peer: &Arc<PeerLink>,
    action: BanAction,
    kind: char,
    user: &str,
    host: &str,
    created: i64,
    duration: i64,
    lifetime: i64,
    oper: &str,
    reason: &str,
) {
    let Some(kind) = ConfKind::from_ban_letter(kind, host) else {
        crate::state::stats::ServerStats::bump(&nexus.stats.unknown_commands);
        return;
    };

    // A replay that does not supersede the stored identity is stale.
    if let Some(existing) = nexus.bans.find_prop(kind, user, host) {
        if existing.created >= created {
            return;
        }
        // Superseded record loses its matcher entry before the new
        // one lands.
        if !existing.is_illegal() {
            nexus.matcher.delete(&existing.host.clone(), &existing);
        }
    }

    let (reason_text, oper_reason) = match reason.split_once('|') {
        Some((public, private)) => (public.to_string(), private.to_string()),
        None => (reason.to_string(), String::new()),
    };

    let conf = ConfItem {
        oper_reason,
        info: oper.to_string(),
        created,
        ..ConfItem::new(kind, user, host, &reason_text)
    };
    // Propagated bans expire by hold like temp bans do, and must ride
    // out both rehash flush modes.
    conf.set_flag(conf_flags::PROPAGATED | conf_flags::TEMPORARY);
    conf.hold.store(created + duration, std::sync::atomic::Ordering::Relaxed);
    conf.lifetime
        .store(created + lifetime, std::sync::atomic::Ordering::Relaxed);

    let deactivate = action == BanAction::Remove || created + duration <= nexus.now();
    let (stored, _old) = nexus.bans.upsert_prop(conf);
    if deactivate {
        stored.mark_illegal();
        stored
            .hold
            .store(nexus.now(), std::sync::atomic::Ordering::Relaxed);
        return;
    }

    // Active: index it and let the scan exit anyone now matching.
    nexus
        .matcher
        .add(host, kind, Some(user), None, stored.clone());
    nexus.pending.kline_scan.store(true, Ordering::Relaxed);
    info!(kind = ?stored.kind, user, host, "propagated ban installed");
}

/// Interpret the ENCAP sub-commands the core understands; everything
/// else just relays.
fn apply_encap(nexus: &Nexus, source: Option<&str>, subcommand: &str, params: &[String]) {
    match subcommand {
        "LOGIN" => {
            if let Some(client) = source.and_then(|s| nexus.registry.find_any(s)) {
                client.info.write().login = params.first().cloned();
            }
        }
        "CERTFP" => {
            if let Some(client) = source.and_then(|s| nexus.registry.find_any(s)) {
                client.info.write().certfp = params.first().cloned();
            }
        }
        "REALHOST" => {
            if let Some(client) = source.and_then(|s| nexus.registry.find_any(s)) {
                if let Some(host) = params.first() {
                    let mut info = client.info.write();
                    info.orig_host = host.clone();
                    info.set_flag(flags::DYN_SPOOF);
                }
            }
        }
        "GCAP" => {
            if let Some(client) = source.and_then(|s| nexus.registry.find_any(s)) {
                if let Some(caps) = params.first() {
                    if let Some(server) = client.server.write().as_mut() {
                        server.fullcaps = caps.clone();
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::client::Status;
    use crate::sync::caps;

    fn setup() -> (Arc<Nexus>, Arc<PeerLink>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let nexus = Nexus::new(
            Config::parse(
                r#"
                [server]
                name = "irc.example.net"
                sid = "42X"

                [general]
                nick_delay = 900

                [[connect]]
                name = "hub.example.net"
                host = "192.0.2.10"
                port = 6666
                send_password = "a"
                accept_password = "b"
                hub_mask = ["*"]
                "#,
            )
            .unwrap(),
        );
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let server = Client::new_local(9, tx, "192.0.2.10".parse().unwrap(), 1000, 1 << 22);
        {
            let mut info = server.info.write();
            info.nick = "hub.example.net".into();
            info.uid = Some("7LF".into());
            info.status = Status::Server;
        }
        *server.server.write() = Some(crate::state::client::ServerInfo {
            sid: "7LF".into(),
            ..Default::default()
        });
        nexus.registry.add_unknown(server.clone());
        nexus.registry.promote_local_server(&server);
        let block = nexus.config().connect[0].clone();
        let peer = Arc::new(PeerLink::new(
            server,
            "hub.example.net",
            "7LF",
            caps::our_caps(),
            block,
        ));
        nexus.peers.insert(peer.clone());
        (nexus, peer, rx)
    }

    fn euid(nick: &str, ts: i64, uid: &str) -> Message {
        Message::from_server(
            "7LF",
            Command::Euid {
                nick: nick.into(),
                hopcount: 1,
                ts,
                umodes: "+i".into(),
                username: "~u".into(),
                hostname: "host.example".into(),
                ip: "192.0.2.9".into(),
                uid: uid.into(),
                orig_host: "*".into(),
                login: "*".into(),
                info: "Somebody".into(),
            },
        )
    }

    #[test]
    fn euid_installs_remote_user() {
        let (nexus, peer, _rx) = setup();
        handle(&nexus, &peer, euid("alice", 1000, "7LFAAAAAA")).unwrap();
        let client = nexus.registry.find_nick("alice").unwrap();
        assert_eq!(client.uid().as_deref(), Some("7LFAAAAAA"));
        assert_eq!(client.status(), Status::Client);
        assert!(!client.is_local());
    }

    #[test]
    fn older_incoming_nick_wins_collision() {
        let (nexus, peer, _rx) = setup();
        // Existing remote alice with a newer ts.
        handle(&nexus, &peer, euid("alice", 1700000100, "7LFAAAAAA")).unwrap();
        // Incoming older alice.
        handle(&nexus, &peer, euid("alice", 1700000000, "7LFAAAAAB")).unwrap();

        let survivor = nexus.registry.find_nick("alice").unwrap();
        assert_eq!(survivor.uid().as_deref(), Some("7LFAAAAAB"));
        assert!(nexus.registry.find_uid("7LFAAAAAA").is_none());
        assert_eq!(
            crate::state::stats::ServerStats::get(&nexus.stats.collisions),
            1
        );
        // The losing nickname is reserved.
        assert!(nexus.nick_delay.is_delayed("alice", nexus.now()));
    }

    #[test]
    fn newer_incoming_nick_is_bounced() {
        let (nexus, peer, mut rx) = setup();
        handle(&nexus, &peer, euid("alice", 1700000000, "7LFAAAAAA")).unwrap();
        handle(&nexus, &peer, euid("alice", 1700000100, "7LFAAAAAB")).unwrap();

        let survivor = nexus.registry.find_nick("alice").unwrap();
        assert_eq!(survivor.uid().as_deref(), Some("7LFAAAAAA"));
        // The peer was told to kill the newcomer.
        let mut saw_kill = false;
        while let Ok(msg) = rx.try_recv() {
            if let Command::Kill { target, .. } = &msg.command {
                assert_eq!(target, "7LFAAAAAB");
                saw_kill = true;
            }
        }
        assert!(saw_kill);
    }

    #[test]
    fn equal_ts_collision_kills_both() {
        let (nexus, peer, mut rx) = setup();
        handle(&nexus, &peer, euid("alice", 1700000000, "7LFAAAAAA")).unwrap();
        handle(&nexus, &peer, euid("alice", 1700000000, "7LFAAAAAB")).unwrap();

        assert!(nexus.registry.find_nick("alice").is_none());
        assert!(nexus.registry.find_uid("7LFAAAAAA").is_none());
        let mut kills = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg.command, Command::Kill { .. }) {
                kills += 1;
            }
        }
        assert!(kills >= 1);
    }

    #[test]
    fn duplicate_uid_is_fatal() {
        let (nexus, peer, _rx) = setup();
        handle(&nexus, &peer, euid("alice", 1000, "7LFAAAAAA")).unwrap();
        let err = handle(&nexus, &peer, euid("bob", 1000, "7LFAAAAAA")).unwrap_err();
        assert!(matches!(err, LinkError::AlreadyLinked(_)));
    }

    #[test]
    fn sjoin_older_ts_strips_our_modes() {
        let (nexus, peer, _rx) = setup();
        let chan = nexus.channels.get_or_create("#test", 2000);
        {
            let mut chan = chan.write();
            chan.modes = "ntk".into();
            chan.mode_args = vec!["sekrit".into()];
            chan.members.insert("42XAAAAAA".into(), "@".into());
        }
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Sjoin {
                    ts: 1500,
                    channel: "#test".into(),
                    modes: "+m".into(),
                    mode_args: vec![],
                    members: vec!["@7LFAAAAAA".into()],
                },
            ),
        )
        .unwrap();

        let chan = nexus.channels.get("#test").unwrap();
        let chan = chan.read();
        assert_eq!(chan.ts, 1500);
        assert_eq!(chan.modes, "m");
        assert!(chan.mode_args.is_empty());
        // Our member lost its prefix, theirs kept it.
        assert_eq!(chan.members["42XAAAAAA"], "");
        assert_eq!(chan.members["7LFAAAAAA"], "@");
    }

    #[test]
    fn sjoin_newer_ts_keeps_ours_and_drops_their_prefixes() {
        let (nexus, peer, _rx) = setup();
        let chan = nexus.channels.get_or_create("#test", 1000);
        chan.write().members.insert("42XAAAAAA".into(), "@".into());
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Sjoin {
                    ts: 1500,
                    channel: "#test".into(),
                    modes: "+m".into(),
                    mode_args: vec![],
                    members: vec!["@7LFAAAAAA".into()],
                },
            ),
        )
        .unwrap();

        let chan = nexus.channels.get("#test").unwrap();
        let chan = chan.read();
        assert_eq!(chan.ts, 1000);
        assert_eq!(chan.members["42XAAAAAA"], "@");
        assert_eq!(chan.members["7LFAAAAAA"], "");
    }

    #[test]
    fn bmask_respects_channel_ts() {
        let (nexus, peer, _rx) = setup();
        nexus.channels.get_or_create("#test", 1000);
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Bmask {
                    ts: 1000,
                    channel: "#test".into(),
                    list: 'b',
                    masks: vec!["*!*@bad.example".into()],
                },
            ),
        )
        .unwrap();
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Bmask {
                    ts: 2000,
                    channel: "#test".into(),
                    list: 'b',
                    masks: vec!["*!*@late.example".into()],
                },
            ),
        )
        .unwrap();

        let chan = nexus.channels.get("#test").unwrap();
        assert_eq!(chan.read().bans, vec!["*!*@bad.example".to_string()]);
    }

    #[test]
    fn ban_install_indexes_and_queues_scan() {
        let (nexus, peer, _rx) = setup();
        let now = nexus.now();
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LFAAAAAA",
                Command::Ban {
                    action: BanAction::Add,
                    kind: 'K',
                    user: "bad".into(),
                    host: "badhost.example".into(),
                    created: now,
                    duration: 3600,
                    lifetime: 3600,
                    oper: "oper{hub.example.net}".into(),
                    reason: "spamming|seen it".into(),
                },
            ),
        )
        .unwrap();

        let stored = nexus
            .bans
            .find_prop(ConfKind::Kline, "bad", "badhost.example")
            .unwrap();
        assert_eq!(stored.reason, "spamming");
        assert_eq!(stored.oper_reason, "seen it");
        assert!(nexus.pending.kline_scan.load(Ordering::Relaxed));
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
    fn stale_ban_replay_is_ignored() {
        let (nexus, peer, _rx) = setup();
        let now = nexus.now();
        let install = |created: i64, reason: &str| {
            Message::from_server(
                "7LFAAAAAA",
                Command::Ban {
                    action: BanAction::Add,
                    kind: 'K',
                    user: "bad".into(),
                    host: "badhost.example".into(),
                    created,
                    duration: 3600,
                    lifetime: 7200,
                    oper: "*".into(),
                    reason: reason.into(),
                },
            )
        };
        handle(&nexus, &peer, install(now, "current")).unwrap();
        handle(&nexus, &peer, install(now - 100, "stale")).unwrap();
        let stored = nexus
            .bans
            .find_prop(ConfKind::Kline, "bad", "badhost.example")
            .unwrap();
        assert_eq!(stored.reason, "current");
    }

    #[test]
    fn ban_removal_deactivates_but_keeps_identity() {
        let (nexus, peer, _rx) = setup();
        let now = nexus.now();
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LFAAAAAA",
                Command::Ban {
                    action: BanAction::Add,
                    kind: 'K',
                    user: "bad".into(),
                    host: "badhost.example".into(),
                    created: now,
                    duration: 3600,
                    lifetime: 7200,
                    oper: "*".into(),
                    reason: "spamming".into(),
                },
            ),
        )
        .unwrap();
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LFAAAAAA",
                Command::Ban {
                    action: BanAction::Remove,
                    kind: 'K',
                    user: "bad".into(),
                    host: "badhost.example".into(),
                    created: now + 10,
                    duration: 0,
                    lifetime: 7200,
                    oper: "*".into(),
                    reason: "unbanned".into(),
                },
            ),
        )
        .unwrap();

        let stored = nexus
            .bans
            .find_prop(ConfKind::Kline, "bad", "badhost.example")
            .unwrap();
        assert!(stored.is_illegal());
    }

    #[test]
    fn encap_login_sets_account() {
        let (nexus, peer, _rx) = setup();
        handle(&nexus, &peer, euid("alice", 1000, "7LFAAAAAA")).unwrap();
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LFAAAAAA",
                Command::Encap {
                    target: "*".into(),
                    subcommand: "LOGIN".into(),
                    params: vec!["alice".into()],
                },
            ),
        )
        .unwrap();
        let client = nexus.registry.find_uid("7LFAAAAAA").unwrap();
        assert_eq!(client.info.read().login.as_deref(), Some("alice"));
    }

    #[test]
    fn squit_tears_down_the_named_server() {
        let (nexus, peer, _rx) = setup();
        // Introduce a downstream server and a user on it.
        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Sid {
                    name: "leaf.example.net".into(),
                    hopcount: 2,
                    sid: "8LF".into(),
                    info: "Leaf".into(),
                },
            ),
        )
        .unwrap();
        handle(&nexus, &peer, euid("carol", 1000, "8LFAAAAAA")).unwrap();

        handle(
            &nexus,
            &peer,
            Message::from_server(
                "7LF",
                Command::Squit {
                    server: "leaf.example.net".into(),
                    reason: "going down".into(),
                },
            ),
        )
        .unwrap();

        assert!(nexus.registry.find_server("leaf.example.net").is_none());
        assert!(nexus.registry.find_uid("8LFAAAAAA").is_none());
    }

    #[test]
    fn sid_introduction_respects_leaf_rules() {
        let (nexus, peer, _rx) = setup();
        // Rebuild the peer with a leafed block.
        let mut block = peer.block.clone();
        block.hub_mask.clear();
        let leafed = Arc::new(PeerLink::new(
            peer.client.clone(),
            "hub.example.net",
            "7LF",
            caps::our_caps(),
            block,
        ));
        let err = handle(
            &nexus,
            &leafed,
            Message::from_server(
                "7LF",
                Command::Sid {
                    name: "leaf.example.net".into(),
                    hopcount: 2,
                    sid: "8LF".into(),
                    info: "Leaf".into(),
                },
            ),
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::HubRule(_)));
    }
}
