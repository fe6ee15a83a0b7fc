//! Client and server teardown.
//!
//! Exit has five shapes by (local/remote × user/server/unregistered).
//! All of them end at the registry unlink, which parks the client on
//! a dead list; memory is released by the periodic free sweep, never
//! inline, so sibling list walks stay sound.

use std::collections::HashSet;
use std::sync::Arc;

use ferric_proto::{Command, Message, Prefix};
use tracing::{debug, info};

use crate::state::client::{flags, Client, Status};
use crate::state::Nexus;
use crate::sync::propagation::sendto_server;

/// Tear down any client. `origin` is the peer SID an exit arrived
/// from; propagation skips it.
pub fn exit_client(nexus: &Nexus, client: &Arc<Client>, origin: Option<&str>, reason: &str) {
    let (status, is_local) = (client.status(), client.is_local());
    if matches!(status, Status::Me | Status::Closing | Status::Dead) {
        return;
    }
    // Guard against re-entry while the teardown below fans out.
    client.info.write().status = Status::Closing;
    match (status, is_local) {
        (Status::Client | Status::Service | Status::Killed, true) => {
            exit_local_user(nexus, client, origin, reason)
        }
        (Status::Client | Status::Service | Status::Killed, false) => {
            exit_remote_user(nexus, client, origin, reason)
        }
        (Status::Server, true) => exit_local_server(nexus, client, origin, reason),
        (Status::Server, false) => exit_remote_server(nexus, client, origin, reason),
        (_, true) => exit_unknown(nexus, client, reason),
        (_, false) => nexus.registry.unlink(client),
    }
}

/// Send the final `ERROR :Closing Link` line and wake the connection
/// task so the socket closes after the queue drains.
fn close_local(nexus: &Nexus, client: &Arc<Client>, reason: &str, was_server: bool) {
    let (sockhost, ip) = {
        let info = client.info.read();
        (info.sockhost.clone(), info.ip)
    };
    client.send(Message::new(Command::Error(format!(
        "Closing Link: {sockhost} ({reason})"
    ))));
    if let Some(local) = &client.local {
        // notify_one stores a permit, so a close requested while the
        // connection task is mid-iteration is not lost.
        local.closed.notify_one();
        for connid in local.connids.lock().iter() {
            nexus.connids.release(*connid);
        }
        // Listener and helper references drop with the client.
        let first = local.first_time;
        let now = nexus.now();
        let sent = local.bytes_sent.load(std::sync::atomic::Ordering::Relaxed);
        let recv = local.bytes_recv.load(std::sync::atomic::Ordering::Relaxed);
        nexus
            .stats
            .record_exit(was_server, sent, recv, (now - first).max(0) as u64);
    }
    if let Some(ip) = ip {
        nexus.global_cidr.remove(ip);
    }
    detach_conf(nexus, client);
}

/// Drop the attached auth conf and class, maintaining both refcounts.
fn detach_conf(nexus: &Nexus, client: &Arc<Client>) {
    let Some(local) = &client.local else { return };
    if let Some(conf) = local.att_conf.lock().take() {
        conf.detach();
    }
    if let Some(class) = local.att_class.lock().take() {
        if let Some(ip) = client.info.read().ip {
            class.remove_ip(ip);
        }
        nexus.classes.sweep();
    }
}

/// QUIT fanout to every local user sharing a channel with `uid`,
/// each visited once.
fn quit_common_channels(nexus: &Nexus, uid: &str, quit_msg: &Message) {
    let mut seen: HashSet<String> = HashSet::new();
    for chan_arc in nexus.channels.snapshot() {
        let chan = chan_arc.read();
        if !chan.members.contains_key(uid) {
            continue;
        }
        for member in chan.members.keys() {
            if member == uid || !seen.insert(member.clone()) {
                continue;
            }
            if let Some(peer) = nexus.registry.find_uid(member) {
                if peer.is_local() && !peer.send(quit_msg.clone()) {
                    nexus.registry.abort_client(&peer, "Max SendQ exceeded");
                }
            }
        }
    }
}

fn user_prefix(client: &Arc<Client>) -> Prefix {
    let info = client.info.read();
    Prefix::User(info.nick.clone(), info.username.clone(), info.host.clone())
}

fn exit_unknown(nexus: &Nexus, client: &Arc<Client>, reason: &str) {
    debug!(host = %client.info.read().sockhost, reason, "closing unregistered connection");
    close_local(nexus, client, reason, false);
    nexus.registry.unlink(client);
}

fn exit_local_user(nexus: &Nexus, client: &Arc<Client>, origin: Option<&str>, reason: &str) {
    let uid = client.use_id();
    let killed = client.info.read().has_flag(flags::KILLED);

    let quit_msg = Message {
        prefix: Some(user_prefix(client)),
        command: Command::Quit(Some(reason.to_string())),
    };
    quit_common_channels(nexus, &uid, &quit_msg);
    nexus.channels.remove_member_everywhere(&uid);

    // The kill path already told the mesh.
    if !killed {
        sendto_server(
            nexus,
            origin,
            0,
            0,
            &Message::from_server(&uid, Command::Quit(Some(reason.to_string()))),
        );
    }

    close_local(nexus, client, reason, false);
    nexus.registry.unlink(client);
}

fn exit_remote_user(nexus: &Nexus, client: &Arc<Client>, origin: Option<&str>, reason: &str) {
    let uid = client.use_id();
    let killed = client.info.read().has_flag(flags::KILLED);

    let quit_msg = Message {
        prefix: Some(user_prefix(client)),
        command: Command::Quit(Some(reason.to_string())),
    };
    quit_common_channels(nexus, &uid, &quit_msg);
    nexus.channels.remove_member_everywhere(&uid);

    if !killed {
        sendto_server(
            nexus,
            origin,
            0,
            0,
            &Message::from_server(&uid, Command::Quit(Some(reason.to_string()))),
        );
    }
    nexus.registry.unlink(client);
}

/// Walk everything behind a lost server depth-first: dependent users
/// quit (or are merely marked when nick delay applies), dependent
/// servers recurse, and each is unlinked from the global state.
pub fn recurse_remove_clients(nexus: &Nexus, sid: &str, split_reason: &str) -> usize {
    let mut removed = 0;
    let snapshot = crate::state::Registry::snapshot(&nexus.registry.global);
    let nd_delay = nexus.config().general.nick_delay;
    let now = nexus.now();

    for client in snapshot {
        let (servptr, status, nick) = {
            let info = client.info.read();
            (info.servptr.clone(), info.status, info.nick.clone())
        };
        if servptr.as_deref() != Some(sid) {
            continue;
        }
        match status {
            Status::Server => {
                let child_sid = client.uid().unwrap_or_default();
                removed += recurse_remove_clients(nexus, &child_sid, split_reason);
                nexus.scache.split(&nick, now);
                nexus.registry.unlink(&client);
                removed += 1;
            }
            Status::Client | Status::Service => {
                if nd_delay > 0 {
                    nexus.nick_delay.add(&nick, now + nd_delay as i64);
                }
                let quit_msg = Message {
                    prefix: Some(user_prefix(&client)),
                    command: Command::Quit(Some(split_reason.to_string())),
                };
                let uid = client.use_id();
                quit_common_channels(nexus, &uid, &quit_msg);
                nexus.channels.remove_member_everywhere(&uid);
                nexus.registry.unlink(&client);
                removed += 1;
            }
            _ => {
                nexus.registry.unlink(&client);
                removed += 1;
            }
        }
    }
    removed
}

fn exit_local_server(nexus: &Nexus, client: &Arc<Client>, origin: Option<&str>, reason: &str) {
    let (name, sid) = {
        let info = client.info.read();
        (info.nick.clone(), info.uid.clone().unwrap_or_default())
    };
    info!(server = %name, reason, "server link closed");

    let now = nexus.now();
    nexus.scache.split(&name, now);
    nexus.peers.remove(&sid);

    let split_reason = format!("{} {}", nexus.me.name, name);
    let removed = recurse_remove_clients(nexus, &sid, &split_reason);
    info!(server = %name, removed, "split cleanup complete");

    // One SQUIT per still-connected peer, excluding where it came from.
    sendto_server(
        nexus,
        origin,
        0,
        0,
        &Message::from_server(
            &nexus.me.sid,
            Command::Squit {
                server: name.clone(),
                reason: reason.to_string(),
            },
        ),
    );

    close_local(nexus, client, reason, true);
    nexus.registry.unlink(client);
}

fn exit_remote_server(nexus: &Nexus, client: &Arc<Client>, origin: Option<&str>, reason: &str) {
    let (name, sid, servptr) = {
        let info = client.info.read();
        (
            info.nick.clone(),
            info.uid.clone().unwrap_or_default(),
            info.servptr.clone(),
        )
    };
    let now = nexus.now();
    nexus.scache.split(&name, now);

    let upstream = nexus
        .registry
        .find_uid(servptr.as_deref().unwrap_or(""))
        .map(|c| c.nick())
        .unwrap_or_else(|| nexus.me.name.clone());
    let split_reason = format!("{} {}", upstream, name);
    recurse_remove_clients(nexus, &sid, &split_reason);

    sendto_server(
        nexus,
        origin,
        0,
        0,
        &Message::from_server(
            origin.unwrap_or(nexus.me.sid.as_str()),
            Command::Squit {
                server: name.clone(),
                reason: reason.to_string(),
            },
        ),
    );

    nexus.registry.unlink(client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn nexus() -> Arc<Nexus> {
        Nexus::new(
            Config::parse(
                r#"
                [server]
                name = "irc.example.net"
                sid = "42X"

                [general]
                nick_delay = 900
                "#,
            )
            .unwrap(),
        )
    }

    fn remote_server(nexus: &Nexus, name: &str, sid: &str, behind: &str) -> Arc<Client> {
        let client = Client::new_remote_server(name, sid, "a server", 2, behind, behind, 1000);
        nexus.registry.add_remote_server(&client);
        nexus.scache.connect(name, "a server", false, 1000);
        client
    }

    fn remote_user(nexus: &Nexus, nick: &str, uid: &str, on: &str) -> Arc<Client> {
        let client = Client::new_remote_user(
            nick,
            "~u",
            "host.example",
            "host.example",
            "192.0.2.9",
            uid,
            "Somebody",
            1000,
            2,
            &uid[..3],
            on,
        );
        nexus.registry.add_remote_user(&client);
        client
    }

    #[test]
    fn squit_cascade_removes_the_whole_subtree() {
        let nexus = nexus();
        // hub (7LF) carries leaf (8LF); users on both.
        let hub = remote_server(&nexus, "hub.example.net", "7LF", "42X");
        let _leaf = remote_server(&nexus, "leaf.example.net", "8LF", "7LF");
        remote_user(&nexus, "alice", "7LFAAAAAA", "7LF");
        remote_user(&nexus, "bob", "8LFAAAAAA", "8LF");

        exit_client(&nexus, &hub, None, "Remote host closed the connection");

        assert!(nexus.registry.find_uid("7LFAAAAAA").is_none());
        assert!(nexus.registry.find_uid("8LFAAAAAA").is_none());
        assert!(nexus.registry.find_nick("alice").is_none());
        assert!(nexus.registry.find_server("leaf.example.net").is_none());
        assert!(nexus.registry.find_server("hub.example.net").is_none());
        // Everything is parked for the sweep, nothing freed inline.
        assert!(nexus.registry.reap_dead() >= 4);
        // The name cache remembers the split.
        assert!(nexus.scache.find("leaf.example.net").unwrap().last_split > 0);
    }

    #[test]
    fn split_users_get_nick_delayed() {
        let nexus = nexus();
        let hub = remote_server(&nexus, "hub.example.net", "7LF", "42X");
        remote_user(&nexus, "alice", "7LFAAAAAA", "7LF");
        exit_client(&nexus, &hub, None, "squit");
        assert!(nexus.nick_delay.is_delayed("alice", nexus.now()));
    }

    #[test]
    fn quit_fanout_reaches_local_channel_peers_once() {
        let nexus = nexus();
        remote_server(&nexus, "hub.example.net", "7LF", "42X");
        let remote = remote_user(&nexus, "alice", "7LFAAAAAA", "7LF");

        // A local observer sharing two channels with the quitter.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let local = Client::new_local(1, tx, "192.0.2.7".parse().unwrap(), 1000, 1 << 20);
        {
            let mut info = local.info.write();
            info.nick = "bob".into();
            info.uid = Some("42XAAAAAA".into());
            info.status = Status::Client;
        }
        nexus.registry.add_unknown(local.clone());
        nexus.registry.promote_local_user(&local);

        for name in ["#one", "#two"] {
            let chan = nexus.channels.get_or_create(name, 500);
            chan.write().members.insert("7LFAAAAAA".into(), "".into());
            chan.write().members.insert("42XAAAAAA".into(), "@".into());
        }

        exit_client(&nexus, &remote, None, "gone");

        let mut quits = 0;
        while let Ok(msg) = rx.try_recv() {
            if matches!(msg.command, Command::Quit(_)) {
                quits += 1;
            }
        }
        assert_eq!(quits, 1, "each destination visited at most once");
        // The quitter is out of both channels.
        assert!(nexus.channels.get("#one").unwrap().read().members.len() == 1);
    }

    #[test]
    fn exit_is_deferred_to_the_dead_list() {
        let nexus = nexus();
        remote_server(&nexus, "hub.example.net", "7LF", "42X");
        let user = remote_user(&nexus, "alice", "7LFAAAAAA", "7LF");
        exit_client(&nexus, &user, None, "quit");
        assert_eq!(user.status(), Status::Dead);
        assert_eq!(nexus.registry.dead_remote.lock().len(), 1);
        assert_eq!(nexus.registry.reap_dead(), 1);
    }
}
