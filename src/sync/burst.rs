//! Full-state burst to a newly-linked peer.
//!
//! Order matters: propagated bans first (so arriving users are
//! checked against them), then every user, then every channel, then a
//! PING whose PONG marks end-of-burst receipt. Each SJOIN and BMASK
//! is chunked to respect the 512-byte frame.

use ferric_proto::{BanAction, Command, Message, MAX_LINE_LEN};

use crate::state::client::{flags, Status};
use crate::state::Nexus;
use crate::sync::caps::cap;

/// Generate the complete burst for a peer with the given negotiated
/// capability set.
pub fn generate_burst(nexus: &Nexus, peer_caps: u32) -> Vec<Message> {
    let mut out = Vec::new();
    let sid = nexus.me.sid.as_str();
    let now = nexus.now();
    let config = nexus.config();

    // 1. Propagated bans, while lifetime lasts. Deactivated ones are
    // announced too: the removal keeps its identity on the peer.
    if peer_caps & cap::BAN != 0 {
        for conf in nexus.bans.prop_snapshot(now) {
            let action = if conf.hold() > now {
                BanAction::Add
            } else {
                BanAction::Remove
            };
            if let Some(cmd) = conf.ban_command(action, &nexus.me.name) {
                out.push(Message::from_server(sid, cmd));
            }
        }
    }

    // 2. Users.
    for client in crate::state::Registry::snapshot(&nexus.registry.global) {
        if client.status() != Status::Client {
            continue;
        }
        let info = client.info.read();
        let Some(uid) = info.uid.clone() else { continue };
        let umodes = if info.umodes.is_empty() {
            "+".to_string()
        } else {
            format!("+{}", info.umodes)
        };
        let dyn_spoofed = info.has_flag(flags::DYN_SPOOF);
        let orig_host = if dyn_spoofed {
            info.orig_host.clone()
        } else {
            "*".to_string()
        };

        if peer_caps & cap::EUID != 0 {
            out.push(Message::from_server(
                sid,
                Command::Euid {
                    nick: info.nick.clone(),
                    hopcount: info.hopcount + 1,
                    ts: info.tsinfo,
                    umodes,
                    username: info.username.clone(),
                    hostname: info.host.clone(),
                    ip: info.sockhost.clone(),
                    uid: uid.clone(),
                    orig_host,
                    login: info.login.clone().unwrap_or_else(|| "*".to_string()),
                    info: info.realname.clone(),
                },
            ));
        } else {
            out.push(Message::from_server(
                sid,
                Command::Uid {
                    nick: info.nick.clone(),
                    hopcount: info.hopcount + 1,
                    ts: info.tsinfo,
                    umodes,
                    username: info.username.clone(),
                    hostname: info.host.clone(),
                    ip: info.sockhost.clone(),
                    uid: uid.clone(),
                    info: info.realname.clone(),
                },
            ));
            // What EUID would have carried rides in envelopes instead.
            if dyn_spoofed {
                out.push(Message::from_server(
                    &uid,
                    Command::Encap {
                        target: "*".into(),
                        subcommand: "REALHOST".into(),
                        params: vec![info.orig_host.clone()],
                    },
                ));
            }
            if let Some(login) = &info.login {
                out.push(Message::from_server(
                    &uid,
                    Command::Encap {
                        target: "*".into(),
                        subcommand: "LOGIN".into(),
                        params: vec![login.clone()],
                    },
                ));
            }
        }

        if let Some(certfp) = &info.certfp {
            out.push(Message::from_server(
                &uid,
                Command::Encap {
                    target: "*".into(),
                    subcommand: "CERTFP".into(),
                    params: vec![certfp.clone()],
                },
            ));
        }

        if config.general.burst_away {
            if let Some(away) = &info.away {
                out.push(Message::from_server(&uid, Command::Away(Some(away.clone()))));
            }
        }
    }

    // 3. Channels.
    for chan_arc in nexus.channels.snapshot() {
        let chan = chan_arc.read();
        if !chan.name.starts_with('#') {
            continue;
        }

        let members: Vec<String> = chan
            .members
            .iter()
            .map(|(uid, prefixes)| format!("{prefixes}{uid}"))
            .collect();
        for chunk in chunk_members(sid, chan.ts, &chan.name, &chan.mode_string(), &chan.mode_args, &members)
        {
            out.push(chunk);
        }

        for which in [
            crate::state::channel::MaskList::Ban,
            crate::state::channel::MaskList::Except,
            crate::state::channel::MaskList::Invex,
            crate::state::channel::MaskList::Quiet,
        ] {
            let masks = chan.list(which);
            if masks.is_empty() {
                continue;
            }
            match which {
                crate::state::channel::MaskList::Except if peer_caps & cap::EX == 0 => continue,
                crate::state::channel::MaskList::Invex if peer_caps & cap::IE == 0 => continue,
                _ => {}
            }
            for chunk in chunk_masks(sid, chan.ts, &chan.name, which.letter(), masks) {
                out.push(chunk);
            }
        }

        if peer_caps & cap::TB != 0 {
            if let Some(topic) = &chan.topic {
                out.push(Message::from_server(
                    sid,
                    Command::Tb {
                        channel: chan.name.clone(),
                        ts: topic.set_at,
                        setter: Some(topic.set_by.clone()),
                        topic: topic.text.clone(),
                    },
                ));
            }
        }

        if peer_caps & cap::MLOCK != 0 {
            if let Some(mlock) = &chan.mlock {
                out.push(Message::from_server(
                    sid,
                    Command::Mlock {
                        ts: chan.ts,
                        channel: chan.name.clone(),
                        modes: mlock.clone(),
                    },
                ));
            }
        }
    }

    // 4. End-of-burst marker; the peer's PONG closes the window.
    out.push(Message::new(Command::Ping {
        token: sid.to_string(),
        target: None,
    }));

    out
}

/// Split a member list into SJOINs that fit the frame.
fn chunk_members(
    sid: &str,
    ts: i64,
    channel: &str,
    modes: &str,
    mode_args: &[String],
    members: &[String],
) -> Vec<Message> {
    if members.is_empty() {
        return vec![Message::from_server(
            sid,
            Command::Sjoin {
                ts,
                channel: channel.to_string(),
                modes: modes.to_string(),
                mode_args: mode_args.to_vec(),
                members: Vec::new(),
            },
        )];
    }

    let mut out = Vec::new();
    let mut batch: Vec<String> = Vec::new();
    // Fixed per-line cost: ":sid SJOIN ts chan modes args :" + CRLF.
    let overhead = sid.len()
        + channel.len()
        + modes.len()
        + mode_args.iter().map(|a| a.len() + 1).sum::<usize>()
        + ts.to_string().len()
        + 16;
    let mut len = overhead;

    for member in members {
        if !batch.is_empty() && len + member.len() + 1 > MAX_LINE_LEN - 2 {
            out.push(Message::from_server(
                sid,
                Command::Sjoin {
                    ts,
                    channel: channel.to_string(),
                    // Only the first chunk carries the modes; later
                    // chunks must not re-apply keyed arguments.
                    modes: if out.is_empty() { modes.to_string() } else { "+".into() },
                    mode_args: if out.is_empty() { mode_args.to_vec() } else { Vec::new() },
                    members: std::mem::take(&mut batch),
                },
            ));
            len = overhead;
        }
        len += member.len() + 1;
        batch.push(member.clone());
    }
    if !batch.is_empty() {
        out.push(Message::from_server(
            sid,
            Command::Sjoin {
                ts,
                channel: channel.to_string(),
                modes: if out.is_empty() { modes.to_string() } else { "+".into() },
                mode_args: if out.is_empty() { mode_args.to_vec() } else { Vec::new() },
                members: batch,
            },
        ));
    }
    out
}

/// Split a mask list into BMASKs that fit the frame.
fn chunk_masks(sid: &str, ts: i64, channel: &str, list: char, masks: &[String]) -> Vec<Message> {
    let mut out = Vec::new();
    let mut batch: Vec<String> = Vec::new();
    let overhead = sid.len() + channel.len() + ts.to_string().len() + 16;
    let mut len = overhead;

    for mask in masks {
        if !batch.is_empty() && len + mask.len() + 1 > MAX_LINE_LEN - 2 {
            out.push(Message::from_server(
                sid,
                Command::Bmask {
                    ts,
                    channel: channel.to_string(),
                    list,
                    masks: std::mem::take(&mut batch),
                },
            ));
            len = overhead;
        }
        len += mask.len() + 1;
        batch.push(mask.clone());
    }
    if !batch.is_empty() {
        out.push(Message::from_server(
            sid,
            Command::Bmask {
                ts,
                channel: channel.to_string(),
                list,
                masks: batch,
            },
        ));
    }
    out
}
