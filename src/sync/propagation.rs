//! Capability-filtered mesh multicast.
//!
//! Every outbound mesh message funnels through these primitives,
//! which visit each peer at most once over a snapshot of the peer set
//! so links dropping mid-fanout cannot corrupt the walk.

use ferric_proto::{wildcard_match, Command, Message};

use crate::state::Nexus;
use crate::sync::caps::cap;

/// Send to every peer whose negotiated caps include `caps_required`
/// and exclude `caps_disallowed`, skipping `exclude` (the link a
/// message arrived on).
pub fn sendto_server(
    nexus: &Nexus,
    exclude: Option<&str>,
    caps_required: u32,
    caps_disallowed: u32,
    msg: &Message,
) {
    for peer in nexus.peers.snapshot() {
        if exclude.is_some_and(|sid| peer.sid == sid) {
            continue;
        }
        let caps = peer.caps();
        if caps & caps_required != caps_required {
            continue;
        }
        if caps & caps_disallowed != 0 {
            continue;
        }
        if !peer.send(msg.clone()) {
            nexus
                .registry
                .abort_client(&peer.client, "Max SendQ exceeded");
        }
    }
}

/// Does a dotted server-name pattern cover this server name?
pub fn match_servs(pattern: &str, name: &str) -> bool {
    wildcard_match(pattern, name)
}

/// Like `sendto_server` but only to peers whose name matches the
/// dotted target pattern.
pub fn sendto_match_servs(
    nexus: &Nexus,
    pattern: &str,
    caps_required: u32,
    caps_disallowed: u32,
    msg: &Message,
) {
    for peer in nexus.peers.snapshot() {
        if !match_servs(pattern, &peer.name) {
            continue;
        }
        let caps = peer.caps();
        if caps & caps_required != caps_required {
            continue;
        }
        if caps & caps_disallowed != 0 {
            continue;
        }
        if !peer.send(msg.clone()) {
            nexus
                .registry
                .abort_client(&peer.client, "Max SendQ exceeded");
        }
    }
}

/// Emit a shared command to every cluster entry carrying `flag`.
/// Peers with `caps_required` get the native form; peers that only
/// speak ENCAP get the enveloped fallback.
pub fn cluster_generic(
    nexus: &Nexus,
    source: &str,
    command: &str,
    flag: &str,
    caps_required: u32,
    args: Vec<String>,
) {
    let config = nexus.config();
    for block in &config.cluster {
        if !block.shares(flag) {
            continue;
        }

        let mut native_params = vec![block.name.clone()];
        native_params.extend(args.iter().cloned());
        let native = Message::from_server(
            source,
            Command::Raw(command.to_string(), native_params),
        );
        sendto_match_servs(nexus, &block.name, caps_required, 0, &native);

        let fallback = Message::from_server(
            source,
            Command::Encap {
                target: block.name.clone(),
                subcommand: command.to_string(),
                params: args.clone(),
            },
        );
        // Only peers missing the native capability need the envelope.
        for peer in nexus.peers.snapshot() {
            if !match_servs(&block.name, &peer.name) {
                continue;
            }
            let caps = peer.caps();
            if caps & caps_required == caps_required {
                continue;
            }
            if caps & cap::ENCAP == 0 {
                continue;
            }
            if !peer.send(fallback.clone()) {
                nexus
                    .registry
                    .abort_client(&peer.client, "Max SendQ exceeded");
            }
        }
    }
}
