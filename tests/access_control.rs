//! End-to-end access-control behavior across the matcher, the ban
//! store and the registration verifier.

use std::sync::Arc;

use ferric_proto::{BanAction, Command};
use ferricd::bans::{conf_flags, ConfItem, ConfKind};
use ferricd::config::Config;
use ferricd::error::RejectReason;
use ferricd::hostmask::{find_dline, valid_wild_card};
use ferricd::network::registration::register_local_user;
use ferricd::state::client::Client;
use ferricd::state::Nexus;

fn nexus(extra: &str) -> Arc<Nexus> {
    let text = format!(
        r#"
        [server]
        name = "irc.example.net"
        sid = "42X"

        [[class]]
        name = "users"
        max_total = 100
        max_local_per_ip = 0
        max_global_per_ip = 0
        max_ident_per_ip = 0

        [[auth]]
        user = ["*@*"]
        class = "users"

        {extra}
        "#
    );
    Nexus::new(Config::parse(&text).unwrap())
}

fn incoming(nexus: &Nexus, nick: &str, ip: &str) -> Arc<Client> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    std::mem::forget(rx);
    let client = Client::new_local(
        nexus.connids.alloc(),
        tx,
        ip.parse().unwrap(),
        nexus.now(),
        1 << 20,
    );
    {
        let mut pre = client.preclient.lock();
        let pre = pre.as_mut().unwrap();
        pre.pending = 0;
        pre.wanted_nick = Some(nick.into());
        pre.wanted_user = Some("user".into());
        pre.wanted_real = Some("A Real Person".into());
    }
    nexus.registry.add_unknown(client.clone());
    client
}

#[test]
fn exempt_dline_inside_a_dline_admits_the_connection() {
    // An exempt /24 with a D-line on a /32 inside it: the connect
    // gate probes exemptions first, so the address is admitted and
    // proceeds all the way through registration.
    let nexus = nexus(
        r#"
        [[dline]]
        host = "192.0.2.0/24"
        exempt = true

        [[dline]]
        host = "192.0.2.10"
        reason = "compromised"
        "#,
    );

    let verdict = find_dline(&nexus.matcher, "192.0.2.10".parse().unwrap()).unwrap();
    assert_eq!(verdict.kind, ConfKind::ExemptDline);

    let client = incoming(&nexus, "alice", "192.0.2.10");
    register_local_user(&nexus, &client).unwrap();
    assert!(nexus.registry.find_nick("alice").is_some());
}

#[test]
fn dline_outside_the_exemption_still_bites() {
    let nexus = nexus(
        r#"
        [[dline]]
        host = "192.0.2.0/24"
        exempt = true

        [[dline]]
        host = "198.51.100.0/24"
        reason = "drones"
        "#,
    );
    let verdict = find_dline(&nexus.matcher, "198.51.100.7".parse().unwrap()).unwrap();
    assert_eq!(verdict.kind, ConfKind::Dline);
}

#[test]
fn kline_install_then_remove_restores_matcher_state() {
    let nexus = nexus("");
    let now = nexus.now();

    let lookup = |nexus: &Nexus| {
        nexus.matcher.find(
            Some("drone.example"),
            None,
            None,
            None,
            ConfKind::Kline,
            Some("bad"),
            None,
            false,
        )
    };
    assert!(lookup(&nexus).is_none());

    // Install a temp K-line the way the oper surface would.
    let conf = Arc::new({
        let c = ConfItem::new(ConfKind::Kline, "bad", "drone.example", "spamming");
        c.set_flag(conf_flags::TEMPORARY);
        c.hold.store(now + 3600, std::sync::atomic::Ordering::Relaxed);
        c
    });
    nexus
        .matcher
        .add("drone.example", ConfKind::Kline, Some("bad"), None, conf.clone());
    nexus.bans.add_temp(conf.clone(), now);
    assert!(lookup(&nexus).is_some());

    // Remove by exact mask, as UNKLINE does.
    let found = nexus
        .matcher
        .find_exact("drone.example", ConfKind::Kline, Some("bad"))
        .unwrap();
    assert!(Arc::ptr_eq(&found, &conf));
    assert!(nexus.matcher.delete("drone.example", &conf));
    nexus.bans.remove_temp(&conf);

    assert!(lookup(&nexus).is_none());
    assert_eq!(nexus.bans.temp_count(), 0);
    assert!(conf.is_illegal());
}

#[test]
fn propagated_kline_carries_the_wire_shape() {
    // An oper K-line becomes `BAN + K user host created duration
    // lifetime oper{server} :reason` on the wire.
    let nexus = nexus("");
    let now = nexus.now();

    let conf = ConfItem {
        info: "oper".into(),
        created: now,
        ..ConfItem::new(ConfKind::Kline, "bad", "badhost.example", "spamming")
    };
    conf.hold.store(now + 3600, std::sync::atomic::Ordering::Relaxed);
    conf.lifetime
        .store(now + 3600, std::sync::atomic::Ordering::Relaxed);
    let (stored, _) = nexus.bans.upsert_prop(conf);

    let cmd = stored.ban_command(BanAction::Add, &nexus.me.name).unwrap();
    match cmd.clone() {
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
            assert_eq!(action, BanAction::Add);
            assert_eq!(kind, 'K');
            assert_eq!(user, "bad");
            assert_eq!(host, "badhost.example");
            assert_eq!(created, now);
            assert_eq!(duration, 3600);
            assert_eq!(lifetime, 3600);
            assert_eq!(oper, "oper{irc.example.net}");
            assert_eq!(reason, "spamming");
        }
        other => panic!("expected BAN, got {other:?}"),
    }

    // And the emitted line survives a wire round trip.
    let msg = ferric_proto::Message::from_server("42X", cmd);
    let reparsed: ferric_proto::Message = msg.to_string().parse().unwrap();
    assert_eq!(msg, reparsed);
}

#[test]
fn too_wild_masks_are_refused() {
    let min = 4;
    assert!(!valid_wild_card("*", "*", min));
    assert!(!valid_wild_card("*a*", "?", min));
    assert!(valid_wild_card("concrete", "*", min));
    assert!(valid_wild_card("*", "host.example", min));
    assert!(valid_wild_card("*", "192.0.2.0/24", min));
    assert!(!valid_wild_card("*", "0.0.0.0/0", min));
}

#[test]
fn conf_refcount_survives_attached_clients() {
    // A client keeps its conf alive across an unindex; the record
    // frees only when the last attachment drains.
    let nexus = nexus("");
    let client = incoming(&nexus, "alice", "192.0.2.77");
    register_local_user(&nexus, &client).unwrap();

    let conf = client
        .local
        .as_ref()
        .unwrap()
        .att_conf
        .lock()
        .clone()
        .unwrap();
    // One from the matcher index, one from the attachment.
    assert_eq!(conf.refcount(), 2);

    conf.mark_illegal();
    assert!(!conf.detach());
    assert!(conf.detach());
}

#[test]
fn reject_cache_short_circuits_repeat_offenders() {
    let nexus = nexus("");
    let ip = "203.0.113.9".parse().unwrap();
    let now = nexus.now();
    for _ in 0..3 {
        nexus.reject.note_refused(ip, now);
    }
    assert!(nexus.reject.is_rejected(ip, now + 1));
    // An unrelated address is untouched.
    assert!(!nexus.reject.is_rejected("203.0.113.10".parse().unwrap(), now + 1));
}

#[test]
fn kline_refusal_feeds_the_reject_path() {
    let nexus = nexus(
        r#"
        [[kline]]
        user = "*"
        host = "203.0.113.*"
        reason = "botnet"
        "#,
    );
    let client = incoming(&nexus, "bot", "203.0.113.5");
    assert_eq!(
        register_local_user(&nexus, &client),
        Err(RejectReason::KLined)
    );
}
