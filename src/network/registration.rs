//! The registration verifier.
//!
//! Runs exactly once per connection, after every pre-registration
//! subtask (DNS, ident, DNSBL, ping cookie, NICK/USER) has settled.
//! Walks the gauntlet in a fixed order: auth record, redirect,
//! password, TLS/SASL/ident demands, tilde, per-host and class caps,
//! realname ban, DNSBL verdict, username grammar, spoof, default
//! modes, UID, and finally promotion plus the mesh introduction.

use std::sync::Arc;

use tracing::{debug, info};

use ferric_proto::validation::is_valid_username;
use ferric_proto::{Command, Message};

use crate::bans::{conf_flags, ConfKind};
use crate::error::RejectReason;
use crate::state::client::{flags, Client, Status};
use crate::state::Nexus;
use crate::sync::caps::cap;
use crate::sync::propagation::sendto_server;

/// User modes a fresh client may not self-assign.
const OPER_ONLY_UMODES: &[char] = &['o', 'a', 'z'];

pub fn register_local_user(nexus: &Nexus, client: &Arc<Client>) -> Result<(), RejectReason> {
    let config = nexus.config();
    let now = nexus.now();

    // Pull what pre-registration gathered.
    let (password, ident, dnsbl, wanted_nick, wanted_user, wanted_real) = {
        let pre = client.preclient.lock();
        let Some(pre) = pre.as_ref() else {
            return Err(RejectReason::NotAuthorised);
        };
        (
            pre.password.clone(),
            pre.ident.clone(),
            pre.dnsbl.clone(),
            pre.wanted_nick.clone().unwrap_or_default(),
            pre.wanted_user.clone().unwrap_or_default(),
            pre.wanted_real.clone().unwrap_or_default(),
        )
    };

    let (host, sockhost, orig_host, ip, login, got_ident, is_tls) = {
        let info = client.info.read();
        (
            info.host.clone(),
            info.sockhost.clone(),
            info.orig_host.clone(),
            info.ip,
            info.login.clone(),
            info.has_flag(flags::GOT_IDENT),
            info.has_flag(flags::TLS),
        )
    };

    // Ident wins over the USER-supplied name; without it the name
    // wears a tilde until the auth record says otherwise.
    let bare_user: String = ident.unwrap_or_else(|| wanted_user.clone());
    let tilde_user = format!("~{bare_user}");
    let check_user = if got_ident { &bare_user } else { &tilde_user };

    // 1. The best auth record, composed against K-lines.
    let aconf = crate::hostmask::find_address_conf(
        &nexus.matcher,
        &host,
        &sockhost,
        check_user,
        &bare_user,
        ip,
        login.as_deref(),
    )
    .ok_or(RejectReason::NotAuthorised)?;

    if aconf.kind == ConfKind::Kline {
        debug!(mask = %aconf.user_at_host(), "rejecting K-lined client");
        return Err(RejectReason::KLined);
    }

    // 2. Redirect records bounce instead of serving.
    if aconf.has_flag(conf_flags::REDIRECT) {
        return Err(RejectReason::Redirect(aconf.info.clone(), aconf.port));
    }

    // 3. Password.
    if !aconf.reason.is_empty() {
        let supplied = password.unwrap_or_default();
        let ok = if aconf.has_flag(conf_flags::ENCRYPTED) {
            bcrypt::verify(&supplied, &aconf.reason).unwrap_or(false)
        } else {
            supplied == aconf.reason
        };
        if !ok {
            return Err(RejectReason::BadPassword);
        }
    }

    // 4..6. Transport and identity demands.
    if aconf.has_flag(conf_flags::NEED_TLS) && !is_tls {
        return Err(RejectReason::NeedTls);
    }
    if aconf.has_flag(conf_flags::NEED_SASL) && login.is_none() {
        return Err(RejectReason::NeedSasl);
    }
    if aconf.has_flag(conf_flags::NEED_IDENT) && !got_ident {
        return Err(RejectReason::NeedIdent);
    }

    // 7. Tilde policy.
    let mut username = if got_ident || aconf.has_flag(conf_flags::NO_TILDE) {
        bare_user.clone()
    } else {
        tilde_user.clone()
    };

    let class = nexus.classes.find(&aconf.class_name);
    let exempt_limits = aconf.has_flag(conf_flags::EXEMPT_LIMITS);

    // 8. Per-host caps over the original hostname.
    if !exempt_limits {
        let on_host = nexus.registry.clients_on_host(&orig_host);
        let local = on_host.iter().filter(|c| c.is_local()).count();
        let global = on_host.len();
        let ident_count = on_host
            .iter()
            .filter(|c| ferric_proto::irc_eq(&c.info.read().username, &username))
            .count();
        if class.max_local_per_ip != 0 && local >= class.max_local_per_ip as usize {
            return Err(RejectReason::TooManyLocal);
        }
        if class.max_global_per_ip != 0 && global >= class.max_global_per_ip as usize {
            return Err(RejectReason::TooManyGlobal);
        }
        if class.max_ident_per_ip != 0 && ident_count >= class.max_ident_per_ip as usize {
            return Err(RejectReason::TooManyIdent);
        }

        // 9. Flat class capacity.
        if class.is_full() {
            return Err(RejectReason::ClassFull);
        }
    }

    // 10. Realname bans, unless the auth record shields them.
    if !aconf.has_flag(conf_flags::EXEMPT_KLINE) {
        if let Some(xline) = nexus.matcher.find(
            Some(&wanted_real),
            None,
            None,
            None,
            ConfKind::Xline,
            None,
            None,
            true,
        ) {
            debug!(mask = %xline.host, "rejecting X-lined realname");
            return Err(RejectReason::XLined);
        }
    }

    // 11. The DNSBL verdict, now that exemptions are known.
    if let Some((zone, template)) = dnsbl {
        if !aconf.has_flag(conf_flags::EXEMPT_DNSBL) {
            let reason = crate::network::dnsbl::format_reason(
                &template,
                &wanted_nick,
                &sockhost,
                &host,
                &zone,
                &nexus.me.network,
            );
            return Err(RejectReason::Dnsbl(reason));
        }
    }

    // 12. Username grammar.
    if !is_valid_username(&bare_user, config.general.dots_in_ident) {
        return Err(RejectReason::InvalidUsername(bare_user));
    }

    // 13. Spoof, recording the pre-spoof host.
    let mut visible_host = host.clone();
    if aconf.has_flag(conf_flags::SPOOF) && !aconf.info.is_empty() {
        match aconf.info.split_once('@') {
            Some((spoof_user, spoof_host)) => {
                username = spoof_user.to_string();
                visible_host = spoof_host.to_string();
            }
            None => visible_host = aconf.info.clone(),
        }
        info!(host = %visible_host, "spoofing client host");
    }
    let dyn_spoofed = visible_host != orig_host;

    // CIDR bucket accounting; refusal does not bump the counter.
    if let Some(ip) = ip {
        if exempt_limits {
            class.add_ip_unchecked(ip);
        } else if !class.try_add_ip(ip) {
            return Err(RejectReason::ClassFull);
        }
    }
    aconf.attach();
    if let Some(local) = &client.local {
        *local.att_conf.lock() = Some(aconf.clone());
        *local.att_class.lock() = Some(class.clone());
        local
            .sendq_max
            .store(class.sendq, std::sync::atomic::Ordering::Relaxed);
    }

    // 14. Default user modes, oper-only ones stripped.
    let umodes: String = config
        .general
        .default_umodes
        .trim_start_matches('+')
        .chars()
        .filter(|c| !OPER_ONLY_UMODES.contains(c))
        .collect();

    // 15. UID, unless the SASL flow already assigned one.
    let uid = match client.uid() {
        Some(uid) => uid,
        None => nexus.next_uid(),
    };

    // 16. Promote and introduce.
    {
        let mut info = client.info.write();
        info.nick = wanted_nick.clone();
        info.username = username.clone();
        info.host = visible_host.clone();
        info.realname = wanted_real.clone();
        info.uid = Some(uid.clone());
        info.tsinfo = now;
        info.umodes = umodes.clone();
        info.status = Status::Client;
        if dyn_spoofed {
            info.set_flag(flags::DYN_SPOOF);
        }
    }
    *client.preclient.lock() = None;
    nexus.registry.promote_local_user(client);
    crate::state::stats::ServerStats::bump(&nexus.stats.auth_successes);

    let umodes_wire = if umodes.is_empty() {
        "+".to_string()
    } else {
        format!("+{umodes}")
    };
    let euid = Message::from_server(
        &nexus.me.sid,
        Command::Euid {
            nick: wanted_nick.clone(),
            hopcount: 1,
            ts: now,
            umodes: umodes_wire.clone(),
            username: username.clone(),
            hostname: visible_host.clone(),
            ip: sockhost.clone(),
            uid: uid.clone(),
            orig_host: if dyn_spoofed { orig_host.clone() } else { "*".into() },
            login: login.clone().unwrap_or_else(|| "*".into()),
            info: wanted_real.clone(),
        },
    );
    sendto_server(nexus, None, cap::EUID, 0, &euid);
    let legacy = Message::from_server(
        &nexus.me.sid,
        Command::Uid {
            nick: wanted_nick,
            hopcount: 1,
            ts: now,
            umodes: umodes_wire,
            username,
            hostname: visible_host,
            ip: sockhost,
            uid,
            info: wanted_real,
        },
    );
    sendto_server(nexus, None, 0, cap::EUID, &legacy);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::client::PreClient;

    fn nexus(extra: &str) -> Arc<Nexus> {
        let config = format!(
            r#"
            [server]
            name = "irc.example.net"
            sid = "42X"

            [[class]]
            name = "users"
            max_total = 10
            max_local_per_ip = 2
            max_global_per_ip = 2
            max_ident_per_ip = 2
            number_per_cidr = 5
            cidr_ipv4_bitlen = 24

            {extra}
            "#
        );
        Nexus::new(Config::parse(&config).unwrap())
    }

    fn connected(nexus: &Nexus, nick: &str) -> Arc<Client> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        std::mem::forget(rx);
        let client = Client::new_local(
            nexus.connids.alloc(),
            tx,
            "192.0.2.7".parse().unwrap(),
            nexus.now(),
            4096,
        );
        {
            let mut pre = client.preclient.lock();
            let pre = pre.as_mut().unwrap();
            pre.pending = 0;
            pre.wanted_nick = Some(nick.to_string());
            pre.wanted_user = Some("alice".to_string());
            pre.wanted_real = Some("Alice Example".to_string());
        }
        nexus.registry.add_unknown(client.clone());
        client
    }

    const OPEN_AUTH: &str = r#"
        [[auth]]
        user = ["*@*"]
        class = "users"
    "#;

    #[test]
    fn happy_path_registers_and_indexes() {
        let nexus = nexus(OPEN_AUTH);
        let client = connected(&nexus, "alice");
        register_local_user(&nexus, &client).unwrap();

        assert_eq!(client.status(), Status::Client);
        let info = client.info.read();
        assert_eq!(info.username, "~alice");
        assert_eq!(info.uid.as_deref(), Some("42XAAAAAA"));
        drop(info);
        assert!(nexus.registry.find_nick("alice").is_some());
        assert!(client.preclient.lock().is_none());
        assert_eq!(
            crate::state::stats::ServerStats::get(&nexus.stats.auth_successes),
            1
        );
        // Attached to the class and counted in its CIDR tree.
        assert_eq!(nexus.classes.find("users").current(), 1);
        assert_eq!(
            nexus
                .classes
                .find("users")
                .cidr_count("192.0.2.200".parse().unwrap()),
            1
        );
    }

    #[test]
    fn no_auth_block_refuses() {
        let nexus = nexus("");
        let client = connected(&nexus, "alice");
        // The default-class fallback exists, but no auth record does.
        assert_eq!(
            register_local_user(&nexus, &client),
            Err(RejectReason::NotAuthorised)
        );
    }

    #[test]
    fn kline_refuses() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"

            [[kline]]
            user = "*"
            host = "192.0.2.7"
            reason = "known bad"
            "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(register_local_user(&nexus, &client), Err(RejectReason::KLined));
    }

    #[test]
    fn kline_matches_tilde_user_without_ident() {
        // A `*@host` K-line must catch the identless `~alice`.
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"

            [[kline]]
            user = "~*"
            host = "192.0.2.*"
            reason = "no identd no service"
            "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(register_local_user(&nexus, &client), Err(RejectReason::KLined));
    }

    #[test]
    fn password_gate() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            password = "sekrit"
        "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(
            register_local_user(&nexus, &client),
            Err(RejectReason::BadPassword)
        );

        let client2 = connected(&nexus, "bob");
        client2.preclient.lock().as_mut().unwrap().password = Some("sekrit".into());
        register_local_user(&nexus, &client2).unwrap();
    }

    #[test]
    fn redirect_record_bounces() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            redirect_host = "other.example.net"
            redirect_port = 6667
        "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(
            register_local_user(&nexus, &client),
            Err(RejectReason::Redirect("other.example.net".into(), 6667))
        );
    }

    #[test]
    fn sasl_and_ident_demands() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            need_sasl = true
        "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(register_local_user(&nexus, &client), Err(RejectReason::NeedSasl));
        client.info.write().login = Some("alice".into());
        register_local_user(&nexus, &client).unwrap();
    }

    #[test]
    fn no_tilde_flag_drops_prefix() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            no_tilde = true
        "#,
        );
        let client = connected(&nexus, "alice");
        register_local_user(&nexus, &client).unwrap();
        assert_eq!(client.info.read().username, "alice");
    }

    #[test]
    fn per_host_caps_refuse_at_limit() {
        let nexus = nexus(OPEN_AUTH);
        for (i, nick) in ["a", "b"].iter().enumerate() {
            let client = connected(&nexus, nick);
            client.info.write().orig_host = "shared.example".into();
            client.preclient.lock().as_mut().unwrap().wanted_user = Some(format!("u{i}"));
            register_local_user(&nexus, &client).unwrap();
        }
        let third = connected(&nexus, "c");
        third.info.write().orig_host = "shared.example".into();
        assert_eq!(
            register_local_user(&nexus, &third),
            Err(RejectReason::TooManyLocal)
        );
    }

    #[test]
    fn exceed_limit_flag_bypasses_caps() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            exceed_limit = true
        "#,
        );
        for nick in ["a", "b", "c", "d"] {
            let client = connected(&nexus, nick);
            client.info.write().orig_host = "shared.example".into();
            register_local_user(&nexus, &client).unwrap();
        }
    }

    #[test]
    fn xline_refuses_matching_realname() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"

            [[xline]]
            mask = "*Example*"
            reason = "bot pattern"
        "#,
        );
        let client = connected(&nexus, "alice");
        assert_eq!(register_local_user(&nexus, &client), Err(RejectReason::XLined));
    }

    #[test]
    fn dnsbl_verdict_respects_exemption() {
        let lenient = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            dnsbl_exempt = true
        "#,
        );
        let client = connected(&lenient, "alice");
        client.preclient.lock().as_mut().unwrap().dnsbl =
            Some(("dnsbl.example".into(), "listed %{ip}".into()));
        register_local_user(&lenient, &client).unwrap();

        let strict = nexus(OPEN_AUTH);
        let client = connected(&strict, "bob");
        client.preclient.lock().as_mut().unwrap().dnsbl =
            Some(("dnsbl.example".into(), "listed %{ip}".into()));
        match register_local_user(&strict, &client) {
            Err(RejectReason::Dnsbl(reason)) => assert_eq!(reason, "listed 192.0.2.7"),
            other => panic!("expected dnsbl rejection, got {other:?}"),
        }
    }

    #[test]
    fn invalid_username_refused() {
        let nexus = nexus(OPEN_AUTH);
        let client = connected(&nexus, "alice");
        client.preclient.lock().as_mut().unwrap().wanted_user = Some("bad.dots".into());
        assert!(matches!(
            register_local_user(&nexus, &client),
            Err(RejectReason::InvalidUsername(_))
        ));
    }

    #[test]
    fn spoof_sets_visible_host_and_flag() {
        let nexus = nexus(
            r#"
            [[auth]]
            user = ["*@*"]
            class = "users"
            spoof = "staff@friendly.example"
        "#,
        );
        let client = connected(&nexus, "alice");
        register_local_user(&nexus, &client).unwrap();
        let info = client.info.read();
        assert_eq!(info.host, "friendly.example");
        assert_eq!(info.username, "staff");
        assert_eq!(info.orig_host, "192.0.2.7");
        assert!(info.has_flag(flags::DYN_SPOOF));
    }

    #[test]
    fn default_umodes_strip_oper_only() {
        let nexus = nexus(&format!(
            r#"
            [general]
            default_umodes = "+iwo"

            {OPEN_AUTH}
            "#
        ));
        let client = connected(&nexus, "alice");
        register_local_user(&nexus, &client).unwrap();
        assert_eq!(client.info.read().umodes, "iw");
    }
}
