//! Per-connection client handling.
//!
//! One task per accepted client socket. Pre-registration runs the
//! DNS/ident/DNSBL subtasks concurrently with the NICK/USER exchange;
//! the registration verifier fires once, when the last outstanding
//! bit clears. After promotion the same loop carries the thin slice
//! of traffic the core owns: keepalive, nick changes, away state,
//! private messages with target-change accounting, and quit.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

use ferric_proto::validation::is_valid_nick;
use ferric_proto::{irc_eq, Command, LineCodec, Message, Prefix};

use crate::bans::ConfKind;
use crate::error::RejectReason;
use crate::network::dns::DnsService;
use crate::network::registration::register_local_user;
use crate::network::{dnsbl, ident};
use crate::state::client::{flags, pre, Client, Status};
use crate::state::stats::ServerStats;
use crate::state::Nexus;
use crate::sync::propagation::sendto_server;
use crate::sync::split::exit_client;

pub async fn client_task(
    nexus: Arc<Nexus>,
    dns: Arc<DnsService>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let local_addr = match stream.local_addr() {
        Ok(a) => a,
        Err(_) => return,
    };
    let config = nexus.config();
    let now = nexus.now();

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let client = Client::new_local(
        nexus.connids.alloc(),
        tx,
        addr.ip(),
        now,
        crate::config::defaults::sendq(),
    );
    nexus.registry.add_unknown(client.clone());

    // Arm the pre-registration subtask bits before anything can race.
    {
        let mut pre_lock = client.preclient.lock();
        if let Some(pre_state) = pre_lock.as_mut() {
            pre_state.pending |= pre::DNS | pre::DNSBL;
            if !config.general.disable_identd {
                pre_state.pending |= pre::IDENT;
            }
            if config.general.ping_cookie {
                pre_state.pending |= pre::PING_COOKIE;
                let cookie = nexus.ping_cookie();
                pre_state.ping_cookie = Some(cookie.clone());
                client.send(Message::new(Command::Ping {
                    token: cookie,
                    target: None,
                }));
            }
        }
    }

    {
        let nexus = nexus.clone();
        let client = client.clone();
        let dns = dns.clone();
        tokio::spawn(async move {
            auth_subtasks(nexus, dns, client, local_addr, addr).await;
        });
    }

    run_loop(nexus, client, Framed::new(stream, LineCodec::new()), rx).await;
}

/// DNS, ident and DNSBL in parallel; each clears its bit and the last
/// one may release registration.
async fn auth_subtasks(
    nexus: Arc<Nexus>,
    dns: Arc<DnsService>,
    client: Arc<Client>,
    local_addr: SocketAddr,
    addr: SocketAddr,
) {
    let config = nexus.config();
    let timeout = config.general.connect_timeout;
    let ident_enabled = !config.general.disable_identd;

    notice_auth(&nexus, &client, "*** Looking up your hostname...");
    if ident_enabled {
        notice_auth(&nexus, &client, "*** Checking Ident");
    }

    let dns_fut = dns.verify_reverse(addr.ip(), timeout);
    let ident_fut = async {
        if ident_enabled {
            ident::query(local_addr, addr, config.general.ident_timeout).await
        } else {
            None
        }
    };
    let dnsbl_fut = dnsbl::check(&dns, &config.dnsbl, addr.ip());

    let (hostname, ident_user, dnsbl_hit) = tokio::join!(dns_fut, ident_fut, dnsbl_fut);

    match &hostname {
        Some(name) => {
            notice_auth(&nexus, &client, &format!("*** Found your hostname: {name}"));
            let mut info = client.info.write();
            info.host = name.clone();
            info.orig_host = name.clone();
        }
        None => notice_auth(
            &nexus,
            &client,
            "*** Couldn't look up your hostname, using your IP instead",
        ),
    }
    if ident_enabled {
        match &ident_user {
            Some(user) => {
                notice_auth(&nexus, &client, &format!("*** Got Ident response: {user}"));
                client.info.write().set_flag(flags::GOT_IDENT);
            }
            None => notice_auth(&nexus, &client, "*** No Ident response"),
        }
    }

    {
        let mut pre_lock = client.preclient.lock();
        if let Some(pre_state) = pre_lock.as_mut() {
            pre_state.ident = ident_user;
            pre_state.dnsbl = dnsbl_hit;
            pre_state.pending &= !(pre::DNS | pre::IDENT | pre::DNSBL);
        }
    }
    try_register(&nexus, &client);
}

fn notice_auth(nexus: &Nexus, client: &Arc<Client>, text: &str) {
    client.send(Message::from_server(
        &nexus.me.name,
        Command::Notice {
            target: "*".into(),
            text: text.into(),
        },
    ));
}

/// Fire the verifier when every pre-condition has cleared. Runs the
/// verifier at most once; a refusal tears the connection down.
pub fn try_register(nexus: &Nexus, client: &Arc<Client>) {
    if client.status() != Status::Unknown {
        return;
    }
    {
        let pre_lock = client.preclient.lock();
        match pre_lock.as_ref() {
            Some(pre_state) if pre_state.pending == 0 => {}
            _ => return,
        }
    }

    match register_local_user(nexus, client) {
        Ok(()) => {
            let (nick, user_host) = {
                let info = client.info.read();
                (info.nick.clone(), info.user_host())
            };
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "001".into(),
                    vec![
                        nick.clone(),
                        format!(
                            "Welcome to the {} Internet Relay Chat Network {}",
                            nexus.me.network, nick
                        ),
                    ],
                ),
            ));
            debug!(nick, user_host, "client registered");
        }
        Err(reason) => refuse(nexus, client, reason),
    }
}

fn refuse(nexus: &Nexus, client: &Arc<Client>, reason: RejectReason) {
    ServerStats::bump(&nexus.stats.refused);
    ServerStats::bump(&nexus.stats.auth_failures);
    if let Some(ip) = client.info.read().ip {
        nexus.reject.note_refused(ip, nexus.now());
    }

    let nick = {
        let pre_lock = client.preclient.lock();
        pre_lock
            .as_ref()
            .and_then(|p| p.wanted_nick.clone())
            .unwrap_or_else(|| "*".into())
    };
    // The numeric precedes the ERROR so clients show something useful.
    match &reason {
        RejectReason::NotAuthorised | RejectReason::KLined | RejectReason::DLined => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric("465".into(), vec![nick, reason.to_string()]),
            ));
        }
        RejectReason::BadPassword => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric("464".into(), vec![nick, "Password incorrect".into()]),
            ));
        }
        RejectReason::Redirect(host, port) => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric("010".into(), vec![nick, host.clone(), port.to_string(), "Please use this Server/Port instead".into()]),
            ));
        }
        RejectReason::ClassFull
        | RejectReason::TooManyLocal
        | RejectReason::TooManyGlobal
        | RejectReason::TooManyIdent => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric("513".into(), vec![nick, reason.to_string()]),
            ));
        }
        _ => {}
    }
    exit_client(nexus, client, None, &reason.to_string());
}

async fn run_loop(
    nexus: Arc<Nexus>,
    client: Arc<Client>,
    mut framed: Framed<TcpStream, LineCodec>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Message>,
) {
    use std::sync::atomic::Ordering;

    let Some(local) = client.local.as_ref() else {
        return;
    };
    let mut shutdown_rx = nexus.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            inbound = framed.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        let wire_len = msg.to_string().len() as u64 + 2;
                        local.bytes_recv.fetch_add(wire_len, Ordering::Relaxed);
                        local.messages_recv.fetch_add(1, Ordering::Relaxed);
                        local.touch(nexus.now());
                        ServerStats::bump(&nexus.stats.messages_recv_client);
                        dispatch(&nexus, &client, msg);
                        if client.status() == Status::Dead {
                            // Exit ran inside dispatch; flush and go.
                            while let Ok(msg) = rx.try_recv() {
                                if framed.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        ServerStats::bump(&nexus.stats.empty_messages);
                        debug!(error = %e, "client framing error");
                        // Unparsable input is dropped, not fatal.
                        continue;
                    }
                    None => {
                        exit_client(&nexus, &client, None, "Remote host closed the connection");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(msg) => {
                        let wire_len = msg.to_string().len() + 2;
                        local.drain(wire_len);
                        if framed.send(msg).await.is_err() {
                            nexus.registry.abort_client(&client, "Write error");
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = local.closed.notified() => {
                while let Ok(msg) = rx.try_recv() {
                    if framed.send(msg).await.is_err() {
                        break;
                    }
                }
                break;
            }
            _ = shutdown_rx.recv() => {
                let _ = framed
                    .send(Message::new(Command::Error("Closing Link: server shutting down".into())))
                    .await;
                break;
            }
        }
    }
}

/// Route one inbound line by registration state.
fn dispatch(nexus: &Nexus, client: &Arc<Client>, msg: Message) {
    if client.status() == Status::Unknown {
        dispatch_prereg(nexus, client, msg);
    } else {
        dispatch_registered(nexus, client, msg);
    }
}

fn dispatch_prereg(nexus: &Nexus, client: &Arc<Client>, msg: Message) {
    match msg.command {
        Command::ClientPass(password) => {
            if let Some(pre_state) = client.preclient.lock().as_mut() {
                pre_state.password = Some(password);
            }
        }
        Command::Nick { nick, .. } => {
            if !is_valid_nick(&nick) {
                client.send(Message::from_server(
                    &nexus.me.name,
                    Command::Numeric(
                        "432".into(),
                        vec!["*".into(), nick, "Erroneous nickname".into()],
                    ),
                ));
                return;
            }
            if nexus.registry.nick_in_use(&nick)
                || nexus.nick_delay.is_delayed(&nick, nexus.now())
            {
                client.send(Message::from_server(
                    &nexus.me.name,
                    Command::Numeric(
                        "433".into(),
                        vec!["*".into(), nick, "Nickname is already in use".into()],
                    ),
                ));
                return;
            }
            if nexus
                .matcher
                .find(Some(&nick), None, None, None, ConfKind::ResvNick, None, None, true)
                .is_some()
            {
                client.send(Message::from_server(
                    &nexus.me.name,
                    Command::Numeric(
                        "432".into(),
                        vec!["*".into(), nick, "This nickname is reserved".into()],
                    ),
                ));
                return;
            }
            if let Some(pre_state) = client.preclient.lock().as_mut() {
                pre_state.wanted_nick = Some(nick);
                if pre_state.wanted_user.is_some() {
                    pre_state.pending &= !pre::REGISTRATION;
                }
            }
            try_register(nexus, client);
        }
        Command::User { username, realname } => {
            if let Some(pre_state) = client.preclient.lock().as_mut() {
                pre_state.wanted_user = Some(username);
                pre_state.wanted_real = Some(realname);
                if pre_state.wanted_nick.is_some() {
                    pre_state.pending &= !pre::REGISTRATION;
                }
            }
            try_register(nexus, client);
        }
        Command::Pong { source, token } => {
            let supplied = token.unwrap_or(source);
            let mut matched = false;
            if let Some(pre_state) = client.preclient.lock().as_mut() {
                if pre_state.ping_cookie.as_deref() == Some(supplied.as_str()) {
                    pre_state.pending &= !pre::PING_COOKIE;
                    matched = true;
                }
            }
            if matched {
                try_register(nexus, client);
            }
        }
        Command::Quit(reason) => {
            let text = reason
                .map(|r| format!("Quit: {r}"))
                .unwrap_or_else(|| "Client Quit".into());
            exit_client(nexus, client, None, &text);
        }
        Command::Raw(verb, _) => {
            debug!(verb, "pre-registration command ignored");
            ServerStats::bump(&nexus.stats.unknown_commands);
        }
        _ => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "451".into(),
                    vec!["*".into(), "You have not registered".into()],
                ),
            ));
        }
    }
}

fn dispatch_registered(nexus: &Nexus, client: &Arc<Client>, msg: Message) {
    match msg.command {
        Command::Ping { token, .. } => {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Pong {
                    source: nexus.me.name.clone(),
                    token: Some(token),
                },
            ));
        }
        Command::Pong { .. } => {
            client.info.write().clear_flag(flags::PING_SENT);
        }
        Command::Quit(reason) => {
            let text = reason
                .map(|r| format!("Quit: {r}"))
                .unwrap_or_else(|| "Client Quit".into());
            exit_client(nexus, client, None, &text);
        }
        Command::Nick { nick, .. } => {
            handle_local_nick_change(nexus, client, &nick);
        }
        Command::Away(away) => {
            client.info.write().away = away.clone();
            let uid = client.use_id();
            sendto_server(
                nexus,
                None,
                0,
                0,
                &Message::from_server(&uid, Command::Away(away)),
            );
        }
        Command::Privmsg { target, text } => {
            deliver_message(nexus, client, &target, &text, false);
        }
        Command::Notice { target, text } => {
            deliver_message(nexus, client, &target, &text, true);
        }
        Command::Raw(verb, _) => {
            ServerStats::bump(&nexus.stats.unknown_commands);
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "421".into(),
                    vec![client.nick(), verb, "Unknown command".into()],
                ),
            ));
        }
        _ => {
            ServerStats::bump(&nexus.stats.unknown_commands);
        }
    }
}

fn handle_local_nick_change(nexus: &Nexus, client: &Arc<Client>, new_nick: &str) {
    if !is_valid_nick(new_nick) {
        client.send(Message::from_server(
            &nexus.me.name,
            Command::Numeric(
                "432".into(),
                vec![client.nick(), new_nick.into(), "Erroneous nickname".into()],
            ),
        ));
        return;
    }
    if let Some(holder) = nexus.registry.find_nick(new_nick) {
        if !Arc::ptr_eq(&holder, client) {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "433".into(),
                    vec![client.nick(), new_nick.into(), "Nickname is already in use".into()],
                ),
            ));
            return;
        }
    }
    let now = nexus.now();
    if nexus.nick_delay.is_delayed(new_nick, now)
        && !irc_eq(&client.nick(), new_nick)
    {
        client.send(Message::from_server(
            &nexus.me.name,
            Command::Numeric(
                "433".into(),
                vec![client.nick(), new_nick.into(), "Nickname is temporarily unavailable".into()],
            ),
        ));
        return;
    }

    let old_prefix = {
        let info = client.info.read();
        Prefix::User(info.nick.clone(), info.username.clone(), info.host.clone())
    };
    nexus.registry.change_nick(client, new_nick);
    client.info.write().tsinfo = now;

    let change = Message {
        prefix: Some(old_prefix),
        command: Command::Nick {
            nick: new_nick.to_string(),
            ts: None,
        },
    };
    client.send(change);
    let uid = client.use_id();
    sendto_server(
        nexus,
        None,
        0,
        0,
        &Message::from_server(
            &uid,
            Command::Nick {
                nick: new_nick.to_string(),
                ts: Some(now),
            },
        ),
    );
}

/// Deliver a private message, charging the target-change ring for
/// unsolicited recipients.
fn deliver_message(nexus: &Nexus, client: &Arc<Client>, target: &str, text: &str, notice: bool) {
    let config = nexus.config();

    if target.starts_with('#') {
        // Channel delivery: local members hear it, peers route it on.
        let Some(chan) = nexus.channels.get(target) else {
            if !notice {
                client.send(Message::from_server(
                    &nexus.me.name,
                    Command::Numeric(
                        "401".into(),
                        vec![client.nick(), target.into(), "No such nick/channel".into()],
                    ),
                ));
            }
            return;
        };
        let prefix = {
            let info = client.info.read();
            Prefix::User(info.nick.clone(), info.username.clone(), info.host.clone())
        };
        let command = if notice {
            Command::Notice {
                target: target.to_string(),
                text: text.to_string(),
            }
        } else {
            Command::Privmsg {
                target: target.to_string(),
                text: text.to_string(),
            }
        };
        let fanout = Message {
            prefix: Some(prefix),
            command: command.clone(),
        };
        let self_uid = client.use_id();
        for member in chan.read().members.keys() {
            if member == &self_uid {
                continue;
            }
            if let Some(peer) = nexus.registry.find_uid(member) {
                if peer.is_local() && !peer.send(fanout.clone()) {
                    nexus.registry.abort_client(&peer, "Max SendQ exceeded");
                }
            }
        }
        sendto_server(nexus, None, 0, 0, &Message::from_server(&self_uid, command));
        return;
    }

    let Some(recipient) = nexus.registry.find_any(target) else {
        if !notice {
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "401".into(),
                    vec![client.nick(), target.into(), "No such nick/channel".into()],
                ),
            ));
        }
        return;
    };

    // Target-change accounting for person-to-person traffic.
    let is_service = recipient.status() == Status::Service;
    let flood_exempt = client
        .local
        .as_ref()
        .and_then(|l| l.att_conf.lock().clone())
        .is_some_and(|conf| conf.has_flag(crate::bans::conf_flags::EXEMPT_FLOOD));
    let is_oper = client
        .local
        .as_ref()
        .is_some_and(|l| l.oper_name.lock().is_some());
    if config.general.target_change
        && !is_service
        && !flood_exempt
        && !is_oper
        && !Arc::ptr_eq(&recipient, client)
    {
        let allowed = client.local.as_ref().is_some_and(|l| {
            l.targets.lock().check_target(
                &recipient.use_id(),
                nexus.now(),
                config.general.target_change_interval as i64,
            )
        });
        if !allowed {
            ServerStats::bump(&nexus.stats.target_change_blocks);
            client.send(Message::from_server(
                &nexus.me.name,
                Command::Numeric(
                    "707".into(),
                    vec![
                        client.nick(),
                        target.into(),
                        "Targets changing too fast, message dropped".into(),
                    ],
                ),
            ));
            return;
        }
    }

    // The recipient may always answer back.
    if let Some(recipient_local) = &recipient.local {
        recipient_local
            .targets
            .lock()
            .add_reply_target(&client.use_id());
    }

    let command = if notice {
        Command::Notice {
            target: recipient.nick(),
            text: text.to_string(),
        }
    } else {
        Command::Privmsg {
            target: recipient.nick(),
            text: text.to_string(),
        }
    };

    if recipient.is_local() {
        let prefix = {
            let info = client.info.read();
            Prefix::User(info.nick.clone(), info.username.clone(), info.host.clone())
        };
        if !recipient.send(Message {
            prefix: Some(prefix),
            command,
        }) {
            nexus.registry.abort_client(&recipient, "Max SendQ exceeded");
        }
    } else {
        // Route toward the link the recipient sits behind.
        let from = recipient.info.read().from.clone();
        if let Some(peer) = from.and_then(|sid| nexus.peers.get(&sid)) {
            let wire = Message::from_server(
                &client.use_id(),
                if notice {
                    Command::Notice {
                        target: recipient.use_id(),
                        text: text.to_string(),
                    }
                } else {
                    Command::Privmsg {
                        target: recipient.use_id(),
                        text: text.to_string(),
                    }
                },
            );
            if !peer.send(wire) {
                nexus
                    .registry
                    .abort_client(&peer.client, "Max SendQ exceeded");
            }
        }
    }
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

                [[class]]
                name = "lab"
                max_total = 1000
                max_local_per_ip = 0
                max_global_per_ip = 0
                max_ident_per_ip = 0

                [[auth]]
                user = ["*@*"]
                class = "lab"
                "#,
            )
            .unwrap(),
        )
    }

    fn fresh_client(
        nexus: &Nexus,
    ) -> (Arc<Client>, tokio::sync::mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Client::new_local(
            nexus.connids.alloc(),
            tx,
            "192.0.2.7".parse().unwrap(),
            nexus.now(),
            1 << 20,
        );
        nexus.registry.add_unknown(client.clone());
        (client, rx)
    }

    /// Simulate the auth subtasks having settled.
    fn settle_auth(client: &Arc<Client>) {
        if let Some(pre_state) = client.preclient.lock().as_mut() {
            pre_state.pending &= pre::REGISTRATION;
        }
    }

    fn register(nexus: &Arc<Nexus>, client: &Arc<Client>, nick: &str) {
        settle_auth(client);
        dispatch(nexus, client, Message::new(Command::Nick { nick: nick.into(), ts: None }));
        dispatch(
            nexus,
            client,
            Message::new(Command::User {
                username: "user".into(),
                realname: "Real".into(),
            }),
        );
    }

    #[test]
    fn nick_and_user_complete_registration() {
        let nexus = nexus();
        let (client, mut rx) = fresh_client(&nexus);
        register(&nexus, &client, "alice");

        assert_eq!(client.status(), Status::Client);
        // Welcome numeric reached the queue.
        let mut saw_welcome = false;
        while let Ok(msg) = rx.try_recv() {
            if matches!(&msg.command, Command::Numeric(code, _) if code == "001") {
                saw_welcome = true;
            }
        }
        assert!(saw_welcome);
    }

    #[test]
    fn registration_waits_for_subtasks() {
        let nexus = nexus();
        let (client, _rx) = fresh_client(&nexus);
        // DNS still outstanding.
        if let Some(pre_state) = client.preclient.lock().as_mut() {
            pre_state.pending |= pre::DNS;
        }
        dispatch(&nexus, &client, Message::new(Command::Nick { nick: "alice".into(), ts: None }));
        dispatch(
            &nexus,
            &client,
            Message::new(Command::User {
                username: "user".into(),
                realname: "Real".into(),
            }),
        );
        assert_eq!(client.status(), Status::Unknown);

        // The last bit clearing releases the verifier.
        if let Some(pre_state) = client.preclient.lock().as_mut() {
            pre_state.pending &= !pre::DNS;
        }
        try_register(&nexus, &client);
        assert_eq!(client.status(), Status::Client);
    }

    #[test]
    fn in_use_nick_is_bounced_pre_registration() {
        let nexus = nexus();
        let (first, _rx1) = fresh_client(&nexus);
        register(&nexus, &first, "alice");

        let (second, mut rx2) = fresh_client(&nexus);
        settle_auth(&second);
        dispatch(&nexus, &second, Message::new(Command::Nick { nick: "Alice".into(), ts: None }));
        let mut saw_433 = false;
        while let Ok(msg) = rx2.try_recv() {
            if matches!(&msg.command, Command::Numeric(code, _) if code == "433") {
                saw_433 = true;
            }
        }
        assert!(saw_433);
    }

    #[test]
    fn ping_cookie_gates_registration() {
        let nexus = nexus();
        let (client, _rx) = fresh_client(&nexus);
        settle_auth(&client);
        if let Some(pre_state) = client.preclient.lock().as_mut() {
            pre_state.pending |= pre::PING_COOKIE;
            pre_state.ping_cookie = Some("C00KIE99".into());
        }
        dispatch(&nexus, &client, Message::new(Command::Nick { nick: "alice".into(), ts: None }));
        dispatch(
            &nexus,
            &client,
            Message::new(Command::User {
                username: "user".into(),
                realname: "Real".into(),
            }),
        );
        assert_eq!(client.status(), Status::Unknown);

        // Wrong cookie does nothing.
        dispatch(
            &nexus,
            &client,
            Message::new(Command::Pong {
                source: "WRONG".into(),
                token: None,
            }),
        );
        assert_eq!(client.status(), Status::Unknown);

        dispatch(
            &nexus,
            &client,
            Message::new(Command::Pong {
                source: "C00KIE99".into(),
                token: None,
            }),
        );
        assert_eq!(client.status(), Status::Client);
    }

    #[test]
    fn target_change_blocks_twenty_first_target() {
        let nexus = nexus();
        let (sender, mut sender_rx) = fresh_client(&nexus);
        register(&nexus, &sender, "sender");
        while sender_rx.try_recv().is_ok() {}

        // A score of living targets.
        for i in 0..crate::state::targets::TGCHANGE_INITIAL {
            let (target, _rx) = fresh_client(&nexus);
            register(&nexus, &target, &format!("t{i}"));
        }
        for i in 0..crate::state::targets::TGCHANGE_INITIAL {
            deliver_message(&nexus, &sender, &format!("t{i}"), "hi", false);
        }
        let (extra, _rx) = fresh_client(&nexus);
        register(&nexus, &extra, "extra");
        deliver_message(&nexus, &sender, "extra", "hi", false);

        let mut saw_too_fast = false;
        while let Ok(msg) = sender_rx.try_recv() {
            if matches!(&msg.command, Command::Numeric(code, _) if code == "707") {
                saw_too_fast = true;
            }
        }
        assert!(saw_too_fast);
        assert_eq!(ServerStats::get(&nexus.stats.target_change_blocks), 1);
    }

    #[test]
    fn recipient_can_always_reply() {
        let nexus = nexus();
        let (sender, _srx) = fresh_client(&nexus);
        register(&nexus, &sender, "sender");
        let (recipient, mut rrx) = fresh_client(&nexus);
        register(&nexus, &recipient, "friend");
        while rrx.try_recv().is_ok() {}

        // Exhaust the recipient's own free slots entirely.
        for i in 0..crate::state::targets::TGCHANGE_INITIAL {
            let (t, _rx) = fresh_client(&nexus);
            register(&nexus, &t, &format!("r{i}"));
            deliver_message(&nexus, &recipient, &format!("r{i}"), "hi", false);
        }

        // Sender messages the recipient; the reply slot lets the
        // recipient answer even with zero free slots.
        deliver_message(&nexus, &sender, "friend", "hello", false);
        deliver_message(&nexus, &recipient, "sender", "hello back", false);

        let mut got_reply = false;
        let mut srx = _srx;
        while let Ok(msg) = srx.try_recv() {
            if matches!(&msg.command, Command::Privmsg { .. }) {
                got_reply = true;
            }
        }
        assert!(got_reply);
    }

    #[test]
    fn unknown_registered_command_gets_421() {
        let nexus = nexus();
        let (client, mut rx) = fresh_client(&nexus);
        register(&nexus, &client, "alice");
        while rx.try_recv().is_ok() {}
        dispatch(
            &nexus,
            &client,
            Message::new(Command::Raw("FROBNICATE".into(), vec![])),
        );
        let msg = rx.try_recv().unwrap();
        assert!(matches!(&msg.command, Command::Numeric(code, _) if code == "421"));
        assert_eq!(ServerStats::get(&nexus.stats.unknown_commands), 1);
    }

    #[test]
    fn quit_exits_with_prefixed_reason() {
        let nexus = nexus();
        let (client, _rx) = fresh_client(&nexus);
        register(&nexus, &client, "alice");
        dispatch(&nexus, &client, Message::new(Command::Quit(Some("bye".into()))));
        assert_eq!(client.status(), Status::Dead);
        assert!(nexus.registry.find_nick("alice").is_none());
    }
}
