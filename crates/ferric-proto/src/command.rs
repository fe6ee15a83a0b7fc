//! Typed IRC commands.
//!
//! Every message the mesh core emits or consumes gets a typed variant;
//! anything else rides through `Raw` untouched so unknown extensions
//! survive relaying.

use crate::error::ProtocolError;

/// Install or removal marker on a propagated `BAN`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BanAction {
    Add,
    Remove,
}

impl BanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanAction::Add => "+",
            BanAction::Remove => "-",
        }
    }
}

/// An IRC command with its parameters.
#[derive(Clone, PartialEq, Debug)]
pub enum Command {
    // ------------------------------------------------------------------
    // Link handshake
    // ------------------------------------------------------------------
    /// `PASS <password> TS 6 :<sid>` — TS6 link handshake.
    Pass { password: String, sid: String },
    /// `PASS <password>` — client-supplied connection password.
    ClientPass(String),
    /// `CAPAB :<cap> <cap> ...`
    Capab(Vec<String>),
    /// `SERVER <name> <hopcount> :<info>`
    Server {
        name: String,
        hopcount: u32,
        info: String,
    },
    /// `SID <name> <hopcount> <sid> :<info>` — remote server introduction.
    Sid {
        name: String,
        hopcount: u32,
        sid: String,
        info: String,
    },
    /// `SVINFO <ts_current> <ts_min> 0 :<time>`
    Svinfo {
        ts_current: u32,
        ts_min: u32,
        time: i64,
    },

    // ------------------------------------------------------------------
    // Burst / state
    // ------------------------------------------------------------------
    /// `EUID <nick> <hops> <ts> <umodes> <user> <host> <ip> <uid> <orighost> <login> :<info>`
    Euid {
        nick: String,
        hopcount: u32,
        ts: i64,
        umodes: String,
        username: String,
        hostname: String,
        ip: String,
        uid: String,
        orig_host: String,
        login: String,
        info: String,
    },
    /// `UID <nick> <hops> <ts> <umodes> <user> <host> <ip> <uid> :<info>` — pre-EUID form.
    Uid {
        nick: String,
        hopcount: u32,
        ts: i64,
        umodes: String,
        username: String,
        hostname: String,
        ip: String,
        uid: String,
        info: String,
    },
    /// `SJOIN <ts> <channel> <modes> [args...] :<prefixed members>`
    Sjoin {
        ts: i64,
        channel: String,
        modes: String,
        mode_args: Vec<String>,
        members: Vec<String>,
    },
    /// `BMASK <ts> <channel> <list> :<masks>`
    Bmask {
        ts: i64,
        channel: String,
        list: char,
        masks: Vec<String>,
    },
    /// `TB <channel> <ts> [setter] :<topic>` — topic burst.
    Tb {
        channel: String,
        ts: i64,
        setter: Option<String>,
        topic: String,
    },
    /// `MLOCK <ts> <channel> :<modes>`
    Mlock {
        ts: i64,
        channel: String,
        modes: String,
    },
    /// `BAN <+|-> <K|D|X|R> <user|*> <host> <created> <duration> <lifetime> <oper|*> :<reason>`
    Ban {
        action: BanAction,
        kind: char,
        user: String,
        host: String,
        created: i64,
        duration: i64,
        lifetime: i64,
        oper: String,
        reason: String,
    },
    /// `ENCAP <target> <subcommand> <params...>` — extension envelope.
    Encap {
        target: String,
        subcommand: String,
        params: Vec<String>,
    },

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------
    /// `SQUIT <server> :<reason>`
    Squit { server: String, reason: String },
    /// `QUIT [:<reason>]`
    Quit(Option<String>),
    /// `KILL <target> :<path>`
    Kill { target: String, path: String },
    /// `ERROR :<reason>`
    Error(String),
    /// `PING <token> [<target>]`
    Ping {
        token: String,
        target: Option<String>,
    },
    /// `PONG <source> [:<token>]`
    Pong {
        source: String,
        token: Option<String>,
    },

    // ------------------------------------------------------------------
    // Client registration & messaging (the slice the core handles)
    // ------------------------------------------------------------------
    /// `NICK <nick> [:<ts>]` — ts present on TS6 links.
    Nick { nick: String, ts: Option<i64> },
    /// `USER <username> <mode> <unused> :<realname>`
    User {
        username: String,
        realname: String,
    },
    /// `PRIVMSG <target> :<text>`
    Privmsg { target: String, text: String },
    /// `NOTICE <target> :<text>`
    Notice { target: String, text: String },
    /// `AWAY [:<message>]`
    Away(Option<String>),

    /// A three-digit numeric reply.
    Numeric(String, Vec<String>),
    /// Unknown verb, passed through verbatim.
    Raw(String, Vec<String>),
}

fn req<'a>(params: &'a [&str], idx: usize, verb: &str) -> Result<&'a str, ProtocolError> {
    params.get(idx).copied().ok_or(ProtocolError::MissingParams {
        verb: verb.to_string(),
    })
}

fn num<T: std::str::FromStr>(s: &str, verb: &str) -> Result<T, ProtocolError> {
    s.parse().map_err(|_| ProtocolError::InvalidParam {
        verb: verb.to_string(),
        param: s.to_string(),
    })
}

fn owned(params: &[&str]) -> Vec<String> {
    params.iter().map(|s| s.to_string()).collect()
}

impl Command {
    /// Build a typed command from a verb and raw parameters.
    pub fn from_parts(verb: &str, params: &[&str]) -> Result<Command, ProtocolError> {
        let upper = verb.to_ascii_uppercase();
        if upper.len() == 3 && upper.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Command::Numeric(upper, owned(params)));
        }

        let cmd = match upper.as_str() {
            "PASS" => {
                // The TS6 form carries exactly "TS 6" in the middle.
                if params.len() >= 4 && params[1].eq_ignore_ascii_case("TS") && params[2] == "6" {
                    Command::Pass {
                        password: params[0].to_string(),
                        sid: params[3].to_string(),
                    }
                } else {
                    Command::ClientPass(req(params, 0, &upper)?.to_string())
                }
            }
            "CAPAB" => Command::Capab(
                params
                    .iter()
                    .flat_map(|p| p.split_whitespace())
                    .map(str::to_string)
                    .collect(),
            ),
            "SERVER" => Command::Server {
                name: req(params, 0, &upper)?.to_string(),
                hopcount: num(req(params, 1, &upper)?, &upper)?,
                info: req(params, 2, &upper)?.to_string(),
            },
            "SID" => Command::Sid {
                name: req(params, 0, &upper)?.to_string(),
                hopcount: num(req(params, 1, &upper)?, &upper)?,
                sid: req(params, 2, &upper)?.to_string(),
                info: req(params, 3, &upper)?.to_string(),
            },
            "SVINFO" => Command::Svinfo {
                ts_current: num(req(params, 0, &upper)?, &upper)?,
                ts_min: num(req(params, 1, &upper)?, &upper)?,
                time: num(req(params, 3, &upper)?, &upper)?,
            },
            "EUID" => Command::Euid {
                nick: req(params, 0, &upper)?.to_string(),
                hopcount: num(req(params, 1, &upper)?, &upper)?,
                ts: num(req(params, 2, &upper)?, &upper)?,
                umodes: req(params, 3, &upper)?.to_string(),
                username: req(params, 4, &upper)?.to_string(),
                hostname: req(params, 5, &upper)?.to_string(),
                ip: req(params, 6, &upper)?.to_string(),
                uid: req(params, 7, &upper)?.to_string(),
                orig_host: req(params, 8, &upper)?.to_string(),
                login: req(params, 9, &upper)?.to_string(),
                info: req(params, 10, &upper)?.to_string(),
            },
            "UID" => Command::Uid {
                nick: req(params, 0, &upper)?.to_string(),
                hopcount: num(req(params, 1, &upper)?, &upper)?,
                ts: num(req(params, 2, &upper)?, &upper)?,
                umodes: req(params, 3, &upper)?.to_string(),
                username: req(params, 4, &upper)?.to_string(),
                hostname: req(params, 5, &upper)?.to_string(),
                ip: req(params, 6, &upper)?.to_string(),
                uid: req(params, 7, &upper)?.to_string(),
                info: req(params, 8, &upper)?.to_string(),
            },
            "SJOIN" => {
                if params.len() < 4 {
                    return Err(ProtocolError::MissingParams { verb: upper });
                }
                Command::Sjoin {
                    ts: num(params[0], &upper)?,
                    channel: params[1].to_string(),
                    modes: params[2].to_string(),
                    mode_args: owned(&params[3..params.len() - 1]),
                    members: params[params.len() - 1]
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                }
            }
            "BMASK" => Command::Bmask {
                ts: num(req(params, 0, &upper)?, &upper)?,
                channel: req(params, 1, &upper)?.to_string(),
                list: req(params, 2, &upper)?
                    .chars()
                    .next()
                    .ok_or(ProtocolError::MissingParams { verb: upper.clone() })?,
                masks: req(params, 3, &upper)?
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            },
            "TB" => {
                // TB <channel> <ts> [setter] :<topic>
                if params.len() < 3 {
                    return Err(ProtocolError::MissingParams { verb: upper });
                }
                Command::Tb {
                    channel: params[0].to_string(),
                    ts: num(params[1], &upper)?,
                    setter: if params.len() > 3 {
                        Some(params[2].to_string())
                    } else {
                        None
                    },
                    topic: params[params.len() - 1].to_string(),
                }
            }
            "MLOCK" => Command::Mlock {
                ts: num(req(params, 0, &upper)?, &upper)?,
                channel: req(params, 1, &upper)?.to_string(),
                modes: req(params, 2, &upper)?.to_string(),
            },
            "BAN" => {
                let action = match req(params, 0, &upper)? {
                    "+" => BanAction::Add,
                    "-" => BanAction::Remove,
                    other => {
                        return Err(ProtocolError::InvalidParam {
                            verb: upper,
                            param: other.to_string(),
                        })
                    }
                };
                Command::Ban {
                    action,
                    kind: req(params, 1, &upper)?
                        .chars()
                        .next()
                        .ok_or(ProtocolError::MissingParams { verb: upper.clone() })?,
                    user: req(params, 2, &upper)?.to_string(),
                    host: req(params, 3, &upper)?.to_string(),
                    created: num(req(params, 4, &upper)?, &upper)?,
                    duration: num(req(params, 5, &upper)?, &upper)?,
                    lifetime: num(req(params, 6, &upper)?, &upper)?,
                    oper: req(params, 7, &upper)?.to_string(),
                    reason: req(params, 8, &upper)?.to_string(),
                }
            }
            "ENCAP" => Command::Encap {
                target: req(params, 0, &upper)?.to_string(),
                subcommand: req(params, 1, &upper)?.to_string(),
                params: owned(params.get(2..).unwrap_or(&[])),
            },
            "SQUIT" => Command::Squit {
                server: req(params, 0, &upper)?.to_string(),
                reason: params.get(1).unwrap_or(&"").to_string(),
            },
            "QUIT" => Command::Quit(params.first().map(|s| s.to_string())),
            "KILL" => Command::Kill {
                target: req(params, 0, &upper)?.to_string(),
                path: req(params, 1, &upper)?.to_string(),
            },
            "ERROR" => Command::Error(req(params, 0, &upper)?.to_string()),
            "PING" => Command::Ping {
                token: req(params, 0, &upper)?.to_string(),
                target: params.get(1).map(|s| s.to_string()),
            },
            "PONG" => Command::Pong {
                source: req(params, 0, &upper)?.to_string(),
                token: params.get(1).map(|s| s.to_string()),
            },
            "NICK" => Command::Nick {
                nick: req(params, 0, &upper)?.to_string(),
                ts: match params.get(1) {
                    Some(p) => Some(num(p, &upper)?),
                    None => None,
                },
            },
            "USER" => Command::User {
                username: req(params, 0, &upper)?.to_string(),
                realname: req(params, 3, &upper)?.to_string(),
            },
            "PRIVMSG" => Command::Privmsg {
                target: req(params, 0, &upper)?.to_string(),
                text: req(params, 1, &upper)?.to_string(),
            },
            "NOTICE" => Command::Notice {
                target: req(params, 0, &upper)?.to_string(),
                text: req(params, 1, &upper)?.to_string(),
            },
            "AWAY" => Command::Away(params.first().filter(|s| !s.is_empty()).map(|s| s.to_string())),
            _ => Command::Raw(upper, owned(params)),
        };
        Ok(cmd)
    }

    /// Decompose into `(verb, params, force_trailing_on_last)`.
    pub fn to_parts(&self) -> (String, Vec<String>, bool) {
        match self {
            Command::Pass { password, sid } => (
                "PASS".into(),
                vec![password.clone(), "TS".into(), "6".into(), sid.clone()],
                true,
            ),
            Command::ClientPass(pw) => ("PASS".into(), vec![pw.clone()], false),
            Command::Capab(caps) => ("CAPAB".into(), vec![caps.join(" ")], true),
            Command::Server {
                name,
                hopcount,
                info,
            } => (
                "SERVER".into(),
                vec![name.clone(), hopcount.to_string(), info.clone()],
                true,
            ),
            Command::Sid {
                name,
                hopcount,
                sid,
                info,
            } => (
                "SID".into(),
                vec![
                    name.clone(),
                    hopcount.to_string(),
                    sid.clone(),
                    info.clone(),
                ],
                true,
            ),
            Command::Svinfo {
                ts_current,
                ts_min,
                time,
            } => (
                "SVINFO".into(),
                vec![
                    ts_current.to_string(),
                    ts_min.to_string(),
                    "0".into(),
                    time.to_string(),
                ],
                true,
            ),
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
            } => (
                "EUID".into(),
                vec![
                    nick.clone(),
                    hopcount.to_string(),
                    ts.to_string(),
                    umodes.clone(),
                    username.clone(),
                    hostname.clone(),
                    ip.clone(),
                    uid.clone(),
                    orig_host.clone(),
                    login.clone(),
                    info.clone(),
                ],
                true,
            ),
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
            } => (
                "UID".into(),
                vec![
                    nick.clone(),
                    hopcount.to_string(),
                    ts.to_string(),
                    umodes.clone(),
                    username.clone(),
                    hostname.clone(),
                    ip.clone(),
                    uid.clone(),
                    info.clone(),
                ],
                true,
            ),
            Command::Sjoin {
                ts,
                channel,
                modes,
                mode_args,
                members,
            } => {
                let mut params = vec![ts.to_string(), channel.clone(), modes.clone()];
                params.extend(mode_args.iter().cloned());
                params.push(members.join(" "));
                ("SJOIN".into(), params, true)
            }
            Command::Bmask {
                ts,
                channel,
                list,
                masks,
            } => (
                "BMASK".into(),
                vec![
                    ts.to_string(),
                    channel.clone(),
                    list.to_string(),
                    masks.join(" "),
                ],
                true,
            ),
            Command::Tb {
                channel,
                ts,
                setter,
                topic,
            } => {
                let mut params = vec![channel.clone(), ts.to_string()];
                if let Some(s) = setter {
                    params.push(s.clone());
                }
                params.push(topic.clone());
                ("TB".into(), params, true)
            }
            Command::Mlock { ts, channel, modes } => (
                "MLOCK".into(),
                vec![ts.to_string(), channel.clone(), modes.clone()],
                true,
            ),
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
            } => (
                "BAN".into(),
                vec![
                    action.as_str().into(),
                    kind.to_string(),
                    user.clone(),
                    host.clone(),
                    created.to_string(),
                    duration.to_string(),
                    lifetime.to_string(),
                    oper.clone(),
                    reason.clone(),
                ],
                true,
            ),
            Command::Encap {
                target,
                subcommand,
                params,
            } => {
                let mut p = vec![target.clone(), subcommand.clone()];
                p.extend(params.iter().cloned());
                ("ENCAP".into(), p, false)
            }
            Command::Squit { server, reason } => (
                "SQUIT".into(),
                vec![server.clone(), reason.clone()],
                true,
            ),
            Command::Quit(reason) => (
                "QUIT".into(),
                reason.iter().cloned().collect(),
                true,
            ),
            Command::Kill { target, path } => {
                ("KILL".into(), vec![target.clone(), path.clone()], true)
            }
            Command::Error(reason) => ("ERROR".into(), vec![reason.clone()], true),
            Command::Ping { token, target } => {
                let mut params = vec![token.clone()];
                if let Some(t) = target {
                    params.push(t.clone());
                }
                ("PING".into(), params, target.is_none())
            }
            Command::Pong { source, token } => {
                let mut params = vec![source.clone()];
                if let Some(t) = token {
                    params.push(t.clone());
                }
                ("PONG".into(), params, token.is_some())
            }
            Command::Nick { nick, ts } => {
                let mut params = vec![nick.clone()];
                if let Some(t) = ts {
                    params.push(t.to_string());
                }
                ("NICK".into(), params, ts.is_some())
            }
            Command::User { username, realname } => (
                "USER".into(),
                vec![
                    username.clone(),
                    "0".into(),
                    "*".into(),
                    realname.clone(),
                ],
                true,
            ),
            Command::Privmsg { target, text } => (
                "PRIVMSG".into(),
                vec![target.clone(), text.clone()],
                true,
            ),
            Command::Notice { target, text } => (
                "NOTICE".into(),
                vec![target.clone(), text.clone()],
                true,
            ),
            Command::Away(message) => {
                ("AWAY".into(), message.iter().cloned().collect(), true)
            }
            Command::Numeric(code, params) => (code.clone(), params.clone(), true),
            Command::Raw(verb, params) => (verb.clone(), params.clone(), false),
        }
    }

    /// The verb this command serializes as.
    pub fn verb(&self) -> String {
        self.to_parts().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(verb: &str, params: &[&str]) -> Command {
        Command::from_parts(verb, params).unwrap()
    }

    #[test]
    fn pass_ts6_form() {
        let cmd = parts("PASS", &["hunter2", "TS", "6", "42X"]);
        assert_eq!(
            cmd,
            Command::Pass {
                password: "hunter2".into(),
                sid: "42X".into()
            }
        );
    }

    #[test]
    fn pass_client_form() {
        assert_eq!(
            parts("PASS", &["secret"]),
            Command::ClientPass("secret".into())
        );
    }

    #[test]
    fn capab_splits_caps() {
        let cmd = parts("CAPAB", &["QS EX IE BAN"]);
        assert_eq!(
            cmd,
            Command::Capab(vec!["QS".into(), "EX".into(), "IE".into(), "BAN".into()])
        );
    }

    #[test]
    fn euid_all_eleven_params() {
        let cmd = parts(
            "EUID",
            &[
                "alice", "1", "1700000000", "+i", "~alice", "cloak.example", "192.0.2.7",
                "42XAAAAAB", "real.example", "alice", "Alice Example",
            ],
        );
        match cmd {
            Command::Euid {
                nick, uid, login, ..
            } => {
                assert_eq!(nick, "alice");
                assert_eq!(uid, "42XAAAAAB");
                assert_eq!(login, "alice");
            }
            other => panic!("expected EUID, got {other:?}"),
        }
    }

    #[test]
    fn sjoin_members_split() {
        let cmd = parts("SJOIN", &["1700000000", "#chan", "+ntk", "key", "@42XAAAAAB +42XAAAAAC"]);
        match cmd {
            Command::Sjoin {
                mode_args, members, ..
            } => {
                assert_eq!(mode_args, vec!["key".to_string()]);
                assert_eq!(members.len(), 2);
            }
            other => panic!("expected SJOIN, got {other:?}"),
        }
    }

    #[test]
    fn ban_add_parses() {
        let cmd = parts(
            "BAN",
            &["+", "K", "bad", "badhost", "1700000000", "3600", "3600", "oper{hub}", "spamming"],
        );
        match cmd {
            Command::Ban {
                action,
                kind,
                duration,
                ..
            } => {
                assert_eq!(action, BanAction::Add);
                assert_eq!(kind, 'K');
                assert_eq!(duration, 3600);
            }
            other => panic!("expected BAN, got {other:?}"),
        }
    }

    #[test]
    fn ban_rejects_bad_action() {
        assert!(Command::from_parts(
            "BAN",
            &["?", "K", "u", "h", "0", "0", "0", "*", "r"]
        )
        .is_err());
    }

    #[test]
    fn missing_params_is_error() {
        assert!(matches!(
            Command::from_parts("SERVER", &["name"]),
            Err(ProtocolError::MissingParams { .. })
        ));
    }

    #[test]
    fn numerics_and_raw() {
        assert!(matches!(
            parts("465", &["*", "You are banned"]),
            Command::Numeric(code, _) if code == "465"
        ));
        assert!(matches!(
            parts("KNOCK", &["#chan"]),
            Command::Raw(verb, _) if verb == "KNOCK"
        ));
    }
}
