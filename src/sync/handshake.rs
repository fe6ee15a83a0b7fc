//! Server link handshake.
//!
//! A link comes up through a strict exchange: `PASS <pw> TS 6 :<sid>`,
//! `CAPAB`, `SERVER`, then `SVINFO` to compare clocks. The machine
//! here is pure: it consumes commands and the connect-block table and
//! yields replies to send plus a completion record, so the whole
//! negotiation is testable without sockets.

use ferric_proto::validation::is_valid_sid;
use ferric_proto::{wildcard_match, Command};

use crate::config::{Config, ConnectBlock};
use crate::error::LinkError;
use crate::sync::caps::{self, cap};

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed; our PASS/CAPAB/SERVER are already on the wire.
    Outbound,
    /// They dialed; we answer once their half checks out.
    Inbound,
}

/// Everything known about the peer once the handshake completes.
#[derive(Debug, Clone)]
pub struct Established {
    pub name: String,
    pub sid: String,
    pub info: String,
    /// Negotiated capability set (ours AND theirs), after conf
    /// suppression of ZIP and TB.
    pub caps: u32,
    /// The peer's full advertised capability string, for GCAP.
    pub fullcaps: String,
    pub block: ConnectBlock,
}

/// Stepping result: replies to transmit, and completion when done.
#[derive(Debug, Default)]
pub struct StepOutput {
    pub send: Vec<Command>,
    pub established: Option<Established>,
}

#[derive(Debug)]
pub struct HandshakeMachine {
    direction: Direction,
    local_name: String,
    local_sid: String,
    local_info: String,
    /// The peer's resolved DNS name and numeric host, for the
    /// connect-block host check.
    peer_dns: Option<String>,
    peer_sockhost: String,
    peer_is_tls: bool,

    pass: Option<(String, String)>,
    capab: Option<Vec<String>>,
    server: Option<(String, String)>,
    svinfo_time: Option<i64>,
    sid: Option<String>,
    /// Set once our own PASS/CAPAB/SERVER went out.
    sent_ours: bool,
}

impl HandshakeMachine {
    pub fn new(
        direction: Direction,
        local_name: &str,
        local_sid: &str,
        local_info: &str,
        peer_dns: Option<&str>,
        peer_sockhost: &str,
        peer_is_tls: bool,
    ) -> HandshakeMachine {
        HandshakeMachine {
            direction,
            local_name: local_name.to_string(),
            local_sid: local_sid.to_string(),
            local_info: local_info.to_string(),
            peer_dns: peer_dns.map(str::to_string),
            peer_sockhost: peer_sockhost.to_string(),
            peer_is_tls,
            pass: None,
            capab: None,
            server: None,
            svinfo_time: None,
            sid: None,
            sent_ours: direction == Direction::Outbound,
        }
    }

    /// The opening volley for an outbound link.
    pub fn opening(block: &ConnectBlock, local_name: &str, local_sid: &str, local_info: &str) -> Vec<Command> {
        vec![
            Command::Pass {
                password: block.send_password.clone(),
                sid: local_sid.to_string(),
            },
            Command::Capab(caps::caps_to_names(caps::our_caps())),
            Command::Server {
                name: local_name.to_string(),
                hopcount: 1,
                info: local_info.to_string(),
            },
        ]
    }

    /// Feed one inbound command. Errors are fatal to the link.
    pub fn step(
        &mut self,
        command: Command,
        config: &Config,
        now: i64,
        already_linked: impl Fn(&str) -> bool,
    ) -> Result<StepOutput, LinkError> {
        match command {
            Command::Pass { password, sid } => {
                if !is_valid_sid(&sid) {
                    return Err(LinkError::InvalidSid(sid));
                }
                self.pass = Some((password, sid.clone()));
                self.sid = Some(sid);
            }
            Command::Capab(list) => {
                self.capab = Some(list);
            }
            Command::Server { name, info, .. } => {
                if self.pass.is_none() || self.capab.is_none() {
                    return Err(LinkError::OutOfOrder("SERVER".into()));
                }
                if !name.contains('.') {
                    return Err(LinkError::InvalidName(name));
                }
                self.server = Some((name, info));
            }
            Command::Svinfo { time, .. } => {
                if self.server.is_none() {
                    return Err(LinkError::OutOfOrder("SVINFO".into()));
                }
                self.svinfo_time = Some(time);
            }
            other => {
                return Err(LinkError::OutOfOrder(other.verb()));
            }
        }
        self.advance(config, now, already_linked)
    }

    fn advance(
        &mut self,
        config: &Config,
        now: i64,
        already_linked: impl Fn(&str) -> bool,
    ) -> Result<StepOutput, LinkError> {
        let mut out = StepOutput::default();

        let Some((name, _)) = &self.server else {
            return Ok(out);
        };

        // With PASS/CAPAB/SERVER in hand the peer can be verified and
        // our half sent; SVINFO still gates completion.
        let block = self.verify(config, name)?;
        if already_linked(name) || already_linked(self.sid.as_deref().unwrap_or("")) {
            return Err(LinkError::AlreadyLinked(name.clone()));
        }

        if !self.sent_ours {
            out.send.extend(Self::opening(
                &block,
                &self.local_name,
                &self.local_sid,
                &self.local_info,
            ));
            out.send.push(Command::Svinfo {
                ts_current: 6,
                ts_min: 6,
                time: now,
            });
            self.sent_ours = true;
        }

        let Some(peer_time) = self.svinfo_time else {
            return Ok(out);
        };

        let delta = (now - peer_time).abs();
        if delta > config.general.ts_max_delta {
            return Err(LinkError::ClockSkew(delta));
        }

        // Outbound answers the peer's SVINFO with its own.
        if self.direction == Direction::Outbound {
            out.send.push(Command::Svinfo {
                ts_current: 6,
                ts_min: 6,
                time: now,
            });
        }

        let advertised = self.capab.clone().unwrap_or_default();
        let mut negotiated = caps::our_caps() & caps::parse_caps(&advertised);
        if !block.compressed {
            negotiated &= !cap::ZIP;
        }
        if !block.topic_burst {
            negotiated &= !cap::TB;
        }

        let (name, info) = self.server.clone().unwrap_or_default();
        out.established = Some(Established {
            sid: self.sid.clone().unwrap_or_default(),
            name,
            info,
            caps: negotiated,
            fullcaps: advertised.join(" "),
            block,
        });
        Ok(out)
    }

    fn verify(&self, config: &Config, name: &str) -> Result<ConnectBlock, LinkError> {
        let block = config
            .connect
            .iter()
            .find(|b| ferric_proto::irc_eq(&b.name, name))
            .ok_or_else(|| LinkError::NoConnectBlock(name.to_string()))?;

        let supplied = self
            .pass
            .as_ref()
            .map(|(pw, _)| pw.as_str())
            .unwrap_or_default();
        let expected = &block.accept_password;
        let password_ok = if block.encrypted {
            bcrypt::verify(supplied, expected).unwrap_or(false)
        } else {
            // Constant-time enough for a line protocol; the real
            // defence is the host check below.
            supplied == expected
        };
        if !password_ok {
            return Err(LinkError::BadPassword(name.to_string()));
        }

        // The peer must arrive from where the block says it lives:
        // match against the resolved name or the numeric host.
        let host_ok = wildcard_match(&block.host, &self.peer_sockhost)
            || self
                .peer_dns
                .as_deref()
                .is_some_and(|dns| wildcard_match(&block.host, dns));
        if !host_ok && self.direction == Direction::Inbound {
            return Err(LinkError::HostMismatch(name.to_string()));
        }

        if block.tls && !self.peer_is_tls {
            return Err(LinkError::NeedTls(name.to_string()));
        }

        Ok(block.clone())
    }

    /// Hub/leaf enforcement for servers introduced behind this link.
    pub fn may_introduce(block: &ConnectBlock, introduced: &str) -> Result<(), LinkError> {
        for leaf in &block.leaf_mask {
            if wildcard_match(leaf, introduced) {
                return Err(LinkError::HubRule(format!(
                    "{introduced} is leafed by {leaf}"
                )));
            }
        }
        if block.hub_mask.is_empty() {
            return Err(LinkError::HubRule(format!(
                "{introduced} introduced by a leaf link"
            )));
        }
        if !block
            .hub_mask
            .iter()
            .any(|hub| wildcard_match(hub, introduced))
        {
            return Err(LinkError::HubRule(format!(
                "{introduced} matches no hub mask"
            )));
        }
        Ok(())
    }
}
