//! The Client entity.
//!
//! A `Client` represents any peer of the daemon: a pre-registration
//! connection, a local user, a local server link, a remote user, a
//! remote server, or the daemon itself. Exactly one status holds at a
//! time; the per-role side tables (`LocalClient`, `PreClient`,
//! `ServerInfo`) exist only while the matching status does.

use parking_lot::{Mutex, RwLock};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use ferric_proto::Message;

use crate::bans::ConfItem;
use crate::class::Class;
use crate::config::ConnectBlock;
use crate::state::targets::TargetRing;

/// Mutually-exclusive client status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Accepted, not yet registered.
    Unknown,
    /// Server link mid-handshake (inbound).
    Handshake,
    /// Server link we are dialing (outbound).
    Connecting,
    /// Registered user.
    Client,
    /// Registered server.
    Server,
    /// Network service.
    Service,
    /// This daemon.
    Me,
    /// KILLed, awaiting teardown.
    Killed,
    /// Teardown in progress.
    Closing,
    /// Unlinked, awaiting the free sweep.
    Dead,
}

impl Status {
    pub fn is_registered(self) -> bool {
        matches!(self, Status::Client | Status::Server | Status::Service)
    }
}

/// Client flag bits.
pub mod flags {
    /// PING sent, PONG outstanding.
    pub const PING_SENT: u32 = 1 << 0;
    /// Visible host differs from the real one via auth spoof.
    pub const DYN_SPOOF: u32 = 1 << 1;
    /// Exit already announced via KILL; suppress the QUIT fanout.
    pub const KILLED: u32 = 1 << 2;
    /// Ident lookup produced a username.
    pub const GOT_IDENT: u32 = 1 << 3;
    /// Marked during a depth-first split walk.
    pub const MARK: u32 = 1 << 4;
    /// Outbound queue overflowed; exit scheduled.
    pub const SENDQ_EXCEEDED: u32 = 1 << 5;
    /// Connection arrived through the TLS terminator.
    pub const TLS: u32 = 1 << 6;
}

/// The mutable identity of a client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Nickname; `*` until one is chosen. Servers keep their name here.
    pub nick: String,
    pub username: String,
    /// Visible hostname (post-spoof).
    pub host: String,
    /// Hostname before any spoof.
    pub orig_host: String,
    /// Textual IP, always set for local connections.
    pub sockhost: String,
    pub ip: Option<IpAddr>,
    pub realname: String,
    pub uid: Option<String>,
    /// Nickname timestamp; collision currency.
    pub tsinfo: i64,
    pub status: Status,
    pub hopcount: u32,
    /// SID of the directly-connected peer this client arrived on;
    /// `None` means local or self.
    pub from: Option<String>,
    /// SID of the server the client sits on.
    pub servptr: Option<String>,
    pub umodes: String,
    pub away: Option<String>,
    /// SASL-supplied account identity.
    pub login: Option<String>,
    pub certfp: Option<String>,
    pub flags: u32,
}

impl ClientInfo {
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u32) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u32) {
        self.flags &= !flag;
    }

    /// `user@host` of the visible identity.
    pub fn user_host(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Local-connection side table.
#[derive(Debug)]
pub struct LocalClient {
    /// Primary connection id.
    pub connid: u32,
    /// Every connid owned by this client (control channels included).
    pub connids: Mutex<Vec<u32>>,
    /// FIFO outbound queue, drained by the connection task.
    pub tx: mpsc::UnboundedSender<Message>,
    pub first_time: i64,
    /// Last activity, backdated by the ping scan.
    pub last_time: AtomicI64,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_recv: AtomicU64,
    /// Bytes sitting in the outbound queue.
    pub sendq_used: AtomicUsize,
    pub sendq_max: AtomicUsize,
    /// Attached access rule; refcounted via the ConfItem itself.
    pub att_conf: Mutex<Option<Arc<ConfItem>>>,
    pub att_class: Mutex<Option<Arc<Class>>>,
    pub att_connect: Mutex<Option<Arc<ConnectBlock>>>,
    pub targets: Mutex<TargetRing>,
    pub oper_name: Mutex<Option<String>>,
    /// Signalled when the exit path wants the socket closed.
    pub closed: tokio::sync::Notify,
}

impl LocalClient {
    pub fn new(connid: u32, tx: mpsc::UnboundedSender<Message>, now: i64, sendq_max: usize) -> LocalClient {
        LocalClient {
            connid,
            connids: Mutex::new(vec![connid]),
            tx,
            first_time: now,
            last_time: AtomicI64::new(now),
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_recv: AtomicU64::new(0),
            sendq_used: AtomicUsize::new(0),
            sendq_max: AtomicUsize::new(sendq_max),
            att_conf: Mutex::new(None),
            att_class: Mutex::new(None),
            att_connect: Mutex::new(None),
            targets: Mutex::new(TargetRing::new(now)),
            oper_name: Mutex::new(None),
            closed: tokio::sync::Notify::new(),
        }
    }

    /// Queue a message for this connection. Returns false when the
    /// sendq cap is exceeded or the connection task is gone; the
    /// caller must then schedule an exit, never tear down inline.
    pub fn send(&self, msg: Message) -> bool {
        let len = msg.to_string().len() + 2;
        let used = self.sendq_used.fetch_add(len, Ordering::Relaxed) + len;
        if used > self.sendq_max.load(Ordering::Relaxed) {
            return false;
        }
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.tx.send(msg).is_ok()
    }

    /// Credit drained bytes back to the queue budget.
    pub fn drain(&self, len: usize) {
        self.sendq_used.fetch_sub(len.min(self.sendq_used.load(Ordering::Relaxed)), Ordering::Relaxed);
    }

    pub fn touch(&self, now: i64) {
        self.last_time.store(now, Ordering::Relaxed);
    }
}

/// Pre-registration scratch space, dropped at registration.
#[derive(Debug, Default)]
pub struct PreClient {
    /// Outstanding subtask bits; registration fires when all clear.
    pub pending: u32,
    /// Client-supplied PASS.
    pub password: Option<String>,
    /// Ident response, pre-tilde.
    pub ident: Option<String>,
    /// DNSBL verdict: (list host, templated reason).
    pub dnsbl: Option<(String, String)>,
    /// Ping cookie we are waiting to see echoed.
    pub ping_cookie: Option<String>,
    /// Spoof from the matched auth block, split user@host.
    pub spoof_user: Option<String>,
    pub spoof_host: Option<String>,
    /// Supplied NICK/USER before checks completed.
    pub wanted_nick: Option<String>,
    pub wanted_user: Option<String>,
    pub wanted_real: Option<String>,
}

/// Pre-registration subtask bits.
pub mod pre {
    pub const DNS: u32 = 1 << 0;
    pub const IDENT: u32 = 1 << 1;
    pub const DNSBL: u32 = 1 << 2;
    pub const PING_COOKIE: u32 = 1 << 3;
    /// NICK/USER pair not yet complete.
    pub const REGISTRATION: u32 = 1 << 4;
}

/// Server side table.
#[derive(Debug, Default)]
pub struct ServerInfo {
    pub sid: String,
    /// Full capability string as advertised, for GCAP forwarding.
    pub fullcaps: String,
    /// Negotiated capability bitset.
    pub caps: u32,
    /// Oper who initiated the CONNECT, if any.
    pub by: Option<String>,
}

/// Any peer of the daemon.
pub struct Client {
    pub info: RwLock<ClientInfo>,
    /// Present iff locally connected.
    pub local: Option<LocalClient>,
    /// Present only during pre-registration.
    pub preclient: Mutex<Option<PreClient>>,
    /// Present iff status is Server (or Me).
    pub server: RwLock<Option<ServerInfo>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let info = self.info.read();
        f.debug_struct("Client")
            .field("nick", &info.nick)
            .field("uid", &info.uid)
            .field("status", &info.status)
            .finish()
    }
}

impl Client {
    /// A freshly-accepted local connection.
    pub fn new_local(
        connid: u32,
        tx: mpsc::UnboundedSender<Message>,
        ip: IpAddr,
        now: i64,
        sendq_max: usize,
    ) -> Arc<Client> {
        let sockhost = ip.to_string();
        Arc::new(Client {
            info: RwLock::new(ClientInfo {
                nick: "*".into(),
                username: String::new(),
                host: sockhost.clone(),
                orig_host: sockhost.clone(),
                sockhost,
                ip: Some(ip),
                realname: String::new(),
                uid: None,
                tsinfo: now,
                status: Status::Unknown,
                hopcount: 0,
                from: None,
                servptr: None,
                umodes: String::new(),
                away: None,
                login: None,
                certfp: None,
                flags: 0,
            }),
            local: Some(LocalClient::new(connid, tx, now, sendq_max)),
            preclient: Mutex::new(Some(PreClient {
                pending: pre::REGISTRATION,
                ..PreClient::default()
            })),
            server: RwLock::new(None),
        })
    }

    /// A remote user learned from a burst or introduction.
    #[allow(clippy::too_many_arguments)]
    pub fn new_remote_user(
        nick: &str,
        username: &str,
        host: &str,
        orig_host: &str,
        ip: &str,
        uid: &str,
        realname: &str,
        tsinfo: i64,
        hopcount: u32,
        from: &str,
        servptr: &str,
    ) -> Arc<Client> {
        Arc::new(Client {
            info: RwLock::new(ClientInfo {
                nick: nick.into(),
                username: username.into(),
                host: host.into(),
                orig_host: orig_host.into(),
                sockhost: ip.into(),
                ip: ip.parse().ok(),
                realname: realname.into(),
                uid: Some(uid.into()),
                tsinfo,
                status: Status::Client,
                hopcount,
                from: Some(from.into()),
                servptr: Some(servptr.into()),
                umodes: String::new(),
                away: None,
                login: None,
                certfp: None,
                flags: 0,
            }),
            local: None,
            preclient: Mutex::new(None),
            server: RwLock::new(None),
        })
    }

    /// A remote server behind an existing link.
    pub fn new_remote_server(
        name: &str,
        sid: &str,
        info_text: &str,
        hopcount: u32,
        from: &str,
        servptr: &str,
        now: i64,
    ) -> Arc<Client> {
        Arc::new(Client {
            info: RwLock::new(ClientInfo {
                nick: name.into(),
                username: String::new(),
                host: name.into(),
                orig_host: name.into(),
                sockhost: String::new(),
                ip: None,
                realname: info_text.into(),
                uid: Some(sid.into()),
                tsinfo: now,
                status: Status::Server,
                hopcount,
                from: Some(from.into()),
                servptr: Some(servptr.into()),
                umodes: String::new(),
                away: None,
                login: None,
                certfp: None,
                flags: 0,
            }),
            local: None,
            preclient: Mutex::new(None),
            server: RwLock::new(Some(ServerInfo {
                sid: sid.into(),
                ..ServerInfo::default()
            })),
        })
    }

    pub fn status(&self) -> Status {
        self.info.read().status
    }

    pub fn is_local(&self) -> bool {
        self.local.is_some()
    }

    pub fn is_server(&self) -> bool {
        matches!(self.status(), Status::Server)
    }

    pub fn uid(&self) -> Option<String> {
        self.info.read().uid.clone()
    }

    pub fn nick(&self) -> String {
        self.info.read().nick.clone()
    }

    /// UID if assigned, otherwise nick; the identifier used on the wire.
    pub fn use_id(&self) -> String {
        let info = self.info.read();
        info.uid.clone().unwrap_or_else(|| info.nick.clone())
    }

    /// Queue a message if locally connected; true unless the sendq
    /// overflowed or the connection is gone.
    pub fn send(&self, msg: Message) -> bool {
        match &self.local {
            Some(local) => local.send(msg),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (Arc<Client>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new_local(1, tx, "192.0.2.7".parse().unwrap(), 1000, 4096);
        (client, rx)
    }

    #[test]
    fn fresh_connection_is_unknown_with_preclient() {
        let (client, _rx) = test_client();
        assert_eq!(client.status(), Status::Unknown);
        assert!(client.preclient.lock().is_some());
        assert_eq!(client.info.read().sockhost, "192.0.2.7");
        assert_eq!(client.info.read().host, "192.0.2.7");
    }

    #[test]
    fn send_queues_fifo() {
        let (client, mut rx) = test_client();
        assert!(client.send(Message::new(ferric_proto::Command::Ping {
            token: "a".into(),
            target: None
        })));
        assert!(client.send(Message::new(ferric_proto::Command::Ping {
            token: "b".into(),
            target: None
        })));
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.to_string(), "PING :a");
        assert_eq!(second.to_string(), "PING :b");
    }

    #[test]
    fn sendq_overflow_reports_failure() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = Client::new_local(1, tx, "192.0.2.7".parse().unwrap(), 1000, 16);
        let big = Message::new(ferric_proto::Command::Quit(Some("x".repeat(64))));
        assert!(!client.send(big));
    }

    #[test]
    fn status_registered_set() {
        assert!(Status::Client.is_registered());
        assert!(Status::Server.is_registered());
        assert!(Status::Service.is_registered());
        assert!(!Status::Unknown.is_registered());
        assert!(!Status::Dead.is_registered());
    }
}
