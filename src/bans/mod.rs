//! Access-control records.
//!
//! A `ConfItem` is one access rule: a client auth block, a K/D/X-line,
//! an exemption, a reservation, or a link-shape rule. Records are
//! shared between the address matcher, the ban store and attached
//! clients; the refcount tracks attachments, and a record marked
//! illegal survives until the count drains so late detaches stay safe.

mod store;

pub use store::{BanStore, Tier};

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use ferric_proto::{BanAction, Command};

/// Record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfKind {
    /// Client auth block (I-line).
    Auth,
    /// user@host kill (K-line).
    Kline,
    /// IP ban (D-line).
    Dline,
    /// IP exemption, probed before D-lines.
    ExemptDline,
    /// Realname ban (X-line).
    Xline,
    /// Reserved nickname.
    ResvNick,
    /// Reserved channel.
    ResvChannel,
    /// Operator block.
    Oper,
    /// Hub mask on a link.
    Hub,
    /// Leaf mask on a link.
    Leaf,
}

impl ConfKind {
    /// The BAN-message type letter, for propagated kinds.
    pub fn ban_letter(self) -> Option<char> {
        match self {
            ConfKind::Kline => Some('K'),
            ConfKind::Dline => Some('D'),
            ConfKind::Xline => Some('X'),
            ConfKind::ResvNick | ConfKind::ResvChannel => Some('R'),
            _ => None,
        }
    }

    pub fn from_ban_letter(c: char, mask: &str) -> Option<ConfKind> {
        match c {
            'K' => Some(ConfKind::Kline),
            'D' => Some(ConfKind::Dline),
            'X' => Some(ConfKind::Xline),
            'R' if mask.starts_with('#') => Some(ConfKind::ResvChannel),
            'R' => Some(ConfKind::ResvNick),
            _ => None,
        }
    }
}

/// ConfItem flag bits.
pub mod conf_flags {
    /// Expires by `hold`; never written to disk.
    pub const TEMPORARY: u32 = 1 << 0;
    /// Known to every server; has a `lifetime`.
    pub const PROPAGATED: u32 = 1 << 1;
    /// Auth: require an ident response.
    pub const NEED_IDENT: u32 = 1 << 2;
    /// Auth: skip the `~` prefix for identless users.
    pub const NO_TILDE: u32 = 1 << 3;
    /// Auth: require a SASL identity.
    pub const NEED_SASL: u32 = 1 << 4;
    /// Auth: require the TLS terminator path.
    pub const NEED_TLS: u32 = 1 << 5;
    /// Auth: class limits do not apply.
    pub const EXEMPT_LIMITS: u32 = 1 << 6;
    /// Auth: K-lines do not apply.
    pub const EXEMPT_KLINE: u32 = 1 << 7;
    /// Auth: DNSBL verdicts do not apply.
    pub const EXEMPT_DNSBL: u32 = 1 << 8;
    /// Auth: flood limits do not apply.
    pub const EXEMPT_FLOOD: u32 = 1 << 9;
    /// Auth: spoof the visible host from `info`.
    pub const SPOOF: u32 = 1 << 10;
    /// Auth: bounce the client elsewhere.
    pub const REDIRECT: u32 = 1 << 11;
    /// Password field is a bcrypt hash.
    pub const ENCRYPTED: u32 = 1 << 12;
    /// Sourced from the config file; flushed and reinstalled on
    /// rehash rather than surviving it.
    pub const FROM_CONFIG: u32 = 1 << 13;
}

/// One access-control record.
#[derive(Debug)]
pub struct ConfItem {
    pub kind: ConfKind,
    /// Username pattern; `*` when unconstrained.
    pub user: String,
    /// Host pattern: hostname glob or `addr/bits`.
    pub host: String,
    /// Public reason, or the password for auth/oper records.
    pub reason: String,
    /// Oper-only reason.
    pub oper_reason: String,
    /// Spoof target, redirect host, or originating oper tag.
    pub info: String,
    pub class_name: String,
    /// SASL account constraint on auth records.
    pub auth_user: Option<String>,
    pub port: u16,
    pub flags: AtomicU32,
    pub created: i64,
    /// Activation deadline for temp records, deactivation point for
    /// propagated ones.
    pub hold: AtomicI64,
    /// Hard end of a propagated record's identity.
    pub lifetime: AtomicI64,
    /// Attached clients plus referencing records.
    pub clients: AtomicU32,
    /// Set once unlinked; read through `is_illegal`.
    pub illegal: AtomicBool,
}

impl ConfItem {
    pub fn new(kind: ConfKind, user: &str, host: &str, reason: &str) -> ConfItem {
        ConfItem {
            kind,
            user: user.to_string(),
            host: host.to_string(),
            reason: reason.to_string(),
            oper_reason: String::new(),
            info: String::new(),
            class_name: String::new(),
            auth_user: None,
            port: 0,
            flags: AtomicU32::new(0),
            created: 0,
            hold: AtomicI64::new(0),
            lifetime: AtomicI64::new(0),
            clients: AtomicU32::new(0),
            illegal: AtomicBool::new(false),
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Relaxed) & flag != 0
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::Relaxed);
    }

    pub fn is_temporary(&self) -> bool {
        self.has_flag(conf_flags::TEMPORARY)
    }

    pub fn is_propagated(&self) -> bool {
        self.has_flag(conf_flags::PROPAGATED)
    }

    pub fn is_illegal(&self) -> bool {
        self.illegal.load(Ordering::Relaxed)
    }

    /// Mark dead. Existing attachments keep the record alive until
    /// they detach; no new references may be made.
    pub fn mark_illegal(&self) {
        self.illegal.store(true, Ordering::Relaxed);
    }

    pub fn hold(&self) -> i64 {
        self.hold.load(Ordering::Relaxed)
    }

    pub fn lifetime(&self) -> i64 {
        self.lifetime.load(Ordering::Relaxed)
    }

    /// Attach a client to this record.
    pub fn attach(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    /// Detach; returns true when this was the last reference on an
    /// illegal record (the caller may drop its Arc).
    pub fn detach(&self) -> bool {
        let before = self.clients.fetch_sub(1, Ordering::Relaxed);
        before == 1 && self.is_illegal()
    }

    pub fn refcount(&self) -> u32 {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn user_at_host(&self) -> String {
        if self.user.is_empty() || self.user == "*" && matches!(self.kind, ConfKind::Dline | ConfKind::ExemptDline) {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// The reason string shown to peers: `reason|oper_reason`.
    pub fn full_reason(&self) -> String {
        if self.oper_reason.is_empty() {
            self.reason.clone()
        } else {
            format!("{}|{}", self.reason, self.oper_reason)
        }
    }

    /// Encode as a propagated BAN command. A locally-originated oper
    /// tag gains a `{server-name}` suffix; tags learned from peers
    /// already carry one and pass through unchanged.
    pub fn ban_command(&self, action: BanAction, server_name: &str) -> Option<Command> {
        let kind = self.kind.ban_letter()?;
        let hold = self.hold();
        let lifetime = self.lifetime();
        Some(Command::Ban {
            action,
            kind,
            user: if self.user.is_empty() {
                "*".to_string()
            } else {
                self.user.clone()
            },
            host: self.host.clone(),
            created: self.created,
            duration: hold - self.created,
            lifetime: lifetime - self.created,
            oper: if self.info.is_empty() {
                "*".to_string()
            } else if self.info.contains('{') {
                self.info.clone()
            } else {
                format!("{}{{{}}}", self.info, server_name)
            },
            reason: self.full_reason(),
        })
    }
}
