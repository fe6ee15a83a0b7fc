//! Client auth blocks, operator blocks and static ban seeds.

use serde::Deserialize;

use super::defaults;

/// A client access rule.
///
/// `user` entries are `user@host` masks; the host part may be a
/// hostname glob or an `addr/bits` CIDR. Earlier blocks in the file
/// win over later ones when several match.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthBlock {
    /// `user@host` masks this block covers.
    pub user: Vec<String>,
    /// Required connection password, if any.
    #[serde(default)]
    pub password: Option<String>,
    /// Treat `password` as a bcrypt hash rather than plaintext.
    #[serde(default)]
    pub encrypted: bool,
    /// Class this block attaches clients to.
    #[serde(default = "defaults::class_name")]
    pub class: String,
    /// `user@host` spoof applied to matching clients.
    #[serde(default)]
    pub spoof: Option<String>,
    /// Constrain the match to a SASL account name glob.
    #[serde(default)]
    pub auth_user: Option<String>,
    /// Redirect matching clients elsewhere instead of serving them.
    #[serde(default)]
    pub redirect_host: Option<String>,
    #[serde(default = "defaults::port")]
    pub redirect_port: u16,
    /// Flags, matching the classic I-line prefixes.
    #[serde(default)]
    pub need_ident: bool,
    #[serde(default)]
    pub no_tilde: bool,
    #[serde(default)]
    pub need_sasl: bool,
    #[serde(default)]
    pub need_tls: bool,
    #[serde(default)]
    pub exceed_limit: bool,
    #[serde(default)]
    pub kline_exempt: bool,
    #[serde(default)]
    pub dnsbl_exempt: bool,
    #[serde(default)]
    pub flood_exempt: bool,
}

/// An operator block. Oper command surfaces live outside the core;
/// the block exists so bans carry a real originating-oper identity.
#[derive(Debug, Clone, Deserialize)]
pub struct OperBlock {
    pub name: String,
    /// `user@host` masks allowed to use this block.
    pub user: Vec<String>,
    pub password: String,
    #[serde(default = "defaults::default_true")]
    pub encrypted: bool,
}

/// Static K-line seed.
#[derive(Debug, Clone, Deserialize)]
pub struct KlineBlock {
    pub user: String,
    pub host: String,
    #[serde(default)]
    pub reason: String,
}

/// Static D-line (or exempt) seed.
#[derive(Debug, Clone, Deserialize)]
pub struct DlineBlock {
    pub host: String,
    #[serde(default)]
    pub reason: String,
    /// When set this is an exemption, not a ban.
    #[serde(default)]
    pub exempt: bool,
}

/// Static realname-ban seed.
#[derive(Debug, Clone, Deserialize)]
pub struct XlineBlock {
    pub mask: String,
    #[serde(default)]
    pub reason: String,
}

/// Static nick/channel reservation seed.
#[derive(Debug, Clone, Deserialize)]
pub struct ResvBlock {
    pub mask: String,
    #[serde(default)]
    pub reason: String,
}

impl AuthBlock {
    /// Split a `user@host` mask into its two halves. A mask with no
    /// `@` is all host.
    pub fn split_mask(mask: &str) -> (&str, &str) {
        match mask.split_once('@') {
            Some((u, h)) => (u, h),
            None => ("*", mask),
        }
    }
}
