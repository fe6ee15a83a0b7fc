//! Link capability negotiation.
//!
//! Capabilities are a fixed table of names. Each side advertises what
//! it can do; a link's effective set is the bitwise AND, and outbound
//! framing consults it (EUID vs UID, SJOIN membership, BAN relay).

/// Capability bits.
pub mod cap {
    /// Quit storm: peers infer dependent QUITs from SQUIT.
    pub const QS: u32 = 1 << 0;
    /// Ban exceptions (+e).
    pub const EX: u32 = 1 << 1;
    /// CHW: messages to @#channel.
    pub const CHW: u32 = 1 << 2;
    /// Invite exceptions (+I).
    pub const IE: u32 = 1 << 3;
    /// KLINE relay.
    pub const KLN: u32 = 1 << 4;
    pub const KNOCK: u32 = 1 << 5;
    /// Link compression.
    pub const ZIP: u32 = 1 << 6;
    /// Topic burst.
    pub const TB: u32 = 1 << 7;
    /// UNKLINE relay.
    pub const UNKLN: u32 = 1 << 8;
    /// Cluster command sharing.
    pub const CLUSTER: u32 = 1 << 9;
    /// Extension envelope.
    pub const ENCAP: u32 = 1 << 10;
    pub const SERVICES: u32 = 1 << 11;
    /// Forced nick change by services.
    pub const RSFNC: u32 = 1 << 12;
    /// Collision rescue via nick change.
    pub const SAVE: u32 = 1 << 13;
    /// Extended UID with orighost and login.
    pub const EUID: u32 = 1 << 14;
    /// Oper-override topic/mode editing.
    pub const EOPMOD: u32 = 1 << 15;
    /// Propagated BAN messages.
    pub const BAN: u32 = 1 << 16;
    /// Channel mode locks.
    pub const MLOCK: u32 = 1 << 17;
}

/// Name to bit, in advertisement order.
pub const CAP_TABLE: &[(&str, u32)] = &[
    ("QS", cap::QS),
    ("EX", cap::EX),
    ("CHW", cap::CHW),
    ("IE", cap::IE),
    ("KLN", cap::KLN),
    ("KNOCK", cap::KNOCK),
    ("ZIP", cap::ZIP),
    ("TB", cap::TB),
    ("UNKLN", cap::UNKLN),
    ("CLUSTER", cap::CLUSTER),
    ("ENCAP", cap::ENCAP),
    ("SERVICES", cap::SERVICES),
    ("RSFNC", cap::RSFNC),
    ("SAVE", cap::SAVE),
    ("EUID", cap::EUID),
    ("EOPMOD", cap::EOPMOD),
    ("BAN", cap::BAN),
    ("MLOCK", cap::MLOCK),
];

/// Everything this daemon can perform.
pub fn our_caps() -> u32 {
    CAP_TABLE.iter().fold(0, |acc, (_, bit)| acc | bit)
}

/// Parse an advertised capability list; unknown names are ignored so
/// newer peers degrade gracefully.
pub fn parse_caps<S: AsRef<str>>(names: &[S]) -> u32 {
    names
        .iter()
        .filter_map(|name| {
            CAP_TABLE
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name.as_ref()))
                .map(|(_, bit)| bit)
        })
        .fold(0, |acc, bit| acc | bit)
}

/// Render a bitset back to the space-joined advertisement form.
pub fn caps_to_names(mask: u32) -> Vec<String> {
    CAP_TABLE
        .iter()
        .filter(|(_, bit)| mask & bit != 0)
        .map(|(name, _)| name.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_full_set() {
        let names = caps_to_names(our_caps());
        assert_eq!(parse_caps(&names), our_caps());
        assert_eq!(names.first().map(String::as_str), Some("QS"));
        assert_eq!(names.last().map(String::as_str), Some("MLOCK"));
    }

    #[test]
    fn negotiation_is_an_intersection() {
        let theirs = parse_caps(&["QS", "EX", "EUID", "FUTURECAP"]);
        let effective = our_caps() & theirs;
        assert_ne!(effective & cap::EUID, 0);
        assert_eq!(effective & cap::BAN, 0);
    }

    #[test]
    fn unknown_caps_are_ignored() {
        assert_eq!(parse_caps(&["NOSUCH"]), 0);
    }
}
