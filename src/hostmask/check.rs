//! Composed access checks built on the matcher.

use std::net::IpAddr;
use std::sync::Arc;

use crate::bans::{conf_flags, ConfItem, ConfKind};

use super::HostMatcher;

/// Resolve the access rule governing a connecting client.
///
/// Finds the best auth record; if none the client is unauthorised.
/// Unless the record exempts K-lines, the best K-line is probed
/// against the real identity, against the spoofed identity when the
/// record spoofs, and against the untilded username when the record
/// sets no-tilde. A matching K-line wins over the auth record.
#[allow(clippy::too_many_arguments)]
pub fn find_address_conf(
    matcher: &HostMatcher,
    host: &str,
    sockhost: &str,
    user: &str,
    notilde_user: &str,
    ip: Option<IpAddr>,
    auth_user: Option<&str>,
) -> Option<Arc<ConfItem>> {
    let iconf = matcher.find(
        Some(host),
        Some(sockhost),
        None,
        ip,
        ConfKind::Auth,
        Some(user),
        auth_user,
        false,
    )?;

    // The visible username is one character shorter without the tilde.
    let vuser = if iconf.has_flag(conf_flags::NO_TILDE) {
        notilde_user
    } else {
        user
    };

    if iconf.has_flag(conf_flags::EXEMPT_KLINE) {
        return Some(iconf);
    }

    if let Some(kconf) = matcher.find(
        Some(host),
        Some(sockhost),
        None,
        ip,
        ConfKind::Kline,
        Some(user),
        None,
        false,
    ) {
        return Some(kconf);
    }

    // A spoof must not dodge K-lines on the spoofed identity.
    if iconf.has_flag(conf_flags::SPOOF) {
        let spoof = iconf.info.as_str();
        let kconf = match spoof.split_once('@') {
            Some((spoof_user, spoof_host)) => matcher.find(
                Some(spoof_host),
                None,
                None,
                ip,
                ConfKind::Kline,
                Some(spoof_user),
                None,
                false,
            ),
            None => matcher.find(
                Some(spoof),
                None,
                None,
                ip,
                ConfKind::Kline,
                Some(vuser),
                None,
                false,
            ),
        };
        if let Some(kconf) = kconf {
            return Some(kconf);
        }
    }

    // no_tilde widens the K-line surface to the untilded name.
    if vuser != user {
        if let Some(kconf) = matcher.find(
            Some(host),
            Some(sockhost),
            None,
            ip,
            ConfKind::Kline,
            Some(vuser),
            None,
            false,
        ) {
            return Some(kconf);
        }
    }

    Some(iconf)
}

/// The D-line gate. Exemptions are probed first and win outright, so
/// an exempt record shadows any D-line underneath it.
pub fn find_dline(matcher: &HostMatcher, addr: IpAddr) -> Option<Arc<ConfItem>> {
    if let Some(exempt) = matcher.find(
        None,
        None,
        None,
        Some(addr),
        ConfKind::ExemptDline,
        None,
        None,
        true,
    ) {
        return Some(exempt);
    }
    matcher.find(None, None, None, Some(addr), ConfKind::Dline, None, None, true)
}

fn is_kline_wild(c: char) -> bool {
    matches!(c, '*' | '?' | '!' | '@')
}

/// Refuse ban masks that are too wild: the user and host patterns
/// together must carry at least `min_nonwildcard` concrete
/// characters. A CIDR host passes on prefix length instead, scaled so
/// a short prefix demands a specific user pattern.
pub fn valid_wild_card(user: &str, host: &str, min_nonwildcard: usize) -> bool {
    // A fully-concrete user pattern is always acceptable.
    if !user.contains(['*', '?']) {
        return true;
    }

    let mut nonwild = 0usize;
    for c in user.chars() {
        if !is_kline_wild(c) {
            nonwild += 1;
            if nonwild >= min_nonwildcard {
                return true;
            }
        }
    }

    if let Some((_, bits)) = host.rsplit_once('/') {
        if bits.as_bytes().first().is_some_and(u8::is_ascii_digit) {
            let bitlen: i64 = bits.parse().unwrap_or(0);
            let needed = if host.contains(':') {
                4 * (min_nonwildcard as i64 - nonwild as i64)
            } else {
                6 - 2 * nonwild as i64
            };
            return bitlen > 0 && bitlen >= needed;
        }
    }

    for c in host.chars() {
        if !is_kline_wild(c) {
            nonwild += 1;
            if nonwild >= min_nonwildcard {
                return true;
            }
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth(matcher: &HostMatcher, mask: &str, user: &str, flags: u32) -> Arc<ConfItem> {
        let conf = Arc::new(ConfItem::new(ConfKind::Auth, user, mask, ""));
        conf.set_flag(flags);
        matcher.add(mask, ConfKind::Auth, Some(user), None, conf.clone());
        conf
    }

    fn kline(matcher: &HostMatcher, mask: &str, user: &str) -> Arc<ConfItem> {
        let conf = Arc::new(ConfItem::new(ConfKind::Kline, user, mask, "banned"));
        matcher.add(mask, ConfKind::Kline, Some(user), None, conf.clone());
        conf
    }

    #[test]
    fn kline_wins_over_auth() {
        let matcher = HostMatcher::new();
        auth(&matcher, "*", "*", 0);
        let k = kline(&matcher, "bad.example", "*");
        let found = find_address_conf(&matcher, "bad.example", "192.0.2.7", "~u", "u", None, None)
            .unwrap();
        assert!(Arc::ptr_eq(&found, &k));
    }

    #[test]
    fn kline_exempt_auth_shields_client() {
        let matcher = HostMatcher::new();
        let i = auth(&matcher, "bad.example", "*", conf_flags::EXEMPT_KLINE);
        kline(&matcher, "bad.example", "*");
        let found = find_address_conf(&matcher, "bad.example", "192.0.2.7", "~u", "u", None, None)
            .unwrap();
        assert!(Arc::ptr_eq(&found, &i));
    }

    #[test]
    fn no_auth_means_none() {
        let matcher = HostMatcher::new();
        assert!(
            find_address_conf(&matcher, "h.example", "192.0.2.7", "~u", "u", None, None).is_none()
        );
    }

    #[test]
    fn spoofed_identity_is_still_klinable() {
        let matcher = HostMatcher::new();
        let conf = Arc::new(ConfItem {
            info: "spoofed@fake.example".into(),
            ..ConfItem::new(ConfKind::Auth, "*", "clean.example", "")
        });
        conf.set_flag(conf_flags::SPOOF);
        matcher.add("clean.example", ConfKind::Auth, Some("*"), None, conf);
        let k = kline(&matcher, "fake.example", "spoofed");

        let found = find_address_conf(&matcher, "clean.example", "192.0.2.7", "~u", "u", None, None)
            .unwrap();
        assert!(Arc::ptr_eq(&found, &k));
    }

    #[test]
    fn exempt_dline_overrides_dline() {
        // An exempt /24 shadows a /32 D-line inside it: the probe hits
        // the exempt table first and returns the exemption.
        let matcher = HostMatcher::new();
        let e = Arc::new(ConfItem::new(ConfKind::ExemptDline, "", "192.0.2.0/24", ""));
        matcher.add("192.0.2.0/24", ConfKind::ExemptDline, None, None, e.clone());
        let d = Arc::new(ConfItem::new(ConfKind::Dline, "", "192.0.2.10", "banned"));
        matcher.add("192.0.2.10", ConfKind::Dline, None, None, d);

        let found = find_dline(&matcher, "192.0.2.10".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&found, &e));
        assert_eq!(found.kind, ConfKind::ExemptDline);
    }

    #[test]
    fn dline_applies_outside_the_exemption() {
        let matcher = HostMatcher::new();
        let d = Arc::new(ConfItem::new(ConfKind::Dline, "", "198.51.100.0/24", "banned"));
        matcher.add("198.51.100.0/24", ConfKind::Dline, None, None, d.clone());
        let found = find_dline(&matcher, "198.51.100.7".parse().unwrap()).unwrap();
        assert!(Arc::ptr_eq(&found, &d));
    }

    #[test]
    fn wild_card_sufficiency() {
        // Concrete user pattern: always fine.
        assert!(valid_wild_card("bad", "*", 4));
        // Wild user, concrete-enough host.
        assert!(valid_wild_card("*", "badhost.example", 4));
        // Both too wild.
        assert!(!valid_wild_card("*", "*", 4));
        assert!(!valid_wild_card("*bad*", "*", 4));
        // user contributes 3, host adds more.
        assert!(valid_wild_card("bad*", "h*", 4));
    }

    #[test]
    fn cidr_prefix_counts_proportionally() {
        // IPv4: needs bits >= 6 - 2*nonwild.
        assert!(valid_wild_card("*", "192.0.2.0/24", 4));
        assert!(valid_wild_card("*ab*", "0.0.0.0/2", 4));
        assert!(!valid_wild_card("*", "0.0.0.0/0", 4));
        // IPv6: needs bits >= 4*(min - nonwild).
        assert!(valid_wild_card("*", "2001:db8::/16", 4));
        assert!(!valid_wild_card("*", "2001:db8::/8", 4));
    }
}
