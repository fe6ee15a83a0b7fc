//! Name grammar validation and protocol length limits.

/// Maximum nickname length.
pub const NICKLEN: usize = 30;
/// Maximum username length, excluding a `~` ident prefix.
pub const USERLEN: usize = 10;
/// Maximum hostname length.
pub const HOSTLEN: usize = 63;
/// Maximum real-name length.
pub const REALLEN: usize = 50;
/// Maximum channel-name length.
pub const CHANNELLEN: usize = 50;

/// Characters permitted in a nickname after the first.
fn is_nick_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '[' | ']' | '{' | '}' | '\\' | '|' | '^' | '_' | '-' | '`')
}

/// Validate a nickname: must start with a letter or special, no digits
/// or `-` first, and fit in `NICKLEN`.
pub fn is_valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > NICKLEN {
        return false;
    }
    let mut chars = nick.chars();
    match chars.next() {
        Some(c) if c.is_ascii_digit() || c == '-' => return false,
        Some(c) if !is_nick_char(c) => return false,
        Some(_) => {}
        None => return false,
    }
    chars.all(is_nick_char)
}

/// Validate a username, allowing up to `max_dots` interior dots.
///
/// Letters, digits and a small punctuation set; a leading `~` (added
/// for identless connections) is accepted and not counted against the
/// length limit.
pub fn is_valid_username(username: &str, max_dots: usize) -> bool {
    let name = username.strip_prefix('~').unwrap_or(username);
    if name.is_empty() || name.len() > USERLEN {
        return false;
    }
    let mut dots = 0;
    for c in name.chars() {
        match c {
            '.' => {
                dots += 1;
                if dots > max_dots {
                    return false;
                }
            }
            c if c.is_ascii_alphanumeric() => {}
            '-' | '_' | '[' | ']' | '^' | '{' | '}' | '$' => {}
            _ => return false,
        }
    }
    true
}

/// Validate a server ID: one digit followed by two `[A-Z0-9]`.
pub fn is_valid_sid(sid: &str) -> bool {
    let b = sid.as_bytes();
    b.len() == 3
        && b[0].is_ascii_digit()
        && b[1..]
            .iter()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Validate a full 9-character UID: a valid SID followed by six
/// `[A-Z0-9]` characters.
pub fn is_valid_uid(uid: &str) -> bool {
    let b = uid.as_bytes();
    b.len() == 9
        && is_valid_sid(&uid[..3])
        && b[3..]
            .iter()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Validate a hostname: dot-separated labels of letters, digits and
/// hyphens, within `HOSTLEN`.
pub fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > HOSTLEN {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == ':')
    })
}

/// Validate a channel name: `#`-prefixed, printable, no spaces or
/// commas, within `CHANNELLEN`.
pub fn is_valid_channel(name: &str) -> bool {
    if !name.starts_with('#') || name.len() > CHANNELLEN {
        return false;
    }
    name[1..]
        .chars()
        .all(|c| !c.is_control() && c != ' ' && c != ',' && c != '\u{7}')
        && name.len() > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_grammar() {
        assert!(is_valid_nick("alice"));
        assert!(is_valid_nick("[w]ork`"));
        assert!(is_valid_nick("a1-b_c"));
        assert!(!is_valid_nick("1alice"));
        assert!(!is_valid_nick("-dash"));
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("has space"));
        // Exactly at the cap round-trips; one past does not.
        assert!(is_valid_nick(&"a".repeat(NICKLEN)));
        assert!(!is_valid_nick(&"a".repeat(NICKLEN + 1)));
    }

    #[test]
    fn username_grammar() {
        assert!(is_valid_username("alice", 0));
        assert!(is_valid_username("~alice", 0));
        assert!(!is_valid_username("a.b", 0));
        assert!(is_valid_username("a.b", 1));
        assert!(!is_valid_username("a.b.c", 1));
        assert!(!is_valid_username("bad user", 0));
        assert!(is_valid_username(&"u".repeat(USERLEN), 0));
        assert!(!is_valid_username(&"u".repeat(USERLEN + 1), 0));
    }

    #[test]
    fn sid_and_uid_grammar() {
        assert!(is_valid_sid("42X"));
        assert!(is_valid_sid("0AA"));
        assert!(!is_valid_sid("X42"));
        assert!(!is_valid_sid("42x"));
        assert!(!is_valid_sid("42"));
        assert!(is_valid_uid("42XAAAAAB"));
        assert!(is_valid_uid("42XA0Z9AB"));
        assert!(!is_valid_uid("42Xaaaaab"));
        assert!(!is_valid_uid("42XAAAAB"));
    }

    #[test]
    fn hostname_grammar() {
        assert!(is_valid_hostname("host.example.com"));
        assert!(is_valid_hostname("192.0.2.1"));
        assert!(!is_valid_hostname("bad..host"));
        assert!(!is_valid_hostname(""));
        assert!(is_valid_hostname(&format!("{}.x", "a".repeat(HOSTLEN - 2))));
        assert!(!is_valid_hostname(&"a".repeat(HOSTLEN + 1)));
    }

    #[test]
    fn channel_grammar() {
        assert!(is_valid_channel("#chan"));
        assert!(!is_valid_channel("chan"));
        assert!(!is_valid_channel("#"));
        assert!(!is_valid_channel("#a,b"));
        assert!(is_valid_channel(&format!("#{}", "c".repeat(CHANNELLEN - 1))));
        assert!(!is_valid_channel(&format!("#{}", "c".repeat(CHANNELLEN))));
    }
}
