//! Escaped glob matching for ban and auth masks.
//!
//! Masks support `*` (any run), `?` (any one character) and `\` to
//! escape either. Comparison is case-insensitive under the IRC case
//! mapping, so `*@Host[1]` matches `user@host{1}`.

use crate::casemap::irc_lower_char;

/// Match `text` against a glob `pattern`.
///
/// Iterative star-backtracking matcher; no allocation, linear in the
/// common case.
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let mut p = 0;
    let mut t = 0;
    // Position of the last `*` seen and the text position it matched to.
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        let (pc, escaped) = match pat.get(p) {
            Some('\\') => (pat.get(p + 1).copied(), true),
            Some(&c) => (Some(c), false),
            None => (None, false),
        };

        match pc {
            Some('*') if !escaped => {
                star = Some((p, t));
                p += 1;
            }
            Some('?') if !escaped => {
                p += 1;
                t += 1;
            }
            Some(c) if irc_lower_char(c) == irc_lower_char(txt[t]) => {
                p += if escaped { 2 } else { 1 };
                t += 1;
            }
            _ => match star {
                // Backtrack: let the star swallow one more character.
                Some((sp, st)) => {
                    p = sp + 1;
                    t = st + 1;
                    star = Some((sp, st + 1));
                }
                None => return false,
            },
        }
    }

    // Only trailing unescaped stars may remain.
    while let Some('*') = pat.get(p) {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_match() {
        assert!(wildcard_match("abc", "abc"));
        assert!(!wildcard_match("abc", "abd"));
        assert!(!wildcard_match("abc", "ab"));
    }

    #[test]
    fn star_matches_runs() {
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("*.example.com", "host.example.com"));
        assert!(wildcard_match("a*c", "abbbc"));
        assert!(!wildcard_match("a*c", "abbbd"));
    }

    #[test]
    fn question_matches_one() {
        assert!(wildcard_match("a?c", "abc"));
        assert!(!wildcard_match("a?c", "ac"));
        assert!(!wildcard_match("a?c", "abbc"));
    }

    #[test]
    fn escapes_are_literal() {
        assert!(wildcard_match("a\\*c", "a*c"));
        assert!(!wildcard_match("a\\*c", "abc"));
        assert!(wildcard_match("a\\?", "a?"));
        assert!(!wildcard_match("a\\?", "ab"));
        assert!(wildcard_match("a\\\\b", "a\\b"));
    }

    #[test]
    fn matching_is_casemapped() {
        assert!(wildcard_match("*@HOST[1]", "user@host{1}"));
        assert!(wildcard_match("Nick~*", "nick^one"));
    }

    #[test]
    fn tilde_username_matches_star_user() {
        // A `*@host` ban must catch identless users with a `~` prefix.
        assert!(wildcard_match("*@badhost", "~anything@badhost"));
        assert!(wildcard_match("*", "~anything"));
    }
}
