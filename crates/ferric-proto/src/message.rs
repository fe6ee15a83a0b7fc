//! Owned IRC message representation.

use std::fmt;
use std::str::FromStr;

use crate::command::Command;
use crate::error::ProtocolError;
use crate::parser::RawLine;

/// A message source.
///
/// On TS6 links the server slot carries either a server name or a SID,
/// and the nickname slot may carry a UID; the distinction is made by
/// the consumer, not the grammar.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Prefix {
    /// `:name` or `:sid` — a server (or bare nick/UID) source.
    Server(String),
    /// `:nick!user@host` — a full user source.
    User(String, String, String),
}

impl Prefix {
    /// Parse a prefix string (without the leading `:`).
    pub fn parse(s: &str) -> Prefix {
        if let Some(bang) = s.find('!') {
            if let Some(at) = s[bang + 1..].find('@') {
                return Prefix::User(
                    s[..bang].to_string(),
                    s[bang + 1..bang + 1 + at].to_string(),
                    s[bang + 2 + at..].to_string(),
                );
            }
        }
        Prefix::Server(s.to_string())
    }

    /// The name or nick portion of the source.
    pub fn name(&self) -> &str {
        match self {
            Prefix::Server(s) => s,
            Prefix::User(n, _, _) => n,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(s) => write!(f, "{}", s),
            Prefix::User(n, u, h) => write!(f, "{}!{}@{}", n, u, h),
        }
    }
}

/// An owned IRC message: optional source plus command.
#[derive(Clone, PartialEq, Debug)]
pub struct Message {
    pub prefix: Option<Prefix>,
    pub command: Command,
}

impl Message {
    /// Construct a message with no source.
    pub fn new(command: Command) -> Message {
        Message {
            prefix: None,
            command,
        }
    }

    /// Construct a message sourced from a server name or SID.
    pub fn from_server(source: &str, command: Command) -> Message {
        Message {
            prefix: Some(Prefix::Server(source.to_string())),
            command,
        }
    }

    /// Attach a source to this message.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Prefix) -> Message {
        self.prefix = Some(prefix);
        self
    }

    /// The source name, if any.
    pub fn source_name(&self) -> Option<&str> {
        self.prefix.as_ref().map(Prefix::name)
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Message {
        Message::new(command)
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message, ProtocolError> {
        let line = s.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        let raw = RawLine::parse(line).map_err(|reason| ProtocolError::InvalidMessage {
            string: line.to_string(),
            reason,
        })?;
        let prefix = raw.prefix.map(Prefix::parse);
        let command = Command::from_parts(raw.verb, &raw.params)?;
        Ok(Message { prefix, command })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        let (verb, params, force_trailing) = self.command.to_parts();
        write!(f, "{}", verb)?;
        let last = params.len().saturating_sub(1);
        for (i, param) in params.iter().enumerate() {
            if i == last
                && (force_trailing
                    || param.is_empty()
                    || param.contains(' ')
                    || param.starts_with(':'))
            {
                write!(f, " :{}", param)?;
            } else {
                write!(f, " {}", param)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_parse_user() {
        let p = Prefix::parse("nick!user@host");
        assert_eq!(
            p,
            Prefix::User("nick".into(), "user".into(), "host".into())
        );
        assert_eq!(p.to_string(), "nick!user@host");
    }

    #[test]
    fn prefix_parse_server() {
        assert_eq!(
            Prefix::parse("hub.example"),
            Prefix::Server("hub.example".into())
        );
        // A bare UID has no ! separator and rides in the server slot.
        assert_eq!(Prefix::parse("42XAAAAAB"), Prefix::Server("42XAAAAAB".into()));
    }

    #[test]
    fn empty_line_is_rejected() {
        assert_eq!("".parse::<Message>(), Err(ProtocolError::EmptyMessage));
        assert_eq!("\r\n".parse::<Message>(), Err(ProtocolError::EmptyMessage));
    }

    #[test]
    fn display_adds_trailing_colon_for_spaces() {
        let msg = Message::new(Command::Quit(Some("Ping timeout: 120 seconds".into())));
        assert_eq!(msg.to_string(), "QUIT :Ping timeout: 120 seconds");
    }
}
