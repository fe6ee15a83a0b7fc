//! nom-based line grammar.
//!
//! `[':' source SP] verb *(SP middle) [SP ':' trailing]` with at most
//! 14 middles; a 15th parameter is treated as trailing whether or not
//! it carries the colon.

use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::char,
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::MAX_PARAMS;

/// A borrowed, structurally-split line. No semantic validation.
#[derive(Debug, PartialEq, Eq)]
pub struct RawLine<'a> {
    pub prefix: Option<&'a str>,
    pub verb: &'a str,
    pub params: Vec<&'a str>,
}

fn not_space(c: char) -> bool {
    c != ' '
}

fn prefix(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(not_space))(input)
}

fn verb(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric())(input)
}

fn spaces(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c == ' ')(input)
}

impl<'a> RawLine<'a> {
    /// Split one CRLF-stripped line into prefix, verb and parameters.
    pub fn parse(line: &'a str) -> Result<RawLine<'a>, String> {
        let mut rest = line;

        let pfx = match opt(prefix)(rest) {
            Ok((r, p)) => {
                rest = r;
                p
            }
            Err(_) => None,
        };
        if pfx.is_some() {
            let (r, _) = spaces(rest).map_err(|_| "missing verb after source".to_string())?;
            rest = r;
        }

        let (r, v) = verb(rest).map_err(|_| "missing or invalid verb".to_string())?;
        rest = r;

        let mut params = Vec::new();
        loop {
            let Ok((r, _)) = spaces(rest) else { break };
            rest = r;
            if rest.is_empty() {
                break;
            }
            // Trailing: explicit colon, or forced once 14 middles exist.
            if params.len() == MAX_PARAMS {
                params.push(rest.strip_prefix(':').unwrap_or(rest));
                rest = "";
                break;
            }
            if let Ok((r, _)) = tag::<_, _, nom::error::Error<&str>>(":")(rest) {
                params.push(r);
                rest = "";
                break;
            }
            let (r, middle) =
                take_while1::<_, _, nom::error::Error<&str>>(not_space)(rest)
                    .map_err(|_| "empty parameter".to_string())?;
            params.push(middle);
            rest = r;
        }

        if !rest.is_empty() {
            return Err(format!("trailing garbage: {rest:?}"));
        }

        Ok(RawLine {
            prefix: pfx,
            verb: v,
            params,
        })
    }
}
