//! Bounded field splitting shared by both dialects.
//!
//! WiThrottle nests three separators: `]\[` between top-level fields, `}|{`
//! between sub-tokens of a field, and `<;>` between the key and the action of
//! a multi-throttle line. Input beyond [`MAX_FIELDS`] fields or
//! [`MAX_SUBTOKENS`] sub-tokens is silently dropped.
//!
//! DCC-Ex frames are whitespace separated with optional double-quoted
//! arguments.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::ParseError;

/// Top-level fields kept per line.
pub const MAX_FIELDS: usize = 64;

/// Sub-tokens kept per field.
pub const MAX_SUBTOKENS: usize = 4;

/// WiThrottle top-level separator.
pub const FIELD_SEPARATOR: &str = "]\\[";

/// WiThrottle sub-token separator.
pub const SUBTOKEN_SEPARATOR: &str = "}|{";

/// WiThrottle key/action separator.
pub const KEY_SEPARATOR: &str = "<;>";

/// Split on `]\[`, keeping at most [`MAX_FIELDS`] fields.
pub fn split_fields(body: &str) -> Vec<&str> {
    body.split(FIELD_SEPARATOR).take(MAX_FIELDS).collect()
}

/// Split on `}|{`, keeping at most [`MAX_SUBTOKENS`] sub-tokens.
pub fn split_subtokens(field: &str) -> Vec<&str> {
    field.split(SUBTOKEN_SEPARATOR).take(MAX_SUBTOKENS).collect()
}

/// Join sub-tokens with `}|{`.
pub fn join_subtokens<S: AsRef<str>>(parts: &[S]) -> String {
    let mut out = String::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.push_str(SUBTOKEN_SEPARATOR);
        }
        out.push_str(part.as_ref());
    }
    out
}

/// One DCC-Ex argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token<'a> {
    /// Text without surrounding quotes.
    pub text: &'a str,
    /// Whether it was double-quoted on the wire.
    pub quoted: bool,
}

/// Tokenize the argument part of a DCC-Ex frame.
///
/// ```
/// use rs_throttle_bridge::protocol::fields::tokenize;
///
/// let tokens = tokenize(r#"R 3 "Big Boy" "Light/Bell""#).unwrap();
/// assert_eq!(tokens.len(), 4);
/// assert_eq!(tokens[2].text, "Big Boy");
/// assert!(tokens[2].quoted);
/// ```
pub fn tokenize(args: &str) -> Result<Vec<Token<'_>>, ParseError> {
    let mut tokens = Vec::new();
    let mut rest = args.trim_start();
    while !rest.is_empty() && tokens.len() < MAX_FIELDS {
        if let Some(after) = rest.strip_prefix('"') {
            let end = after.find('"').ok_or(ParseError::UnterminatedQuote)?;
            tokens.push(Token {
                text: &after[..end],
                quoted: true,
            });
            rest = after[end + 1..].trim_start();
        } else {
            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            tokens.push(Token {
                text: &rest[..end],
                quoted: false,
            });
            rest = rest[end..].trim_start();
        }
    }
    Ok(tokens)
}

/// Parse a number, reporting the offending text on failure.
pub fn parse_num<T: core::str::FromStr>(s: &str) -> Result<T, ParseError> {
    s.trim()
        .parse()
        .map_err(|_| ParseError::InvalidNumber(s.into()))
}
