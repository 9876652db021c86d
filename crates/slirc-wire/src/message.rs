//! IRC message framing: parsing and serialization.
//!
//! A message is exactly one line: an optional `@tags` segment, an optional
//! `:prefix`, a command token, and up to [`MAX_PARAMS`] parameters where the
//! final parameter may contain spaces if introduced by a `:` sentinel.
//!
//! # Reference
//! - RFC 2812 Section 2.3.1: Message format
//! - IRCv3 message-tags: <https://ircv3.net/specs/extensions/message-tags>

use std::fmt;
use std::str::FromStr;

use crate::error::{MessageParseError, ProtocolError, Result};
use crate::source::Source;

/// Maximum line length in bytes, including the `\r\n` terminator.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of parameters a single message may carry.
pub const MAX_PARAMS: usize = 15;

/// A single IRCv3 message tag: key and optional value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag(pub String, pub Option<String>);

/// An owned, parsed IRC message.
///
/// # Example
///
/// ```
/// use slirc_wire::Message;
///
/// let msg: Message = ":nick!u@h PRIVMSG #chan :Hello there".parse().unwrap();
/// assert_eq!(msg.command, "PRIVMSG");
/// assert_eq!(msg.params, vec!["#chan", "Hello there"]);
/// assert_eq!(msg.to_string(), ":nick!u@h PRIVMSG #chan :Hello there");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags, empty if the line carried none.
    pub tags: Vec<Tag>,
    /// Message source, when the line carried a prefix.
    pub prefix: Option<Source>,
    /// The command token, uppercased (numerics stay as three digits).
    pub command: String,
    /// Ordered parameters; the last one may have come from the trailing slot.
    pub params: Vec<String>,
}

impl Message {
    /// Build a message from a command and parameters.
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            tags: Vec::new(),
            prefix: None,
            command: command.into().to_ascii_uppercase(),
            params,
        }
    }

    /// Attach a source prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Source) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Attach a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: Option<&str>) -> Self {
        self.tags.push(Tag(key.into(), value.map(str::to_owned)));
        self
    }

    /// Get the value of a tag by key.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|Tag(k, _)| k == key)
            .and_then(|Tag(_, v)| v.as_deref())
    }

    /// Create a PRIVMSG to a target.
    pub fn privmsg(target: &str, text: &str) -> Self {
        Self::new("PRIVMSG", vec![target.to_owned(), text.to_owned()])
    }

    /// Create a NOTICE to a target.
    pub fn notice(target: &str, text: &str) -> Self {
        Self::new("NOTICE", vec![target.to_owned(), text.to_owned()])
    }

    /// Create a PONG reply with the given payload.
    pub fn pong(payload: &str) -> Self {
        Self::new("PONG", vec![payload.to_owned()])
    }
}

/// Escape a tag value per the IRCv3 message-tags spec.
fn escape_tag_value(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
}

/// Unescape a tag value from wire format.
fn unescape_tag_value(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut iter = value.chars();
    while let Some(c) = iter.next() {
        let r = if c == '\\' {
            match iter.next() {
                Some(':') => ';',
                Some('s') => ' ',
                Some('\\') => '\\',
                Some('r') => '\r',
                Some('n') => '\n',
                Some(c) => c,
                None => break,
            }
        } else {
            c
        };
        unescaped.push(r);
    }
    unescaped
}

fn parse_tags(segment: &str) -> Vec<Tag> {
    segment
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|tag| {
            let mut iter = tag.splitn(2, '=');
            let key = iter.next().unwrap_or("").to_owned();
            let value = iter.next().map(unescape_tag_value);
            Tag(key, value)
        })
        .collect()
}

fn is_valid_command(token: &str) -> bool {
    (token.len() == 3 && token.bytes().all(|b| b.is_ascii_digit()))
        || (!token.is_empty() && token.bytes().all(|b| b.is_ascii_alphabetic()))
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Message> {
        let invalid = |cause: MessageParseError| ProtocolError::InvalidMessage {
            string: s.to_owned(),
            cause,
        };

        let mut rest = s.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Err(invalid(MessageParseError::EmptyMessage));
        }

        let mut tags = Vec::new();
        if let Some(after) = rest.strip_prefix('@') {
            let (segment, tail) = after
                .split_once(' ')
                .ok_or_else(|| invalid(MessageParseError::MissingCommand))?;
            tags = parse_tags(segment);
            rest = tail.trim_start_matches(' ');
        }

        let mut prefix = None;
        if let Some(after) = rest.strip_prefix(':') {
            let (raw, tail) = after
                .split_once(' ')
                .ok_or_else(|| invalid(MessageParseError::MissingCommand))?;
            prefix = Some(Source::new(raw));
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut tail) = match rest.split_once(' ') {
            Some((c, t)) => (c, t),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(invalid(MessageParseError::MissingCommand));
        }
        if !is_valid_command(command) {
            return Err(invalid(MessageParseError::InvalidCommand(
                command.to_owned(),
            )));
        }

        let mut params = Vec::new();
        loop {
            tail = tail.trim_start_matches(' ');
            if tail.is_empty() {
                break;
            }
            if let Some(trailing) = tail.strip_prefix(':') {
                params.push(trailing.to_owned());
                break;
            }
            if params.len() == MAX_PARAMS - 1 {
                // Param slots exhausted; the remainder is one final param.
                params.push(tail.to_owned());
                break;
            }
            match tail.split_once(' ') {
                Some((p, t)) => {
                    params.push(p.to_owned());
                    tail = t;
                }
                None => {
                    params.push(tail.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut buf = String::new();
            for (i, Tag(k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    buf.push(';');
                }
                buf.push_str(k);
                if let Some(v) = v {
                    buf.push('=');
                    escape_tag_value(&mut buf, v);
                }
            }
            write!(f, "@{buf} ")?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        f.write_str(&self.command)?;
        if let Some((last, middles)) = self.params.split_last() {
            for p in middles {
                write!(f, " {p}")?;
            }
            if last.is_empty() || last.starts_with(':') || last.contains(' ') {
                write!(f, " :{last}")?;
            } else {
                write!(f, " {last}")?;
            }
        }
        Ok(())
    }
}

/// Validate a fully-encoded outbound line (terminator not yet appended).
///
/// Rejects lines that would exceed `max_len` once `\r\n` is added, and any
/// embedded `\r`, `\n`, or NUL byte. Rejection happens before queuing so a
/// malformed send never reaches the wire in altered form.
pub fn validate_outbound(line: &str, max_len: usize) -> Result<()> {
    if line.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
        return Err(ProtocolError::EmbeddedTerminator);
    }
    let actual = line.len() + 2;
    if actual > max_len {
        return Err(ProtocolError::MessageTooLong {
            actual,
            limit: max_len,
        });
    }
    Ok(())
}
