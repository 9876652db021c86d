//! CTCP (Client-to-Client Protocol) quoting and chunking.
//!
//! CTCP messages ride inside ordinary PRIVMSG/NOTICE bodies, delimited by
//! `\x01`. Two quoting layers make arbitrary payloads line-safe:
//!
//! - **Low-level quoting** (`\x10`): escapes NUL, CR, LF and the quote
//!   character itself, so a payload never breaks line framing.
//! - **CTCP-level quoting** (`\\`): escapes the delimiter (`\\a`) and the
//!   backslash, so a payload may itself contain `\x01`.
//!
//! Decoding reverses both layers exactly; encode-then-decode is an identity
//! for any payload, including one made entirely of control bytes.
//!
//! # Reference
//! - CTCP specification: <https://www.irchelp.org/protocol/ctcpspec.html>

/// The CTCP delimiter character (`\x01`).
pub const DELIMITER: char = '\x01';

/// The low-level quote character (`\x10`).
const LOW_QUOTE: char = '\x10';

/// One piece of a dequoted message body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Chunk {
    /// Plain message text between (or outside) delimiters.
    Text(String),
    /// A tagged CTCP message: command tag plus optional data.
    Tagged {
        /// The CTCP command tag (e.g. `ACTION`, `VERSION`, `DCC`).
        tag: String,
        /// Everything after the first space, if any.
        data: Option<String>,
    },
}

/// Apply low-level quoting: make a string safe for line transmission.
pub fn low_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\0' => {
                out.push(LOW_QUOTE);
                out.push('0');
            }
            '\n' => {
                out.push(LOW_QUOTE);
                out.push('n');
            }
            '\r' => {
                out.push(LOW_QUOTE);
                out.push('r');
            }
            LOW_QUOTE => {
                out.push(LOW_QUOTE);
                out.push(LOW_QUOTE);
            }
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`low_quote`]. Unknown quoted characters pass through unchanged.
pub fn low_dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut iter = s.chars();
    while let Some(c) = iter.next() {
        if c == LOW_QUOTE {
            match iter.next() {
                Some('0') => out.push('\0'),
                Some('n') => out.push('\n'),
                Some('r') => out.push('\r'),
                Some(LOW_QUOTE) => out.push(LOW_QUOTE),
                Some(other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// CTCP-level quoting: escape the delimiter and the backslash.
fn ctcp_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            DELIMITER => out.push_str("\\a"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse CTCP-level quoting.
fn ctcp_dequote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut iter = s.chars();
    while let Some(c) = iter.next() {
        if c == '\\' {
            match iter.next() {
                Some('a') => out.push(DELIMITER),
                Some('\\') => out.push('\\'),
                Some(other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Encode a tagged CTCP message as a full wire-ready body.
///
/// Both quoting layers are applied to the data; the result is the body of a
/// PRIVMSG (request) or NOTICE (reply).
///
/// # Example
///
/// ```
/// use slirc_wire::ctcp;
///
/// assert_eq!(ctcp::tagged("ACTION", Some("waves")), "\x01ACTION waves\x01");
/// assert_eq!(ctcp::tagged("VERSION", None), "\x01VERSION\x01");
/// ```
pub fn tagged(tag: &str, data: Option<&str>) -> String {
    let body = match data {
        Some(data) => format!("{tag} {}", ctcp_quote(data)),
        None => tag.to_owned(),
    };
    format!("{DELIMITER}{}{DELIMITER}", low_quote(&body))
}

/// Split a dequoted message body into plain and tagged chunks.
///
/// A message with no delimiter yields a single [`Chunk::Text`]. A trailing
/// unpaired delimiter is literal text, per the CTCP specification.
pub fn dequote(message: &str) -> Vec<Chunk> {
    let message = low_dequote(message);
    if !message.contains(DELIMITER) {
        return vec![Chunk::Text(message)];
    }

    let parts: Vec<&str> = message.split(DELIMITER).collect();
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < parts.len() - 1 {
        if !parts[i].is_empty() {
            chunks.push(Chunk::Text(parts[i].to_owned()));
        }
        if i < parts.len() - 2 {
            let body = ctcp_dequote(parts[i + 1]);
            let (tag, data) = match body.split_once(' ') {
                Some((t, d)) => (t.to_owned(), Some(d.to_owned())),
                None => (body, None),
            };
            chunks.push(Chunk::Tagged { tag, data });
        }
        i += 2;
    }
    let last = parts[parts.len() - 1];
    if parts.len() % 2 == 0 {
        // A lone delimiter before the final part: that part, delimiter
        // included, is ordinary text.
        chunks.push(Chunk::Text(format!("{DELIMITER}{last}")));
    } else if !last.is_empty() {
        chunks.push(Chunk::Text(last.to_owned()));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(dequote("hello"), vec![Chunk::Text("hello".into())]);
    }

    #[test]
    fn simple_action() {
        let chunks = dequote("\x01ACTION waves hello\x01");
        assert_eq!(
            chunks,
            vec![Chunk::Tagged {
                tag: "ACTION".into(),
                data: Some("waves hello".into()),
            }]
        );
    }

    #[test]
    fn tag_without_data() {
        assert_eq!(
            dequote("\x01VERSION\x01"),
            vec![Chunk::Tagged {
                tag: "VERSION".into(),
                data: None
            }]
        );
    }

    #[test]
    fn mixed_text_and_tagged() {
        let chunks = dequote("before\x01PING 12345\x01after");
        assert_eq!(
            chunks,
            vec![
                Chunk::Text("before".into()),
                Chunk::Tagged {
                    tag: "PING".into(),
                    data: Some("12345".into())
                },
                Chunk::Text("after".into()),
            ]
        );
    }

    #[test]
    fn trailing_text_after_tagged_chunk() {
        let chunks = dequote("\x01PING 12345\x01tail");
        assert_eq!(
            chunks,
            vec![
                Chunk::Tagged {
                    tag: "PING".into(),
                    data: Some("12345".into())
                },
                Chunk::Text("tail".into()),
            ]
        );
    }

    #[test]
    fn lone_trailing_delimiter_is_text() {
        let chunks = dequote("hello\x01world");
        assert_eq!(
            chunks,
            vec![Chunk::Text("hello".into()), Chunk::Text("\x01world".into())]
        );
    }

    #[test]
    fn low_quote_round_trip() {
        let payload = "a\0b\nc\rd\x10e";
        assert_eq!(low_dequote(&low_quote(payload)), payload);
    }

    #[test]
    fn round_trip_arbitrary_payload() {
        // Control byte, delimiter, quote char, terminators, backslash.
        let payload = "x\x01y\x10z\r\n\0 \\tail\x01";
        let wire = tagged("PING", Some(payload));
        let chunks = dequote(&wire);
        assert_eq!(
            chunks,
            vec![Chunk::Tagged {
                tag: "PING".into(),
                data: Some(payload.into()),
            }]
        );
    }

    #[test]
    fn round_trip_delimiter_only_payload() {
        let payload = "\x01\x01\x01";
        let wire = tagged("X", Some(payload));
        assert_eq!(
            dequote(&wire),
            vec![Chunk::Tagged {
                tag: "X".into(),
                data: Some(payload.into()),
            }]
        );
    }
}
