//! Message source (prefix) handling.
//!
//! An IRC prefix identifies the origin of a message: either a server name
//! or a `nick!user@host` mask. The components are derived lazily from the
//! raw text; a missing component is simply `None`, never an error.

use std::fmt;

/// The raw source of a message, decomposable into nick, user, and host.
///
/// # Example
///
/// ```
/// use slirc_wire::Source;
///
/// let src = Source::new("pinky!~pinky@example.com");
/// assert_eq!(src.nick(), Some("pinky"));
/// assert_eq!(src.user(), Some("~pinky"));
/// assert_eq!(src.host(), Some("example.com"));
///
/// let server = Source::new("irc.example.com");
/// assert_eq!(server.nick(), Some("irc.example.com"));
/// assert_eq!(server.user(), None);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Source(String);

impl Source {
    /// Wrap a raw prefix string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw prefix text, exactly as received.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The nick component: everything before `!` or `@`.
    ///
    /// For a server prefix this is the whole string.
    pub fn nick(&self) -> Option<&str> {
        let end = self.0.find(['!', '@']).unwrap_or(self.0.len());
        (end > 0).then(|| &self.0[..end])
    }

    /// The user component: between `!` and `@`, if present.
    pub fn user(&self) -> Option<&str> {
        let start = self.0.find('!')? + 1;
        let end = self.0[start..]
            .find('@')
            .map_or(self.0.len(), |i| start + i);
        (end > start).then(|| &self.0[start..end])
    }

    /// The host component: everything after `@`, if present.
    pub fn host(&self) -> Option<&str> {
        let start = self.0.find('@')? + 1;
        (start < self.0.len()).then(|| &self.0[start..])
    }

    /// Heuristic: a prefix with a dot and no `!` is a server name.
    pub fn is_server(&self) -> bool {
        !self.0.contains('!') && self.0.contains('.')
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Source {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}
