//! RFC 1459 case mapping.
//!
//! IRC treats `{}|^` as the lowercase forms of `[]\~`, so nickname and
//! channel comparisons must go through this mapping rather than plain ASCII
//! lowercasing.

/// Lowercase a string under the `rfc1459` casemapping.
pub fn irc_lower(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}

/// Compare two strings under the `rfc1459` casemapping.
pub fn irc_eq(a: &str, b: &str) -> bool {
    irc_lower(a) == irc_lower(b)
}

/// Whether a target names a channel (starts with a channel type sigil).
pub fn is_channel_name(target: &str) -> bool {
    target.starts_with(['#', '&', '+', '!'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brackets_fold() {
        assert_eq!(irc_lower("Nick[a]\\~"), "nick{a}|^");
        assert!(irc_eq("FOO[]", "foo{}"));
        assert!(!irc_eq("foo", "bar"));
    }

    #[test]
    fn channel_detection() {
        assert!(is_channel_name("#rust"));
        assert!(is_channel_name("&local"));
        assert!(!is_channel_name("nick"));
    }
}
