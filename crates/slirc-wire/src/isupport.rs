//! ISUPPORT (RPL_ISUPPORT / 005) feature tracking.
//!
//! Numeric 005 advertises server features as `KEY` or `KEY=VALUE` tokens;
//! several 005 replies accumulate into one [`FeatureTable`], later values
//! overwriting earlier ones and `-KEY` removing an entry.
//!
//! The `PREFIX` token is special: its parenthesized mode-letter order is
//! authoritative for ranking channel privilege levels, so [`PrefixSpec`]
//! preserves it exactly as advertised.
//!
//! # Reference
//! - Modern IRC documentation: <https://modern.ircdocs.horse/#rplisupport-005>

use std::collections::HashMap;
use std::fmt;

/// The advertised mode-letter / status-symbol pairs, in privilege order.
///
/// # Example
///
/// ```
/// use slirc_wire::PrefixSpec;
///
/// let spec = PrefixSpec::parse("(qaohv)~&@%+").unwrap();
/// assert_eq!(spec.symbol_for_mode('o'), Some('@'));
/// assert_eq!(spec.mode_for_symbol('+'), Some('v'));
/// assert_eq!(spec.rank('q'), Some(0)); // highest privilege first
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrefixSpec {
    pairs: Vec<(char, char)>,
}

impl PrefixSpec {
    /// Parse a `PREFIX` value like `(ov)@+`.
    pub fn parse(s: &str) -> Option<Self> {
        let inner = s.strip_prefix('(')?;
        let (modes, symbols) = inner.split_once(')')?;
        if modes.is_empty() || modes.chars().count() != symbols.chars().count() {
            return None;
        }
        Some(Self {
            pairs: modes.chars().zip(symbols.chars()).collect(),
        })
    }

    /// The standard RFC 1459 prefixes, `(ov)@+`.
    pub fn rfc1459() -> Self {
        Self {
            pairs: vec![('o', '@'), ('v', '+')],
        }
    }

    /// The `(mode, symbol)` pairs in advertised order.
    pub fn pairs(&self) -> &[(char, char)] {
        &self.pairs
    }

    /// The status symbol for a mode letter, if it is a prefix mode.
    pub fn symbol_for_mode(&self, mode: char) -> Option<char> {
        self.pairs.iter().find(|(m, _)| *m == mode).map(|(_, s)| *s)
    }

    /// The mode letter for a status symbol.
    pub fn mode_for_symbol(&self, symbol: char) -> Option<char> {
        self.pairs
            .iter()
            .find(|(_, s)| *s == symbol)
            .map(|(m, _)| *m)
    }

    /// Whether the given letter is a prefix (status) mode.
    pub fn is_prefix_mode(&self, mode: char) -> bool {
        self.pairs.iter().any(|(m, _)| *m == mode)
    }

    /// Whether the given character is a status symbol.
    pub fn is_symbol(&self, c: char) -> bool {
        self.pairs.iter().any(|(_, s)| *s == c)
    }

    /// Position of a mode in the advertised order (0 = highest privilege).
    pub fn rank(&self, mode: char) -> Option<usize> {
        self.pairs.iter().position(|(m, _)| *m == mode)
    }
}

impl fmt::Display for PrefixSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (m, _) in &self.pairs {
            write!(f, "{m}")?;
        }
        write!(f, ")")?;
        for (_, s) in &self.pairs {
            write!(f, "{s}")?;
        }
        Ok(())
    }
}

/// A parsed feature value.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    /// Bare `KEY` token, or `KEY=` with an empty value.
    Flag,
    /// All-digit value.
    Int(i64),
    /// Anything else.
    Text(String),
    /// Comma-separated list (`CHANMODES`).
    List(Vec<String>),
    /// `name:count` pairs (`TARGMAX`, `CHANLIMIT`, `MAXLIST`), order kept.
    Limits(Vec<(String, Option<u32>)>),
}

impl FeatureValue {
    /// The value as text, when it is a plain text token.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The value as an integer, when numeric.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// Accumulated server feature advertisement.
///
/// Starts with the RFC 1459 default prefixes; the first advertised `PREFIX`
/// replaces them wholesale.
#[derive(Clone, Debug)]
pub struct FeatureTable {
    prefix: PrefixSpec,
    entries: HashMap<String, FeatureValue>,
}

impl Default for FeatureTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureTable {
    /// A table holding only the default prefixes.
    pub fn new() -> Self {
        Self {
            prefix: PrefixSpec::rfc1459(),
            entries: HashMap::new(),
        }
    }

    /// Load the feature tokens of one 005 reply.
    ///
    /// Callers pass the middle parameters only: the leading client param
    /// and the trailing "are supported by this server" text are not tokens.
    pub fn load<'a>(&mut self, tokens: impl IntoIterator<Item = &'a str>) {
        for token in tokens {
            self.load_token(token);
        }
    }

    /// Load a single `KEY`, `KEY=VALUE`, or `-KEY` token.
    pub fn load_token(&mut self, token: &str) {
        if token.is_empty() {
            return;
        }
        if let Some(key) = token.strip_prefix('-') {
            self.entries.remove(&key.to_ascii_uppercase());
            return;
        }
        let (key, value) = match token.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (token, None),
        };
        let key = key.to_ascii_uppercase();
        let parsed = match value {
            None | Some("") => FeatureValue::Flag,
            Some(v) if key == "PREFIX" => match PrefixSpec::parse(v) {
                Some(spec) => {
                    self.prefix = spec;
                    FeatureValue::Text(v.to_owned())
                }
                None => return,
            },
            Some(v) if key == "CHANMODES" => {
                FeatureValue::List(v.split(',').map(str::to_owned).collect())
            }
            Some(v) if matches!(key.as_str(), "TARGMAX" | "CHANLIMIT" | "MAXLIST") => {
                FeatureValue::Limits(
                    v.split(',')
                        .filter_map(|pair| {
                            let (name, count) = pair.split_once(':')?;
                            let count = if count.is_empty() {
                                None
                            } else {
                                Some(count.parse().ok()?)
                            };
                            Some((name.to_owned(), count))
                        })
                        .collect(),
                )
            }
            Some(v) => match v.parse::<i64>() {
                Ok(n) => FeatureValue::Int(n),
                Err(_) => FeatureValue::Text(v.to_owned()),
            },
        };
        self.entries.insert(key, parsed);
    }

    /// Look up a feature by key (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&FeatureValue> {
        self.entries.get(&key.to_ascii_uppercase())
    }

    /// Whether the server advertised the key at all.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_uppercase())
    }

    /// The current prefix specification (advertised or default).
    pub fn prefix(&self) -> &PrefixSpec {
        &self.prefix
    }

    /// The four CHANMODES classes (type A..D), when advertised.
    pub fn chanmodes(&self) -> Option<&[String]> {
        match self.get("CHANMODES") {
            Some(FeatureValue::List(v)) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_spec_parse() {
        let spec = PrefixSpec::parse("(ov)@+").unwrap();
        assert_eq!(spec.pairs(), &[('o', '@'), ('v', '+')]);
        assert_eq!(spec.to_string(), "(ov)@+");
        assert!(PrefixSpec::parse("@+").is_none());
        assert!(PrefixSpec::parse("(ov)@").is_none());
    }

    #[test]
    fn defaults_to_rfc1459() {
        let t = FeatureTable::new();
        assert_eq!(t.prefix().symbol_for_mode('o'), Some('@'));
        assert_eq!(t.prefix().symbol_for_mode('v'), Some('+'));
    }

    #[test]
    fn accumulates_across_fragments() {
        let mut t = FeatureTable::new();
        t.load(["CHANTYPES=#", "NICKLEN=30"]);
        t.load(["NETWORK=TestNet", "EXCEPTS"]);
        assert_eq!(t.get("NICKLEN").unwrap().as_int(), Some(30));
        assert_eq!(t.get("NETWORK").unwrap().as_text(), Some("TestNet"));
        assert_eq!(t.get("EXCEPTS"), Some(&FeatureValue::Flag));
    }

    #[test]
    fn later_value_overwrites() {
        let mut t = FeatureTable::new();
        t.load_token("NICKLEN=20");
        t.load_token("NICKLEN=30");
        assert_eq!(t.get("NICKLEN").unwrap().as_int(), Some(30));
    }

    #[test]
    fn prefix_readvertisement_replaces_order() {
        let mut t = FeatureTable::new();
        t.load_token("PREFIX=(ohv)@%+");
        assert_eq!(t.prefix().rank('h'), Some(1));
        t.load_token("PREFIX=(ov)@+");
        assert_eq!(t.prefix().pairs(), &[('o', '@'), ('v', '+')]);
        assert_eq!(t.prefix().rank('h'), None);
        assert_eq!(t.get("PREFIX").unwrap().as_text(), Some("(ov)@+"));
    }

    #[test]
    fn negation_removes() {
        let mut t = FeatureTable::new();
        t.load_token("EXCEPTS");
        t.load_token("-EXCEPTS");
        assert!(!t.has("EXCEPTS"));
    }

    #[test]
    fn targmax_pairs() {
        let mut t = FeatureTable::new();
        t.load_token("TARGMAX=PRIVMSG:4,JOIN:");
        let Some(FeatureValue::Limits(pairs)) = t.get("TARGMAX") else {
            panic!("expected limits");
        };
        assert_eq!(pairs[0], ("PRIVMSG".to_owned(), Some(4)));
        assert_eq!(pairs[1], ("JOIN".to_owned(), None));
    }

    #[test]
    fn chanmodes_list() {
        let mut t = FeatureTable::new();
        t.load_token("CHANMODES=beI,k,l,imnpst");
        assert_eq!(t.chanmodes().unwrap().len(), 4);
        assert_eq!(t.chanmodes().unwrap()[1], "k");
    }
}
