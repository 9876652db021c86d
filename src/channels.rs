//! Joined-channel and privilege tracking.
//!
//! Derived state only: built from join/part/quit/kick/nick/mode/names
//! events, keyed under rfc1459 casemapping, and destroyed when we leave a
//! channel or the connection drops. Privilege ranking follows the server's
//! advertised `PREFIX` order.

use std::collections::{HashMap, HashSet};

use slirc_wire::{irc_lower, PrefixSpec};

/// A channel privilege flag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Privilege {
    /// Mode `q`, usually `~`.
    Owner,
    /// Mode `a`, usually `&`.
    Admin,
    /// Mode `o`, `@`.
    Operator,
    /// Mode `h`, `%`.
    HalfOp,
    /// Mode `v`, `+`.
    Voice,
}

impl Privilege {
    /// The privilege for a status mode letter.
    pub fn from_mode(mode: char) -> Option<Self> {
        match mode {
            'q' => Some(Self::Owner),
            'a' => Some(Self::Admin),
            'o' => Some(Self::Operator),
            'h' => Some(Self::HalfOp),
            'v' => Some(Self::Voice),
            _ => None,
        }
    }

    /// The status mode letter for this privilege.
    pub fn mode(self) -> char {
        match self {
            Self::Owner => 'q',
            Self::Admin => 'a',
            Self::Operator => 'o',
            Self::HalfOp => 'h',
            Self::Voice => 'v',
        }
    }
}

/// Membership and privilege flags for one joined channel.
#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    name: String,
    /// lowercased nick -> (display nick, privilege flags)
    members: HashMap<String, (String, HashSet<Privilege>)>,
}

impl ChannelState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            members: HashMap::new(),
        }
    }

    /// The channel name as first seen.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Display nicks of all members.
    pub fn users(&self) -> Vec<&str> {
        self.members.values().map(|(n, _)| n.as_str()).collect()
    }

    /// Whether the nick is present.
    pub fn has_user(&self, nick: &str) -> bool {
        self.members.contains_key(&irc_lower(nick))
    }

    /// The nick's privilege flags, if present.
    pub fn privileges(&self, nick: &str) -> Option<&HashSet<Privilege>> {
        self.members.get(&irc_lower(nick)).map(|(_, p)| p)
    }

    /// Whether the nick holds the given flag.
    pub fn has_privilege(&self, nick: &str, privilege: Privilege) -> bool {
        self.privileges(nick).is_some_and(|p| p.contains(&privilege))
    }

    fn add(&mut self, nick: &str, flags: HashSet<Privilege>) {
        self.members.insert(irc_lower(nick), (nick.to_owned(), flags));
    }

    fn remove(&mut self, nick: &str) {
        self.members.remove(&irc_lower(nick));
    }
}

/// All channels the connection is currently joined to.
#[derive(Debug, Default)]
pub struct ChannelTracker {
    channels: HashMap<String, ChannelState>,
}

impl ChannelTracker {
    /// Names of all joined channels.
    pub fn channels(&self) -> Vec<String> {
        self.channels.values().map(|c| c.name.clone()).collect()
    }

    /// The state of one channel, if joined.
    pub fn get(&self, channel: &str) -> Option<&ChannelState> {
        self.channels.get(&irc_lower(channel))
    }

    /// We joined a channel.
    pub(crate) fn joined(&mut self, channel: &str) {
        self.channels
            .entry(irc_lower(channel))
            .or_insert_with(|| ChannelState::new(channel));
    }

    /// We left (or were removed from) a channel.
    pub(crate) fn left(&mut self, channel: &str) {
        self.channels.remove(&irc_lower(channel));
    }

    /// Everything goes when the connection does.
    pub(crate) fn clear(&mut self) {
        self.channels.clear();
    }

    /// Another user joined a channel.
    pub(crate) fn user_joined(&mut self, channel: &str, nick: &str) {
        if let Some(chan) = self.channels.get_mut(&irc_lower(channel)) {
            chan.add(nick, HashSet::new());
        }
    }

    /// Another user left a channel.
    pub(crate) fn user_left(&mut self, channel: &str, nick: &str) {
        if let Some(chan) = self.channels.get_mut(&irc_lower(channel)) {
            chan.remove(nick);
        }
    }

    /// A user quit: remove them, and all their flags, everywhere.
    pub(crate) fn user_quit(&mut self, nick: &str) {
        for chan in self.channels.values_mut() {
            chan.remove(nick);
        }
    }

    /// A user changed nick, carrying privileges with them.
    pub(crate) fn nick_changed(&mut self, old: &str, new: &str) {
        let old_key = irc_lower(old);
        for chan in self.channels.values_mut() {
            if let Some((_, flags)) = chan.members.remove(&old_key) {
                chan.members.insert(irc_lower(new), (new.to_owned(), flags));
            }
        }
    }

    /// Apply one RPL_NAMREPLY names list.
    ///
    /// Leading status symbols (possibly stacked, as with multi-prefix) are
    /// resolved through the advertised prefix order.
    pub(crate) fn names_reply(&mut self, prefix: &PrefixSpec, channel: &str, names: &str) {
        let Some(chan) = self.channels.get_mut(&irc_lower(channel)) else {
            return;
        };
        for name in names.split_ascii_whitespace() {
            let mut flags = HashSet::new();
            let mut rest = name;
            while let Some(c) = rest.chars().next() {
                match prefix.mode_for_symbol(c).and_then(Privilege::from_mode) {
                    Some(p) => {
                        flags.insert(p);
                        rest = &rest[c.len_utf8()..];
                    }
                    None => break,
                }
            }
            if !rest.is_empty() {
                chan.add(rest, flags);
            }
        }
    }

    /// Apply a channel MODE change.
    ///
    /// Only status-mode grants/revocations touch membership state, and each
    /// change touches exactly the named flag. Other modes are parsed only
    /// far enough to keep the argument list aligned, using the CHANMODES
    /// classes when advertised.
    pub(crate) fn mode_changed(
        &mut self,
        prefix: &PrefixSpec,
        chanmodes: Option<&[String]>,
        channel: &str,
        modes: &str,
        args: &[String],
    ) {
        let Some(chan) = self.channels.get_mut(&irc_lower(channel)) else {
            return;
        };
        let default = ["beI".to_owned(), "k".to_owned(), "l".to_owned()];
        let classes: &[String] = chanmodes.unwrap_or(&default);
        let type_a = classes.first().map(String::as_str).unwrap_or("beI");
        let type_b = classes.get(1).map(String::as_str).unwrap_or("k");
        let type_c = classes.get(2).map(String::as_str).unwrap_or("l");

        let mut adding = true;
        let mut args = args.iter();
        for mode in modes.chars() {
            match mode {
                '+' => adding = true,
                '-' => adding = false,
                m if prefix.is_prefix_mode(m) => {
                    let Some(nick) = args.next() else { return };
                    let Some(privilege) = Privilege::from_mode(m) else {
                        continue;
                    };
                    if let Some((_, flags)) = chan.members.get_mut(&irc_lower(nick)) {
                        if adding {
                            flags.insert(privilege);
                        } else {
                            flags.remove(&privilege);
                        }
                    }
                }
                m if type_a.contains(m) || type_b.contains(m) => {
                    // List and always-parameterized modes consume an arg.
                    args.next();
                }
                m if type_c.contains(m) => {
                    if adding {
                        args.next();
                    }
                }
                _ => {}
            }
        }
    }
}
