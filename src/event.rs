//! The engine's event model.
//!
//! Every inbound line, lifecycle transition, and engine-level error is
//! delivered to handlers as an [`Event`]: a string kind tag plus source,
//! target, ordered arguments, and IRCv3 tags. Numeric replies are renamed
//! to symbolic kinds (`001` → `welcome`) where a name is known.

use std::collections::HashMap;

use slirc_wire::Source;

/// An immutable dispatched event.
#[derive(Clone, Debug)]
pub struct Event {
    /// The event type tag, e.g. `pubmsg`, `welcome`, `ctcp`, `disconnect`.
    pub kind: String,
    /// Who the event came from, when known.
    pub source: Option<Source>,
    /// The target of the underlying message, when it has one.
    pub target: Option<String>,
    /// Ordered string arguments.
    pub arguments: Vec<String>,
    /// IRCv3 message tags, empty for synthesized events.
    pub tags: HashMap<String, String>,
}

impl Event {
    /// Build an event without tags.
    pub fn new(
        kind: impl Into<String>,
        source: Option<Source>,
        target: Option<String>,
        arguments: Vec<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            source,
            target,
            arguments,
            tags: HashMap::new(),
        }
    }

    /// Attach message tags.
    #[must_use]
    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Internal shorthand for engine-synthesized events.
    pub(crate) fn internal(kind: &str, arguments: Vec<String>) -> Self {
        Self::new(kind, None, None, arguments)
    }
}

/// Map a three-digit numeric reply to its symbolic event name.
pub fn numeric_name(code: &str) -> Option<&'static str> {
    Some(match code {
        "001" => "welcome",
        "002" => "yourhost",
        "003" => "created",
        "004" => "myinfo",
        "005" => "featurelist",
        "221" => "umodeis",
        "250" => "statsconn",
        "251" => "luserclient",
        "255" => "luserme",
        "265" => "n_local",
        "266" => "n_global",
        "301" => "away",
        "305" => "unaway",
        "306" => "nowaway",
        "311" => "whoisuser",
        "312" => "whoisserver",
        "313" => "whoisoperator",
        "315" => "endofwho",
        "317" => "whoisidle",
        "318" => "endofwhois",
        "319" => "whoischannels",
        "321" => "liststart",
        "322" => "list",
        "323" => "listend",
        "324" => "channelmodeis",
        "329" => "channelcreate",
        "331" => "notopic",
        "332" => "currenttopic",
        "333" => "topicinfo",
        "352" => "whoreply",
        "353" => "namreply",
        "366" => "endofnames",
        "372" => "motd",
        "375" => "motdstart",
        "376" => "endofmotd",
        "401" => "nosuchnick",
        "402" => "nosuchserver",
        "403" => "nosuchchannel",
        "404" => "cannotsendtochan",
        "421" => "unknowncommand",
        "422" => "nomotd",
        "432" => "erroneusnickname",
        "433" => "nicknameinuse",
        "441" => "usernotinchannel",
        "442" => "notonchannel",
        "443" => "useronchannel",
        "462" => "alreadyregistered",
        "464" => "passwdmismatch",
        "471" => "channelisfull",
        "472" => "unknownmode",
        "473" => "inviteonlychan",
        "474" => "bannedfromchan",
        "475" => "badchannelkey",
        "481" => "noprivileges",
        "482" => "chanoprivsneeded",
        _ => return None,
    })
}
