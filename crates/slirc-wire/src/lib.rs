//! # slirc-wire
//!
//! Sans-IO wire layer for the IRC client protocol:
//!
//! - Message framing: parsing and serializing lines with IRCv3 tags,
//!   prefixes, commands, and parameters
//! - Source (`nick!user@host`) decomposition
//! - CTCP quoting/dequoting with exact round-trip fidelity
//! - ISUPPORT feature accumulation with order-preserving `PREFIX` handling
//! - DCC offer encoding/decoding
//! - Line buffering with pluggable decode policies and a tokio codec
//!
//! Everything except the codec adapter is pure: bytes and strings in,
//! values out. The engine crate (`slirc-client`) supplies sockets, tasks,
//! and scheduling on top.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
pub mod ctcp;
pub mod dcc;
pub mod error;
pub mod isupport;
pub mod line;
pub mod message;
pub mod source;

pub use self::casemap::{irc_eq, irc_lower, is_channel_name};
pub use self::dcc::{DccKind, DccOffer};
pub use self::error::{DecodeError, MessageParseError, ProtocolError, Result};
pub use self::isupport::{FeatureTable, FeatureValue, PrefixSpec};
pub use self::line::{DecodePolicy, DecodedLine, LineBuffer, LineCodec};
pub use self::message::{validate_outbound, Message, Tag, MAX_LINE_LEN, MAX_PARAMS};
pub use self::source::Source;
