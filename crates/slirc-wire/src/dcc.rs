//! DCC offer wire format.
//!
//! A DCC negotiation is a CTCP `DCC` message whose data names the session
//! kind, an argument (chat marker or file name), the offerer's IPv4 address
//! as a decimal 32-bit integer, a port, and (for SEND) an optional size.

use std::fmt;
use std::net::Ipv4Addr;

/// The kind of session being offered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DccKind {
    /// Line-oriented chat session.
    Chat,
    /// Raw binary file transfer.
    Send,
}

impl DccKind {
    /// Parse a DCC subcommand token.
    pub fn parse(token: &str) -> Option<Self> {
        match token.to_ascii_uppercase().as_str() {
            "CHAT" => Some(Self::Chat),
            "SEND" => Some(Self::Send),
            _ => None,
        }
    }

    /// The canonical uppercase token.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "CHAT",
            Self::Send => "SEND",
        }
    }
}

impl fmt::Display for DccKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed DCC offer.
///
/// # Example
///
/// ```
/// use slirc_wire::dcc::{DccKind, DccOffer};
///
/// let offer = DccOffer::parse("CHAT chat 2130706433 5000").unwrap();
/// assert_eq!(offer.kind, DccKind::Chat);
/// assert_eq!(offer.address.to_string(), "127.0.0.1");
/// assert_eq!(offer.port, 5000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DccOffer {
    /// Session kind.
    pub kind: DccKind,
    /// `chat` for chat offers, the file name for SEND offers.
    pub argument: String,
    /// The offerer's address.
    pub address: Ipv4Addr,
    /// The offerer's listening port.
    pub port: u16,
    /// Expected transfer size in bytes (SEND only, optional).
    pub size: Option<u64>,
}

impl DccOffer {
    /// Parse the data portion of a CTCP `DCC` message.
    pub fn parse(data: &str) -> Option<Self> {
        let mut words = data.split_ascii_whitespace();
        let kind = DccKind::parse(words.next()?)?;
        let argument = words.next()?.to_owned();
        let address = Ipv4Addr::from(words.next()?.parse::<u32>().ok()?);
        let port = words.next()?.parse().ok()?;
        let size = match words.next() {
            Some(s) => Some(s.parse().ok()?),
            None => None,
        };
        Some(Self {
            kind,
            argument,
            address,
            port,
            size,
        })
    }

    /// Build a chat offer.
    pub fn chat(address: Ipv4Addr, port: u16) -> Self {
        Self {
            kind: DccKind::Chat,
            argument: "chat".to_owned(),
            address,
            port,
            size: None,
        }
    }

    /// Build a file-send offer.
    pub fn file(name: impl Into<String>, address: Ipv4Addr, port: u16, size: Option<u64>) -> Self {
        Self {
            kind: DccKind::Send,
            argument: name.into(),
            address,
            port,
            size,
        }
    }
}

impl fmt::Display for DccOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.kind,
            self.argument,
            u32::from(self.address),
            self.port
        )?;
        if let Some(size) = self.size {
            write!(f, " {size}")?;
        }
        Ok(())
    }
}
