//! Error types for the wire layer.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Top-level wire protocol errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error during reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Message exceeded the maximum allowed line length.
    #[error("message too long: {actual} bytes (limit: {limit})")]
    MessageTooLong {
        /// Actual encoded length including the line terminator.
        actual: usize,
        /// Maximum allowed length.
        limit: usize,
    },

    /// Outbound data contained an embedded line terminator or NUL.
    ///
    /// Lines with embedded `\r`, `\n`, or `\0` are rejected outright rather
    /// than truncated or split, so a caller can never smuggle a second
    /// command through a single send.
    #[error("embedded line terminator in outbound data")]
    EmbeddedTerminator,

    /// Unknown character encoding label.
    #[error("unknown encoding: {0}")]
    UnknownEncoding(String),

    /// Failed to parse an IRC message.
    #[error("invalid message {string:?}: {cause}")]
    InvalidMessage {
        /// The raw line that failed to parse.
        string: String,
        /// The underlying parse failure.
        cause: MessageParseError,
    },
}

/// Errors that can occur while parsing a single IRC message line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum MessageParseError {
    /// The message was empty after stripping the line terminator.
    #[error("empty message")]
    EmptyMessage,

    /// No command token was found.
    #[error("missing command")]
    MissingCommand,

    /// The command token was neither alphabetic nor a three-digit numeric.
    #[error("invalid command token: {0:?}")]
    InvalidCommand(String),
}

/// A per-line decoding failure under the strict decode policy.
///
/// Carries the raw bytes so callers can log or re-decode them; the line is
/// lost to the text stream but the stream itself stays synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot decode line as {encoding} ({} bytes)", raw.len())]
pub struct DecodeError {
    /// The undecodable raw line, terminator stripped.
    pub raw: Vec<u8>,
    /// Name of the encoding that rejected the bytes.
    pub encoding: &'static str,
}
