//! Unified error handling for the client engine.

use thiserror::Error;

/// Convenience alias for engine results.
pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// Errors surfaced synchronously by engine calls.
///
/// Asynchronous failures (transport drops, per-line decode errors, handler
/// failures) are reported as events instead; see the error taxonomy in the
/// crate docs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] slirc_wire::ProtocolError),

    /// The connection has no live transport to send on.
    #[error("not connected")]
    NotConnected,

    /// A periodic command was constructed with a non-positive interval.
    #[error("periodic interval must be positive")]
    InvalidInterval,

    /// `process_once` was invoked while another call was still draining.
    #[error("event drain already in progress on another task")]
    AlreadyProcessing,

    /// No pending DCC offer matches the given peer/argument.
    #[error("no pending DCC offer from {0}")]
    NoSuchOffer(String),

    /// TLS setup failed.
    #[error("tls error: {0}")]
    Tls(String),
}
