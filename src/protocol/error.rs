//! Typed protocol errors and their canonical wire strings.
//!
//! Every error that can be sent to a peer has a fixed message text. The same
//! text is what a decoder sees coming back in an `!` frame, so
//! [`WireError::from_wire_text`] turns canonical strings back into the typed
//! variants and wraps anything else as a server-supplied error.

use thiserror::Error;

/// Errors produced while encoding or decoding wire messages, or surfaced by
/// the store through an error frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    /// A value marker is unknown, or the encoder was handed something it
    /// cannot represent.
    #[error("unsupported type")]
    UnsupportedType,

    /// The first byte of a message is not a known command or value marker.
    #[error("unsupported command")]
    UnsupportedCommand,

    /// Framing, quoting, size or integer parse failure, missing key,
    /// negative TTL.
    #[error("malformed message")]
    BadMessage,

    /// A structural byte was present where a specific one was required.
    #[error("bad delimiter")]
    BadDelimiter,

    /// Lookup, update or removal of an absent (or expired) key.
    #[error("not found")]
    NotFound,

    /// Catch-all for unexpected internal failures.
    #[error("unknown error")]
    Unknown,

    /// A non-canonical error string received from the peer.
    #[error("{0}")]
    Server(String),
}

impl WireError {
    /// Re-materializes a canonical error string into its typed variant.
    ///
    /// Unrecognized text becomes [`WireError::Server`] carrying it verbatim.
    pub fn from_wire_text(text: &str) -> Self {
        match text {
            "unsupported type" => WireError::UnsupportedType,
            "unsupported command" => WireError::UnsupportedCommand,
            "malformed message" => WireError::BadMessage,
            "bad delimiter" => WireError::BadDelimiter,
            "not found" => WireError::NotFound,
            "unknown error" => WireError::Unknown,
            other => WireError::Server(other.to_string()),
        }
    }
}
