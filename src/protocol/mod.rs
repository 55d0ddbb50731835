//! Wire Protocol
//!
//! A length-free, marker-driven, line-delimited format that is self-describing
//! over a stream. Requests and responses share one alphabet of single-byte
//! markers; segments are separated by `\n` and every message ends with `\r`.
//!
//! - [`types`]: markers, the [`Value`] sum type, encoding, request building
//! - [`decoder`]: frame decoding into requests or values, plus the raw
//!   payload slurp used by the store
//! - [`error`]: the typed error set and its canonical wire strings

pub mod decoder;
pub mod error;
pub mod types;

pub use decoder::{decode_message, decode_value_frame, Message, MAX_NESTING_DEPTH};
pub use error::WireError;
pub use types::{
    encode_request, is_value_marker, marker, prepare_message, Command, Request, Value, CR, NL,
};
