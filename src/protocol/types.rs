//! Wire Protocol Data Types
//!
//! The protocol is text-oriented and marker-driven: every message part starts
//! with a single type byte, segments are separated by `\n`, and a full message
//! ends with `\r`.
//!
//! ## Markers
//!
//! Commands: `#` get, `+` set, `^` update, `-` remove, `~` keys.
//! Values: `$` string, `&` int, `@` list, `:` map, `!` error, `*` nil.
//!
//! ## Examples
//!
//! String: `$"value"`
//! Int: `&123`
//! Nil: `*`
//! List: `@2\n$"a"\n$"b"`
//! Map: `:1\n$"hi"\n$"dude"`
//! Set request: `+\nsome_key\n$"value"\n1000\r`
//!
//! Strings and error bodies are quoted with C-style escapes so that a raw
//! `\n` or `\r` never appears inside an encoded value; that keeps the frame
//! terminator unambiguous. A few shorthands from the original format are
//! preserved: the empty string encodes as a bare `$`, zero as a bare `&`, and
//! an error without text as `!"unknown error"`.

use crate::protocol::error::WireError;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Segment separator inside a message.
pub const NL: u8 = b'\n';

/// End-of-message terminator.
pub const CR: u8 = b'\r';

/// Single-byte type markers.
pub mod marker {
    // Commands.
    pub const GET: u8 = b'#';
    pub const SET: u8 = b'+';
    pub const UPDATE: u8 = b'^';
    pub const REMOVE: u8 = b'-';
    pub const KEYS: u8 = b'~';

    // Value types.
    pub const STRING: u8 = b'$';
    pub const INT: u8 = b'&';
    pub const LIST: u8 = b'@';
    pub const MAP: u8 = b':';
    pub const ERROR: u8 = b'!';
    pub const NIL: u8 = b'*';
}

/// Returns true if `m` is one of the value-type markers.
pub fn is_value_marker(m: u8) -> bool {
    matches!(
        m,
        marker::STRING | marker::INT | marker::LIST | marker::MAP | marker::ERROR | marker::NIL
    )
}

/// The cache commands a client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Get,
    Set,
    Update,
    Remove,
    Keys,
}

impl Command {
    /// Maps a leading command byte to a command, if known.
    pub fn from_marker(m: u8) -> Option<Command> {
        match m {
            marker::GET => Some(Command::Get),
            marker::SET => Some(Command::Set),
            marker::UPDATE => Some(Command::Update),
            marker::REMOVE => Some(Command::Remove),
            marker::KEYS => Some(Command::Keys),
            _ => None,
        }
    }

    /// The leading byte for this command on the wire.
    pub fn marker(&self) -> u8 {
        match self {
            Command::Get => marker::GET,
            Command::Set => marker::SET,
            Command::Update => marker::UPDATE,
            Command::Remove => marker::REMOVE,
            Command::Keys => marker::KEYS,
        }
    }
}

/// A decoded client request.
///
/// For `Set` and `Update`, `value` holds the *raw encoded payload* exactly as
/// it appeared on the wire; the store keeps those bytes verbatim so a later
/// `Get` replies without re-encoding anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    /// Lookup key; empty for `Keys`.
    pub key: String,
    /// Raw encoded value payload; empty unless `Set`/`Update`.
    pub value: Bytes,
    /// Time-to-live; `Duration::ZERO` means the entry never expires.
    pub ttl: Duration,
}

/// A runtime value under the wire format.
///
/// Maps are kept as ordered pair lists during parse since map keys can
/// themselves be any value; consumers that need lookup promote them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Nil,
    Str(String),
    Int(i64),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Error(String),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn int(n: i64) -> Self {
        Value::Int(n)
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Value::Error(msg.into())
    }

    pub fn list(items: Vec<Value>) -> Self {
        Value::List(items)
    }

    pub fn map(pairs: Vec<(Value, Value)>) -> Self {
        Value::Map(pairs)
    }

    /// Returns true if this value is nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Encodes the value into its wire form, without the `\r` terminator.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encodes into an existing buffer; cheaper when building a frame.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Nil => buf.push(marker::NIL),
            Value::Str(s) => {
                buf.push(marker::STRING);
                if !s.is_empty() {
                    push_quoted(buf, s);
                }
            }
            Value::Int(n) => {
                buf.push(marker::INT);
                if *n != 0 {
                    buf.extend_from_slice(n.to_string().as_bytes());
                }
            }
            Value::Error(msg) => {
                buf.push(marker::ERROR);
                let msg = if msg.is_empty() { "unknown error" } else { msg };
                push_quoted(buf, msg);
            }
            Value::List(items) => {
                buf.push(marker::LIST);
                buf.extend_from_slice(items.len().to_string().as_bytes());
                for item in items {
                    buf.push(NL);
                    item.encode_into(buf);
                }
            }
            Value::Map(pairs) => {
                buf.push(marker::MAP);
                buf.extend_from_slice(pairs.len().to_string().as_bytes());
                for (k, v) in pairs {
                    buf.push(NL);
                    k.encode_into(buf);
                    buf.push(NL);
                    v.encode_into(buf);
                }
            }
        }
    }
}

impl From<&WireError> for Value {
    fn from(err: &WireError) -> Self {
        Value::Error(err.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "(nil)"),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Int(n) => write!(f, "{}", n),
            Value::Error(msg) => write!(f, "(error) {}", msg),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} => {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Encodes a value and appends the `\r` terminator, yielding a complete frame.
pub fn prepare_message(v: &Value) -> Vec<u8> {
    let mut buf = v.encode();
    buf.push(CR);
    buf
}

/// Builds a complete request frame for the client side.
///
/// `value` is only consulted for `Set`/`Update`; `ttl` is encoded as decimal
/// nanoseconds.
pub fn encode_request(cmd: Command, key: &str, value: Option<&Value>, ttl: Duration) -> Vec<u8> {
    let mut buf = vec![cmd.marker()];

    if cmd == Command::Keys {
        buf.push(CR);
        return buf;
    }

    buf.push(NL);
    buf.extend_from_slice(key.as_bytes());

    if matches!(cmd, Command::Get | Command::Remove) {
        buf.push(CR);
        return buf;
    }

    buf.push(NL);
    value.unwrap_or(&Value::Nil).encode_into(&mut buf);
    buf.push(NL);
    buf.extend_from_slice((ttl.as_nanos() as u64).to_string().as_bytes());
    buf.push(CR);
    buf
}

fn push_quoted(buf: &mut Vec<u8>, s: &str) {
    buf.push(b'"');
    for b in s.bytes() {
        match b {
            b'"' => buf.extend_from_slice(b"\\\""),
            b'\\' => buf.extend_from_slice(b"\\\\"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            b'\t' => buf.extend_from_slice(b"\\t"),
            _ => buf.push(b),
        }
    }
    buf.push(b'"');
}

/// Reverses [`push_quoted`]: strips the surrounding quotes and resolves
/// escapes. Anything that is not a well-formed quoted string is malformed.
pub(crate) fn unquote(b: &[u8]) -> Result<String, WireError> {
    if b.len() < 2 || b[0] != b'"' || b[b.len() - 1] != b'"' {
        return Err(WireError::BadMessage);
    }

    let mut out = Vec::with_capacity(b.len() - 2);
    let mut bytes = b[1..b.len() - 1].iter();

    while let Some(&c) = bytes.next() {
        if c != b'\\' {
            out.push(c);
            continue;
        }
        match bytes.next() {
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            Some(b't') => out.push(b'\t'),
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            _ => return Err(WireError::BadMessage),
        }
    }

    String::from_utf8(out).map_err(|_| WireError::BadMessage)
}
