//! Frame Decoder
//!
//! Decodes one complete frame (everything up to and including the `\r`
//! terminator) into either a typed [`Request`] or a runtime [`Value`].
//!
//! ## How decoding works
//!
//! A frame is a sequence of segments separated by `\n` and closed by `\r`.
//! The first byte classifies the message: a command marker starts a request,
//! a value marker starts a value. The decoder walks segments with a cursor;
//! every structural expectation that fails maps to one of the typed errors in
//! [`WireError`], never a panic.
//!
//! ## The slurp path
//!
//! `Set`/`Update` carry a value payload that the store keeps verbatim. Instead
//! of materializing it, [`slurp_value`] walks the value grammar only to find
//! its byte extent and hands back the raw slice. A later `Get` writes those
//! exact bytes to the peer, so values round-trip without a decode/re-encode
//! cycle and byte equality is preserved regardless of map ordering.
//!
//! Because encoded strings escape `\n` and `\r`, a well-formed value never
//! contains a raw terminator byte; splitting the stream at `\r` before
//! decoding is therefore safe and framing cannot drift across messages.

use crate::protocol::error::WireError;
use crate::protocol::types::{is_value_marker, marker, Command, Request, Value, CR, NL};
use bytes::Bytes;
use std::time::Duration;

/// Maximum container nesting depth accepted by the decoder.
pub const MAX_NESTING_DEPTH: usize = 32;

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A command sent by a client.
    Request(Request),
    /// A bare value (the form every response takes).
    Value(Value),
}

/// Decodes a complete frame into a [`Message`].
///
/// The frame must include its trailing `\r`. Any malformed input yields a
/// typed error; end-of-stream detection happens at the transport layer before
/// a frame ever reaches this function.
pub fn decode_message(frame: &[u8]) -> Result<Message, WireError> {
    let first = *frame.first().ok_or(WireError::BadMessage)?;

    if Command::from_marker(first).is_some() {
        return decode_request(frame).map(Message::Request);
    }

    if is_value_marker(first) {
        return decode_value_frame(frame).map(Message::Value);
    }

    Err(WireError::UnsupportedCommand)
}

/// Decodes a response frame into a value.
///
/// Used by the client side, where every frame is a single encoded value.
pub fn decode_value_frame(frame: &[u8]) -> Result<Value, WireError> {
    let mut cur = Cursor::new(frame);
    let (value, delim) = decode_value(&mut cur, 0)?;
    if delim != CR {
        return Err(WireError::BadDelimiter);
    }
    Ok(value)
}

fn decode_request(frame: &[u8]) -> Result<Request, WireError> {
    let mut cur = Cursor::new(frame);

    let (head, delim) = cur.segment()?;
    if head.len() != 1 {
        // Something like `#key\r`, missing the separator after the command.
        return Err(WireError::BadMessage);
    }
    let cmd = Command::from_marker(head[0]).ok_or(WireError::UnsupportedCommand)?;

    match cmd {
        Command::Keys => {
            // Canonically `~\r`, but the reference client historically sent
            // `~\n\r`; accept both.
            if delim == NL {
                let (seg, d) = cur.segment()?;
                if !seg.is_empty() || d != CR {
                    return Err(WireError::BadDelimiter);
                }
            }
            Ok(Request {
                cmd,
                key: String::new(),
                value: Bytes::new(),
                ttl: Duration::ZERO,
            })
        }
        Command::Get | Command::Remove => {
            if delim != NL {
                return Err(WireError::BadDelimiter);
            }
            let (key, d) = cur.segment()?;
            let key = decode_key(key)?;
            if d != CR {
                return Err(WireError::BadDelimiter);
            }
            Ok(Request {
                cmd,
                key,
                value: Bytes::new(),
                ttl: Duration::ZERO,
            })
        }
        Command::Set | Command::Update => {
            if delim != NL {
                return Err(WireError::BadDelimiter);
            }
            let (key, d) = cur.segment()?;
            let key = decode_key(key)?;
            if d != NL {
                return Err(WireError::BadDelimiter);
            }
            let (value, d) = slurp_value(&mut cur)?;
            if d != NL {
                return Err(WireError::BadDelimiter);
            }
            let (ttl_digits, d) = cur.segment()?;
            if d != CR {
                return Err(WireError::BadDelimiter);
            }
            let ttl = decode_ttl(ttl_digits)?;
            Ok(Request {
                cmd,
                key,
                value,
                ttl,
            })
        }
    }
}

/// Captures the raw encoded extent of one value without interpreting it.
///
/// Returns the payload bytes and the delimiter that closed the value.
pub fn slurp_value(cur: &mut Cursor<'_>) -> Result<(Bytes, u8), WireError> {
    let start = cur.pos;
    let delim = walk_value(cur, 0)?;
    // The closing delimiter is the single byte before the cursor.
    let raw = Bytes::copy_from_slice(&cur.buf[start..cur.pos - 1]);
    Ok((raw, delim))
}

fn walk_value(cur: &mut Cursor<'_>, depth: usize) -> Result<u8, WireError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::BadMessage);
    }

    let (seg, delim) = cur.segment()?;
    if seg.is_empty() {
        return Err(WireError::BadMessage);
    }

    match seg[0] {
        marker::STRING | marker::INT | marker::NIL | marker::ERROR => Ok(delim),
        marker::LIST => walk_container(cur, seg, delim, 1, depth),
        marker::MAP => walk_container(cur, seg, delim, 2, depth),
        _ => Err(WireError::UnsupportedType),
    }
}

fn walk_container(
    cur: &mut Cursor<'_>,
    head: &[u8],
    delim: u8,
    arity: usize,
    depth: usize,
) -> Result<u8, WireError> {
    if head.len() == 1 {
        // A bare `@` or `:` is a complete (nil) container.
        return Ok(delim);
    }

    let size = decode_size(&head[1..])?;
    if size == 0 {
        return Ok(delim);
    }
    if delim != NL {
        return Err(WireError::BadDelimiter);
    }

    let total = size.checked_mul(arity).ok_or(WireError::BadMessage)?;
    let mut last = delim;
    for i in 0..total {
        last = walk_value(cur, depth + 1)?;
        if i != total - 1 && last != NL {
            return Err(WireError::BadDelimiter);
        }
    }
    Ok(last)
}

/// Recursively decodes one value, returning it with its closing delimiter.
fn decode_value(cur: &mut Cursor<'_>, depth: usize) -> Result<(Value, u8), WireError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(WireError::BadMessage);
    }

    let (seg, delim) = cur.segment()?;
    if seg.is_empty() {
        return Err(WireError::BadMessage);
    }

    match seg[0] {
        marker::NIL => {
            if seg.len() != 1 {
                return Err(WireError::BadMessage);
            }
            Ok((Value::Nil, delim))
        }
        marker::STRING => Ok((Value::Str(decode_text(seg)?), delim)),
        marker::INT => Ok((decode_int(seg)?, delim)),
        marker::ERROR => {
            let text = decode_text(seg)?;
            if text.is_empty() {
                // An error without a body carries no information; report the
                // frame itself as malformed, as the peer evidently intended
                // an error.
                return Ok((Value::from(&WireError::BadMessage), delim));
            }
            Ok((Value::Error(text), delim))
        }
        marker::LIST => decode_list(cur, seg, delim, depth),
        marker::MAP => decode_map(cur, seg, delim, depth),
        _ => Err(WireError::UnsupportedType),
    }
}

fn decode_list(
    cur: &mut Cursor<'_>,
    head: &[u8],
    delim: u8,
    depth: usize,
) -> Result<(Value, u8), WireError> {
    if head.len() == 1 {
        return Ok((Value::List(Vec::new()), delim));
    }

    let size = decode_size(&head[1..])?;
    if size == 0 {
        return Ok((Value::List(Vec::new()), delim));
    }
    if delim != NL {
        return Err(WireError::BadDelimiter);
    }

    let mut items = Vec::with_capacity(size.min(1024));
    let mut last = delim;
    for i in 0..size {
        let (item, d) = decode_value(cur, depth + 1)?;
        if i != size - 1 && d != NL {
            return Err(WireError::BadDelimiter);
        }
        items.push(item);
        last = d;
    }
    Ok((Value::List(items), last))
}

fn decode_map(
    cur: &mut Cursor<'_>,
    head: &[u8],
    delim: u8,
    depth: usize,
) -> Result<(Value, u8), WireError> {
    if head.len() == 1 {
        return Ok((Value::Map(Vec::new()), delim));
    }

    let size = decode_size(&head[1..])?;
    if size == 0 {
        return Ok((Value::Map(Vec::new()), delim));
    }
    if delim != NL {
        return Err(WireError::BadDelimiter);
    }

    let mut pairs = Vec::with_capacity(size.min(1024));
    let mut last = delim;
    for i in 0..size {
        let (key, d) = decode_value(cur, depth + 1)?;
        if d != NL {
            return Err(WireError::BadDelimiter);
        }
        let (value, d) = decode_value(cur, depth + 1)?;
        if i != size - 1 && d != NL {
            return Err(WireError::BadDelimiter);
        }
        pairs.push((key, value));
        last = d;
    }
    Ok((Value::Map(pairs), last))
}

fn decode_key(seg: &[u8]) -> Result<String, WireError> {
    if seg.is_empty() {
        return Err(WireError::BadMessage);
    }
    String::from_utf8(seg.to_vec()).map_err(|_| WireError::BadMessage)
}

/// Decodes the body of a `$` or `!` segment: bare marker means empty,
/// otherwise a quoted string follows.
fn decode_text(seg: &[u8]) -> Result<String, WireError> {
    if seg.len() == 1 {
        return Ok(String::new());
    }
    crate::protocol::types::unquote(&seg[1..])
}

fn decode_int(seg: &[u8]) -> Result<Value, WireError> {
    if seg.len() == 1 {
        return Ok(Value::Int(0));
    }
    let digits = std::str::from_utf8(&seg[1..]).map_err(|_| WireError::BadMessage)?;
    let n = digits.parse::<i64>().map_err(|_| WireError::BadMessage)?;
    Ok(Value::Int(n))
}

fn decode_size(digits: &[u8]) -> Result<usize, WireError> {
    let digits = std::str::from_utf8(digits).map_err(|_| WireError::BadMessage)?;
    digits.parse::<usize>().map_err(|_| WireError::BadMessage)
}

fn decode_ttl(digits: &[u8]) -> Result<Duration, WireError> {
    if digits.is_empty() {
        return Err(WireError::BadMessage);
    }
    let digits = std::str::from_utf8(digits).map_err(|_| WireError::BadMessage)?;
    // Rejects a leading minus too: a negative TTL makes no sense.
    let nanos = digits.parse::<u64>().map_err(|_| WireError::BadMessage)?;
    Ok(Duration::from_nanos(nanos))
}

/// A cursor over one frame, handing out `\n`/`\r`-delimited segments.
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the next segment and the delimiter that closed it, advancing
    /// past both. Running off the end of the frame is a malformed message.
    fn segment(&mut self) -> Result<(&'a [u8], u8), WireError> {
        let start = self.pos;
        while self.pos < self.buf.len() {
            let b = self.buf[self.pos];
            if b == NL || b == CR {
                let seg = &self.buf[start..self.pos];
                self.pos += 1;
                return Ok((seg, b));
            }
            self.pos += 1;
        }
        Err(WireError::BadMessage)
    }
}
