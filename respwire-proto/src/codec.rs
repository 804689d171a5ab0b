//! # RESP2 Encoding and Parsing
//!
//! Purpose: Encode client commands and decode server replies without
//! touching a socket, so any transport can drive the codec.
//!
//! ## Design Principles
//! 1. **Cursor-Style Decoding**: `decode` consumes exactly one value and
//!    leaves the rest of the buffer in place.
//! 2. **Need-More-Bytes Is Not An Error**: An incomplete frame returns
//!    `Ok(None)` and consumes nothing, so the caller can read again.
//! 3. **Binary-Safe**: Every command element is a length-prefixed bulk string.
//! 4. **Fail Fast**: An unknown type byte is rejected before waiting for a line.

use bytes::{Buf, Bytes, BytesMut};

use crate::command::Command;
use crate::error::{ProtoResult, ProtocolError};
use crate::reply::Reply;

/// Initial capacity cap for array element vectors; the header count is
/// server-controlled and only trusted once elements actually arrive.
const MAX_PREALLOC_ITEMS: usize = 1024;

/// Encodes a command as a RESP array of bulk strings into `out`.
pub fn encode_command(command: &Command, out: &mut BytesMut) {
    out.reserve(encoded_len(command));
    out.extend_from_slice(b"*");
    push_usize(out, command.len());
    out.extend_from_slice(b"\r\n");
    for arg in command.args() {
        out.extend_from_slice(b"$");
        push_usize(out, arg.len());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

fn encoded_len(command: &Command) -> usize {
    // Header digits are bounded by 20; the estimate only sizes the reserve.
    command
        .args()
        .iter()
        .fold(24, |acc, arg| acc + arg.len() + 26)
}

/// Decodes one reply from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete value; nothing
/// is consumed in that case. On success the decoded bytes are removed.
pub fn decode(buf: &mut BytesMut) -> ProtoResult<Option<Reply>> {
    match decode_slice(buf)? {
        Some((reply, consumed)) => {
            buf.advance(consumed);
            Ok(Some(reply))
        }
        None => Ok(None),
    }
}

/// Decodes one reply from `data`, returning it with the number of bytes used.
pub fn decode_slice(data: &[u8]) -> ProtoResult<Option<(Reply, usize)>> {
    parse_value(data, 0)
}

/// One complete scalar, or the header of an array whose elements follow.
enum Frame {
    Value(Reply),
    Array(usize),
}

fn parse_value(data: &[u8], pos: usize) -> ProtoResult<Option<(Reply, usize)>> {
    let (count, mut cursor) = match parse_frame(data, pos)? {
        Some((Frame::Value(reply), next)) => return Ok(Some((reply, next))),
        Some((Frame::Array(count), next)) => (count, next),
        None => return Ok(None),
    };

    let mut items = Vec::with_capacity(count.min(MAX_PREALLOC_ITEMS));
    for _ in 0..count {
        match parse_value(data, cursor)? {
            Some((item, next)) => {
                items.push(item);
                cursor = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((Reply::Array(Some(items)), cursor)))
}

fn parse_frame(data: &[u8], pos: usize) -> ProtoResult<Option<(Frame, usize)>> {
    let tag = match data.get(pos) {
        Some(&tag) => tag,
        None => return Ok(None),
    };

    let parsed = match tag {
        b'+' => read_line(data, pos + 1)?
            .map(|(line, next)| (Reply::Simple(Bytes::copy_from_slice(line)), next)),
        b'-' => read_line(data, pos + 1)?
            .map(|(line, next)| (Reply::Error(Bytes::copy_from_slice(line)), next)),
        b':' => match read_line(data, pos + 1)? {
            Some((line, next)) => Some((Reply::Integer(parse_i64(line)?), next)),
            None => None,
        },
        b'$' => parse_bulk(data, pos + 1)?,
        b'*' => {
            return match read_line(data, pos + 1)? {
                Some((line, next)) => match parse_len(line)? {
                    Some(count) => Ok(Some((Frame::Array(count), next))),
                    None => Ok(Some((Frame::Value(Reply::Array(None)), next))),
                },
                None => Ok(None),
            }
        }
        other => return Err(ProtocolError::InvalidTypeByte(other)),
    };
    Ok(parsed.map(|(reply, next)| (Frame::Value(reply), next)))
}

fn parse_bulk(data: &[u8], pos: usize) -> ProtoResult<Option<(Reply, usize)>> {
    let (line, start) = match read_line(data, pos)? {
        Some(found) => found,
        None => return Ok(None),
    };
    let len = match parse_len(line)? {
        Some(len) => len,
        None => return Ok(Some((Reply::Bulk(None), start))),
    };

    let end = start + len;
    if data.len() < end + 2 {
        return Ok(None);
    }
    if &data[end..end + 2] != b"\r\n" {
        return Err(ProtocolError::MissingCrlf);
    }
    let payload = Bytes::copy_from_slice(&data[start..end]);
    Ok(Some((Reply::Bulk(Some(payload)), end + 2)))
}

/// Arrays still waiting for elements.
struct PartialArray {
    remaining: usize,
    items: Vec<Reply>,
}

/// Streaming decoder for a socket read loop.
///
/// Unlike [`decode`], completed elements of an unfinished array are consumed
/// from the buffer and kept here, so each read only parses the new bytes.
/// After an error the decoder must be [`reset`](Decoder::reset) along with
/// the buffer.
#[derive(Default)]
pub struct Decoder {
    stack: Vec<PartialArray>,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Decodes the next complete reply from `buf`, consuming what it parses.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtoResult<Option<Reply>> {
        loop {
            let (frame, consumed) = match parse_frame(&buf[..], 0)? {
                Some(found) => found,
                None => return Ok(None),
            };
            buf.advance(consumed);

            let mut value = match frame {
                Frame::Value(reply) => reply,
                Frame::Array(0) => Reply::Array(Some(Vec::new())),
                Frame::Array(count) => {
                    self.stack.push(PartialArray {
                        remaining: count,
                        items: Vec::with_capacity(count.min(MAX_PREALLOC_ITEMS)),
                    });
                    continue;
                }
            };

            // Attach the value to its parent; finished arrays bubble up.
            loop {
                let Some(top) = self.stack.last_mut() else {
                    return Ok(Some(value));
                };
                top.items.push(value);
                top.remaining -= 1;
                if top.remaining > 0 {
                    break;
                }
                let items = std::mem::take(&mut top.items);
                self.stack.pop();
                value = Reply::Array(Some(items));
            }
        }
    }

    /// True while an array is partially decoded.
    pub fn is_mid_frame(&self) -> bool {
        !self.stack.is_empty()
    }

    /// Drops any partial state.
    pub fn reset(&mut self) {
        self.stack.clear();
    }
}

/// Returns the line starting at `start` (without CRLF) and the offset after it.
fn read_line(data: &[u8], start: usize) -> ProtoResult<Option<(&[u8], usize)>> {
    let rest = match data.get(start..) {
        Some(rest) => rest,
        None => return Ok(None),
    };
    match rest.iter().position(|&b| b == b'\n') {
        Some(0) => Err(ProtocolError::MissingCrlf),
        Some(idx) if rest[idx - 1] == b'\r' => Ok(Some((&rest[..idx - 1], start + idx + 1))),
        Some(_) => Err(ProtocolError::MissingCrlf),
        None => Ok(None),
    }
}

/// Parses a bulk/array length; `-1` is the null marker.
fn parse_len(line: &[u8]) -> ProtoResult<Option<usize>> {
    match parse_i64(line)? {
        -1 => Ok(None),
        len if len < -1 => Err(ProtocolError::InvalidLength(len)),
        len => usize::try_from(len)
            .map(Some)
            .map_err(|_| ProtocolError::InvalidLength(len)),
    }
}

fn parse_i64(data: &[u8]) -> ProtoResult<i64> {
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, data),
        None => return Err(ProtocolError::InvalidInteger),
    };
    if digits.is_empty() {
        return Err(ProtocolError::InvalidInteger);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError::InvalidInteger);
        }
        let digit = i64::from(b - b'0');
        // Accumulate toward the sign so i64::MIN still parses.
        value = value
            .checked_mul(10)
            .and_then(|v| if negative { v.checked_sub(digit) } else { v.checked_add(digit) })
            .ok_or(ProtocolError::InvalidInteger)?;
    }
    Ok(value)
}

fn push_usize(out: &mut BytesMut, mut value: usize) {
    // Write digits into a small stack buffer to avoid heap allocations.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    buf[..len].reverse();
    out.extend_from_slice(&buf[..len]);
}
