//! Minimal RESP2 codec: commands out as arrays of bulk strings, frames in
//! parsed incrementally from a growing read buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bus::BusError;

/// Maximum array nesting accepted from the server.
const MAX_DEPTH: usize = 32;

/// Largest bulk string accepted, matching the server's default
/// `proto-max-bulk-len`.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// One RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `$-1` decodes to `Bulk(None)`.
    Bulk(Option<Bytes>),
    /// `*-1` decodes to `Array(None)`.
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Contents of a simple or non-null bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.as_bytes()?).ok()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Bulk(None) | Frame::Array(None))
    }
}

/// Append `args` to `dst` as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]], dst: &mut BytesMut) {
    dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched when more bytes are needed.
pub fn parse(buf: &mut BytesMut) -> Result<Option<Frame>, BusError> {
    let mut cursor = 0;
    match parse_frame(&buf[..], &mut cursor, 0)? {
        Some(frame) => {
            buf.advance(cursor);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

fn read_line<'a>(data: &'a [u8], cursor: &mut usize) -> Option<&'a [u8]> {
    let start = *cursor;
    let end = start + data[start..].windows(2).position(|w| w == b"\r\n")?;
    *cursor = end + 2;
    Some(&data[start..end])
}

fn integer(line: &[u8]) -> Result<i64, BusError> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            BusError::Protocol(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn parse_frame(data: &[u8], cursor: &mut usize, depth: usize) -> Result<Option<Frame>, BusError> {
    if depth > MAX_DEPTH {
        return Err(BusError::Protocol("maximum nesting depth exceeded".into()));
    }
    let Some(&kind) = data.get(*cursor) else {
        return Ok(None);
    };
    *cursor += 1;
    let Some(line) = read_line(data, cursor) else {
        return Ok(None);
    };

    let frame = match kind {
        b'+' => Frame::Simple(String::from_utf8_lossy(line).into_owned()),
        b'-' => Frame::Error(String::from_utf8_lossy(line).into_owned()),
        b':' => Frame::Integer(integer(line)?),
        b'$' => {
            let len = integer(line)?;
            if len > MAX_BULK_LEN {
                return Err(BusError::Protocol(format!("bulk length {} too large", len)));
            }
            if len < 0 {
                Frame::Bulk(None)
            } else {
                let start = *cursor;
                let end = start + len as usize;
                if data.len() < end + 2 {
                    return Ok(None);
                }
                if &data[end..end + 2] != b"\r\n" {
                    return Err(BusError::Protocol("missing CRLF after bulk string".into()));
                }
                *cursor = end + 2;
                Frame::Bulk(Some(Bytes::copy_from_slice(&data[start..end])))
            }
        }
        b'*' => {
            let len = integer(line)?;
            if len < 0 {
                Frame::Array(None)
            } else {
                let mut items = Vec::with_capacity((len as usize).min(64));
                for _ in 0..len {
                    match parse_frame(data, cursor, depth + 1)? {
                        Some(item) => items.push(item),
                        None => return Ok(None),
                    }
                }
                Frame::Array(Some(items))
            }
        }
        other => {
            return Err(BusError::Protocol(format!(
                "unexpected type byte {:?}",
                other as char
            )))
        }
    };
    Ok(Some(frame))
}
