//! RESP2 wire codec.
//!
//! Commands are encoded as flat arrays of bulk strings; replies are decoded
//! incrementally so the connection's read loop can refill its buffer on
//! partial frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use redshard_core::{Error, RespValue, Result};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Encode a command from its parts (name followed by arguments) into a
/// single wire frame.
pub fn encode_command(parts: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + parts.iter().map(Bytes::len).sum::<usize>());
    buf.put_u8(b'*');
    buf.put_slice(itoa(parts.len() as i64).as_bytes());
    buf.put_slice(CRLF);
    for part in parts {
        buf.put_u8(b'$');
        buf.put_slice(itoa(part.len() as i64).as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(part);
        buf.put_slice(CRLF);
    }
    buf.freeze()
}

/// Encode an arbitrary RESP value onto a buffer. Used by test servers and
/// anything that needs to speak the server side of the protocol.
pub fn encode_value(value: &RespValue, buf: &mut BytesMut) {
    match value {
        RespValue::SimpleString(s) => {
            buf.put_u8(b'+');
            buf.put_slice(s.as_bytes());
            buf.put_slice(CRLF);
        }
        RespValue::Error(e) => {
            buf.put_u8(b'-');
            buf.put_slice(e.as_bytes());
            buf.put_slice(CRLF);
        }
        RespValue::Integer(i) => {
            buf.put_u8(b':');
            buf.put_slice(itoa(*i).as_bytes());
            buf.put_slice(CRLF);
        }
        RespValue::BulkString(data) => {
            buf.put_u8(b'$');
            buf.put_slice(itoa(data.len() as i64).as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(data);
            buf.put_slice(CRLF);
        }
        RespValue::Null => buf.put_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            buf.put_u8(b'*');
            buf.put_slice(itoa(items.len() as i64).as_bytes());
            buf.put_slice(CRLF);
            for item in items {
                encode_value(item, buf);
            }
        }
    }
}

fn itoa(i: i64) -> String {
    i.to_string()
}

/// Decode one RESP value from the cursor.
///
/// Returns `Ok(None)` when the buffer holds only a partial frame; the
/// cursor position is unspecified in that case and the caller must retry
/// from the original position after reading more bytes. Framing violations
/// are `Error::Protocol` and poison the stream.
pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    if !buf.has_remaining() {
        return Ok(None);
    }
    let type_byte = buf.chunk()[0];
    buf.advance(1);
    match type_byte {
        b'+' => Ok(read_line(buf)?.map(RespValue::SimpleString)),
        b'-' => Ok(read_line(buf)?.map(RespValue::Error)),
        b':' => match read_line(buf)? {
            Some(line) => Ok(Some(RespValue::Integer(parse_int(&line)?))),
            None => Ok(None),
        },
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(Error::Protocol(format!(
            "invalid RESP type byte 0x{other:02x}"
        ))),
    }
}

fn decode_bulk(buf: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    let len = match read_line(buf)? {
        Some(line) => parse_int(&line)?,
        None => return Ok(None),
    };
    if len == -1 {
        return Ok(Some(RespValue::Null));
    }
    if len < 0 {
        return Err(Error::Protocol(format!("negative bulk length {len}")));
    }
    let len = len as usize;
    if buf.remaining() < len + 2 {
        return Ok(None);
    }
    let start = buf.position() as usize;
    let data = Bytes::copy_from_slice(&buf.get_ref()[start..start + len]);
    buf.advance(len);
    if &buf.chunk()[..2] != CRLF {
        return Err(Error::Protocol("bulk string missing CRLF".into()));
    }
    buf.advance(2);
    Ok(Some(RespValue::BulkString(data)))
}

fn decode_array(buf: &mut Cursor<&[u8]>) -> Result<Option<RespValue>> {
    let len = match read_line(buf)? {
        Some(line) => parse_int(&line)?,
        None => return Ok(None),
    };
    if len == -1 {
        return Ok(Some(RespValue::Null));
    }
    if len < 0 {
        return Err(Error::Protocol(format!("negative array length {len}")));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match decode(buf)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(items)))
}

fn read_line(buf: &mut Cursor<&[u8]>) -> Result<Option<String>> {
    let start = buf.position() as usize;
    let slice = buf.get_ref();
    for i in start..slice.len().saturating_sub(1) {
        if slice[i] == b'\r' {
            if slice[i + 1] != b'\n' {
                return Err(Error::Protocol("bare CR inside line".into()));
            }
            let line = std::str::from_utf8(&slice[start..i])
                .map_err(|e| Error::Protocol(format!("invalid UTF-8 in line: {e}")))?
                .to_string();
            buf.set_position((i + 2) as u64);
            return Ok(Some(line));
        }
    }
    Ok(None)
}

fn parse_int(line: &str) -> Result<i64> {
    line.parse()
        .map_err(|e| Error::Protocol(format!("invalid integer {line:?}: {e}")))
}
