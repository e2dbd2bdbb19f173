//! RESP protocol value types.

use crate::error::{Error, Result};
use bytes::Bytes;

/// A single RESP2 value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// Simple string: `+OK\r\n`
    SimpleString(String),
    /// Error reply: `-ERR message\r\n`
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    BulkString(Bytes),
    /// Null bulk string or null array: `$-1\r\n`
    Null,
    /// Array: `*2\r\n...`
    Array(Vec<RespValue>),
}

impl RespValue {
    /// Interpret the value as UTF-8 text.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Self::SimpleString(s) => Ok(s),
            Self::BulkString(b) => std::str::from_utf8(b)
                .map_err(|e| Error::Type(format!("invalid UTF-8 in bulk string: {e}"))),
            Self::Null => Err(Error::Type("value is null".into())),
            other => Err(Error::Type(format!("not a string: {other:?}"))),
        }
    }

    /// Interpret the value as an integer. Bulk strings holding decimal text
    /// are accepted, matching how servers report numbers in nested replies.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::BulkString(_) | Self::SimpleString(_) => self
                .as_str()?
                .parse()
                .map_err(|e| Error::Type(format!("not an integer: {e}"))),
            other => Err(Error::Type(format!("not an integer: {other:?}"))),
        }
    }

    /// Interpret the value as raw bytes.
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Self::BulkString(b) => Ok(b),
            Self::SimpleString(s) => Ok(s.as_bytes()),
            Self::Null => Err(Error::Type("value is null".into())),
            other => Err(Error::Type(format!("not bytes: {other:?}"))),
        }
    }

    /// Interpret the value as an array.
    pub fn as_array(&self) -> Result<&[RespValue]> {
        match self {
            Self::Array(items) => Ok(items),
            other => Err(Error::Type(format!("not an array: {other:?}"))),
        }
    }

    /// Whether this is the null value.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this is an error reply.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<&str> for RespValue {
    fn from(s: &str) -> Self {
        Self::BulkString(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for RespValue {
    fn from(s: String) -> Self {
        Self::BulkString(Bytes::from(s.into_bytes()))
    }
}

impl From<i64> for RespValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<Vec<u8>> for RespValue {
    fn from(b: Vec<u8>) -> Self {
        Self::BulkString(Bytes::from(b))
    }
}

impl From<Bytes> for RespValue {
    fn from(b: Bytes) -> Self {
        Self::BulkString(b)
    }
}
